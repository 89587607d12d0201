use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use mappa_coordinator::{CoordinatorConfig, MappingCoordinator, PutMappingRequest};
use mappa_core::{ClusterState, CollectionMetadata, DiscoveryNodes, MappingError, MappingResult, Metadata, Settings};
use mappa_indices::{IndicesService, LocalIndices};
use mappa_store::{ClusterService, ClusterStateUpdateTask, Priority};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mappactl", version, about = "Mappa mapping coordinator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster state file (JSON)
    #[arg(long = "state", global = true, env = "MAPPA_STATE", default_value = "mappa-state.json")]
    state: PathBuf,

    /// Persist the resulting cluster state back to the state file
    #[arg(long = "write", global = true, action = ArgAction::SetTrue)]
    write: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show collections and their recorded mappings
    Show {
        /// Only this collection
        collection: Option<String>,
    },
    /// Create an empty collection
    CreateCollection {
        name: String,
        #[arg(long = "shards", default_value_t = 1)]
        shards: u32,
        #[arg(long = "replicas", default_value_t = 0)]
        replicas: u32,
    },
    /// Put a mapping into one or more collections
    PutMapping {
        /// Target collection (repeatable)
        #[arg(short = 'c', long = "collection", required = true)]
        collections: Vec<String>,
        /// Mapping type; taken from the source's root key when omitted
        #[arg(short = 't', long = "type")]
        type_name: Option<String>,
        /// Mapping source file, `-` for stdin
        #[arg(short = 's', long = "source")]
        source: PathBuf,
        /// Propagate shared field parameters to every type
        #[arg(long = "update-all-types", action = ArgAction::SetTrue)]
        update_all_types: bool,
    },
    /// Rewrite recorded mappings in canonical form
    ///
    /// The CLI holds no live collections, so each type is reparsed from its
    /// recorded source in a transient collection. Only a source whose
    /// canonical form differs is rewritten.
    Refresh {
        collection: String,
        /// Types to refresh (repeatable)
        #[arg(short = 't', long = "type", required = true)]
        types: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MAPPA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MAPPA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MAPPA_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_state(path: &Path, node_id: &str) -> Result<ClusterState> {
    if !path.exists() {
        info!(path = %path.display(), "state file missing, starting from an empty cluster state");
        return Ok(ClusterState::new("mappa", DiscoveryNodes::single(node_id), Metadata::default()));
    }
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let state: ClusterState = serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(state)
}

fn save_state(path: &Path, state: &ClusterState) -> Result<()> {
    let raw = serde_json::to_vec_pretty(state)?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), version = state.version, "cluster state written");
    Ok(())
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading mapping source from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Lowest-priority no-op; once it runs every earlier submission has been applied.
struct Barrier(Option<oneshot::Sender<()>>);

impl ClusterStateUpdateTask for Barrier {
    fn execute(&mut self, current: &Arc<ClusterState>) -> MappingResult<Arc<ClusterState>> { Ok(Arc::clone(current)) }

    fn on_failure(mut self: Box<Self>, _source: &str, _error: MappingError) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }

    fn cluster_state_processed(mut self: Box<Self>, _source: &str, _old: &Arc<ClusterState>, _new: &Arc<ClusterState>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

async fn settle(cluster: &ClusterService) {
    let (tx, rx) = oneshot::channel();
    cluster.submit_state_update_task("barrier", Priority::Languid, Barrier(Some(tx)));
    let _ = rx.await;
}

#[derive(Serialize)]
struct CollectionRow<'a> {
    name: &'a str,
    uuid: &'a str,
    version: u64,
    version_created: String,
    types: Vec<&'a str>,
}

fn print_state(state: &ClusterState, only: Option<&str>, output: Output) -> Result<()> {
    let md = state.metadata();
    let selected: Vec<&Arc<CollectionMetadata>> = match only {
        Some(name) => vec![md.collection(name).with_context(|| format!("no such collection [{}]", name))?],
        None => md.collections().collect(),
    };
    match output {
        Output::Human => {
            println!("cluster state version {} ({} collections)", state.version, md.len());
            for c in selected {
                println!("{} • uuid {} • v{} • created {}", c.name(), c.uuid(), c.version(), c.settings().version_created);
                for (type_name, mapping) in c.mappings() {
                    println!("  {} {}", type_name, mapping.source());
                }
            }
        }
        Output::Json => match only {
            Some(_) => println!("{}", serde_json::to_string_pretty(&selected)?),
            None => {
                let rows: Vec<CollectionRow<'_>> = selected
                    .iter()
                    .map(|c| CollectionRow {
                        name: c.name(),
                        uuid: c.uuid(),
                        version: c.version(),
                        version_created: c.settings().version_created.to_string(),
                        types: c.mappings().keys().map(|k| k.as_str()).collect(),
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        },
    }
    Ok(())
}

fn print_outcome(before: &ClusterState, after: &ClusterState, output: Output) -> Result<()> {
    let changed: Vec<&str> = after
        .metadata()
        .collections()
        .filter(|c| before.metadata().collection(c.name()).map(|b| b.version()) != Some(c.version()))
        .map(|c| c.name())
        .collect();
    match output {
        Output::Human if changed.is_empty() => println!("no change (cluster state version {})", after.version),
        Output::Human => println!("updated {} (cluster state version {})", changed.join(", "), after.version),
        Output::Json => println!("{}", serde_json::json!({ "version": after.version, "changed": changed })),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let node_id = std::env::var("MAPPA_NODE_ID").unwrap_or_else(|_| "node-0".to_string());
    let config = CoordinatorConfig::from_env();
    let loaded = load_state(&cli.state, &node_id)?;

    let initial = match cli.command {
        Commands::Show { ref collection } => return print_state(&loaded, collection.as_deref(), cli.output),
        Commands::CreateCollection { ref name, shards, replicas } => {
            if loaded.metadata().has_collection(name) {
                bail!("collection [{}] already exists", name);
            }
            let settings = Settings { number_of_shards: shards, number_of_replicas: replicas, ..Settings::default() };
            let collection = CollectionMetadata::builder(name.as_str()).settings(settings).build();
            info!(collection = %name, uuid = %collection.uuid(), "collection created");
            let md = Metadata::builder_from(loaded.metadata()).put(collection).build();
            ClusterState::builder_from(&loaded).metadata(md).build()
        }
        _ => loaded.clone(),
    };

    let before = loaded;
    let cluster = ClusterService::start(initial, config.state_queue_cap);
    let indices: Arc<dyn IndicesService> = Arc::new(LocalIndices::new());
    let coordinator = MappingCoordinator::new(cluster.clone(), indices, config);

    match cli.command {
        Commands::Show { .. } | Commands::CreateCollection { .. } => {}
        Commands::PutMapping { collections, type_name, source, update_all_types } => {
            let raw = read_source(&source)?;
            let request = PutMappingRequest::from_bytes(collections, type_name, &raw, update_all_types)?;
            info!(collections = ?request.collections, type_name = ?request.type_name, "put-mapping invoked");
            coordinator.put_mapping_acked(request).await.context("put mapping")?;
        }
        Commands::Refresh { collection, types } => {
            let uuid = match coordinator.state().metadata().collection(&collection) {
                Some(c) => c.uuid().to_string(),
                None => bail!("no such collection [{}]", collection),
            };
            let types: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
            coordinator.refresh_mapping(&collection, &uuid, &types);
            settle(&cluster).await;
        }
    }

    let after = coordinator.state();
    print_outcome(&before, &after, cli.output)?;
    if cli.write {
        save_state(&cli.state, &after)?;
    } else if after.version != before.version {
        warn!("state changed but --write not given; nothing persisted");
    }
    Ok(())
}
