use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use mappa_core::{ClusterState, CollectionMetadata, CollectionMetadataBuilder, MappingError, MappingResult, Metadata, MetadataBuilder};
use mappa_indices::{IndexService, IndicesService};
use mappa_store::ClusterStateUpdateTask;
use metrics::{counter, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::queue::MappingTaskQueue;
use crate::task::{notify_listeners, MappingTask, ProcessedTask, RefreshTask, UpdateTask};
use crate::transient::TransientCollection;

/// Result of one refresh/update cycle.
///
/// `state` is the input `Arc` itself when nothing changed.
#[derive(Debug)]
pub struct BatchOutcome {
    pub state: Arc<ClusterState>,
    pub tasks: Vec<ProcessedTask>,
}

impl BatchOutcome {
    fn unchanged(current: &Arc<ClusterState>, tasks: Vec<ProcessedTask>) -> Self {
        Self { state: Arc::clone(current), tasks }
    }
}

/// Drain the queue and fold every pending task into at most one new state.
pub(crate) fn execute_refresh_or_update(
    indices: &Arc<dyn IndicesService>,
    queue: &MappingTaskQueue,
    current: &Arc<ClusterState>,
    insertion_order: u64,
) -> BatchOutcome {
    let drained = queue.drain_if_due(insertion_order);
    if drained.is_empty() {
        return BatchOutcome::unchanged(current, Vec::new());
    }
    let t0 = Instant::now();
    counter!("mapping_batches_total", 1u64);
    let total = drained.len();

    // group by collection, keeping arrival order within and across groups
    let mut order: Vec<String> = Vec::new();
    let mut groups: FxHashMap<String, Vec<MappingTask>> = FxHashMap::default();
    for task in drained {
        let name = task.collection().to_string();
        groups
            .entry(name)
            .or_insert_with_key(|k| {
                order.push(k.clone());
                Vec::new()
            })
            .push(task);
    }

    let mut md = Metadata::builder_from(current.metadata());
    let mut processed = Vec::with_capacity(total);
    let mut dirty = false;
    for name in order {
        let tasks = groups.remove(&name).unwrap_or_default();
        dirty |= process_collection(indices, current, &mut md, &name, tasks, &mut processed);
    }

    histogram!("mapping_batch_ms", t0.elapsed().as_secs_f64() * 1000.0);
    if !dirty {
        debug!(tasks = total, "mapping batch left cluster state unchanged");
        return BatchOutcome::unchanged(current, processed);
    }
    counter!("mapping_batches_dirty_total", 1u64);
    let state = ClusterState::builder_from(current).metadata(md.build()).build();
    BatchOutcome { state: Arc::new(state), tasks: processed }
}

fn process_collection(
    indices: &Arc<dyn IndicesService>,
    current: &ClusterState,
    md: &mut MetadataBuilder,
    name: &str,
    tasks: Vec<MappingTask>,
    processed: &mut Vec<ProcessedTask>,
) -> bool {
    let Some(recorded) = md.get(name).cloned() else {
        debug!(collection = %name, tasks = tasks.len(), "ignoring mapping tasks, collection metadata doesn't exist");
        counter!("mapping_stale_tasks_total", tasks.len() as u64);
        processed.extend(tasks.into_iter().map(|t| ProcessedTask::failed(t, MappingError::CollectionNotFound(name.to_string()))));
        return false;
    };

    let mut live = Vec::with_capacity(tasks.len());
    for task in tasks {
        if recorded.is_same_uuid(task.collection_uuid()) {
            live.push(task);
            continue;
        }
        debug!(collection = %name, task_uuid = %task.collection_uuid(), uuid = %recorded.uuid(), "ignoring mapping task from a previous collection incarnation");
        counter!("mapping_stale_tasks_total", 1u64);
        let err = MappingError::StaleCollection {
            collection: name.to_string(),
            expected: task.collection_uuid().to_string(),
            actual: recorded.uuid().to_string(),
        };
        processed.push(ProcessedTask::failed(task, err));
    }
    if live.is_empty() {
        return false;
    }

    let (svc, _guard) = match indices.index_service(name) {
        Some(svc) => (svc, None),
        None => match materialize(indices, current.local_node_id(), &recorded, &live) {
            Ok((svc, guard)) => (svc, Some(guard)),
            Err(e) => {
                warn!(collection = %name, error = %e, "failed to materialize collection for mapping processing");
                processed.extend(live.into_iter().map(|t| ProcessedTask::failed(t, e.clone())));
                return false;
            }
        },
    };

    let mut builder = CollectionMetadata::builder_from(&recorded);
    let dirty = process_mapping_tasks(&svc, &mut builder, live, processed);
    if dirty {
        md.insert(builder.build());
    }
    dirty
}

/// Create the collection locally and load the recorded mappings the tasks touch.
fn materialize(
    indices: &Arc<dyn IndicesService>,
    local_node_id: &str,
    recorded: &CollectionMetadata,
    tasks: &[MappingTask],
) -> MappingResult<(Arc<IndexService>, TransientCollection)> {
    let name = recorded.name();
    let svc = indices.create_index(recorded, local_node_id).map_err(|e| match e {
        e @ MappingError::TransientResource { .. } => e,
        other => MappingError::transient(name, other),
    })?;
    let guard = TransientCollection::new(Arc::clone(indices), name);
    let types: BTreeSet<&str> = tasks.iter().flat_map(|t| t.types()).collect();
    for type_name in types {
        if let Some(mapping) = recorded.mapping(type_name) {
            svc.load_recorded(type_name, mapping.source(), true)
                .map_err(|e| MappingError::transient(name, format!("failed to load mapping [{}]: {}", type_name, e)))?;
        }
    }
    Ok((svc, guard))
}

fn process_mapping_tasks(
    svc: &IndexService,
    builder: &mut CollectionMetadataBuilder,
    tasks: Vec<MappingTask>,
    processed: &mut Vec<ProcessedTask>,
) -> bool {
    let mut dirty = false;
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for task in tasks {
        match task {
            MappingTask::Refresh(refresh) => {
                dirty |= apply_refresh(svc, builder, &refresh, &mut seen);
                processed.push(ProcessedTask::ok(MappingTask::Refresh(refresh)));
            }
            MappingTask::Update(update) => match apply_update(svc, builder, &update, &mut seen) {
                Ok(changed) => {
                    dirty |= changed;
                    processed.push(ProcessedTask::ok(MappingTask::Update(update)));
                }
                Err(e) => {
                    warn!(collection = %update.collection, type_name = %update.type_name, error = %e, "failed to update mapping in cluster state");
                    if matches!(e, MappingError::MergeConflict(_)) {
                        counter!("mapping_conflicts_total", 1u64);
                    }
                    processed.push(ProcessedTask::failed(MappingTask::Update(update), e));
                }
            },
        }
    }
    dirty
}

fn apply_refresh(svc: &IndexService, builder: &mut CollectionMetadataBuilder, task: &RefreshTask, seen: &mut FxHashSet<String>) -> bool {
    let mut resynced = Vec::new();
    for type_name in &task.types {
        if seen.contains(type_name) {
            continue;
        }
        let Some(mapper) = svc.document_mapper(type_name) else { continue };
        let live = mapper.to_metadata();
        if builder.mapping(type_name) != Some(&live) {
            builder.insert_mapping(live);
            resynced.push(type_name.as_str());
        }
        seen.insert(type_name.clone());
    }
    if resynced.is_empty() {
        return false;
    }
    warn!(collection = %task.collection, types = ?resynced, "re-syncing mappings with cluster state");
    true
}

fn apply_update(
    svc: &IndexService,
    builder: &mut CollectionMetadataBuilder,
    task: &UpdateTask,
    seen: &mut FxHashSet<String>,
) -> MappingResult<bool> {
    let type_name = task.type_name.as_str();
    if builder.mapping(type_name).map(|m| m.source()) == Some(&task.source) {
        debug!(collection = %task.collection, type_name = %type_name, "update mapping ignored, source unchanged");
        seen.insert(type_name.to_string());
        return Ok(false);
    }
    let merged = svc.merge(type_name, &task.source, false, true)?;
    seen.insert(type_name.to_string());
    if builder.mapping(type_name).map(|m| m.source()) == Some(merged.mapping_source()) {
        debug!(collection = %task.collection, type_name = %type_name, "update mapping merged into the recorded source");
        return Ok(false);
    }
    info!(
        collection = %task.collection,
        type_name = %type_name,
        origin = task.origin_node.as_deref().unwrap_or("-"),
        "update mapping (dynamic)"
    );
    debug!(collection = %task.collection, type_name = %type_name, source = %merged.mapping_source(), "updated mapping source");
    builder.insert_mapping(merged.to_metadata());
    Ok(true)
}

/// State-update task that drains the mapping queue when it runs.
pub(crate) struct RefreshOrUpdateCycle {
    pub(crate) indices: Arc<dyn IndicesService>,
    pub(crate) queue: Arc<MappingTaskQueue>,
    pub(crate) insertion_order: u64,
    pub(crate) drained: Vec<ProcessedTask>,
}

impl ClusterStateUpdateTask for RefreshOrUpdateCycle {
    fn execute(&mut self, current: &Arc<ClusterState>) -> MappingResult<Arc<ClusterState>> {
        let outcome = execute_refresh_or_update(&self.indices, &self.queue, current, self.insertion_order);
        self.drained = outcome.tasks;
        Ok(outcome.state)
    }

    fn on_failure(self: Box<Self>, source: &str, error: MappingError) {
        warn!(source = %source, error = %error, pending = self.queue.len(), "failure during mapping cycle");
        let mut drained = self.drained;
        if drained.is_empty() {
            // never executed, e.g. rejected at submission; fail what this cycle would have drained
            drained = self
                .queue
                .drain_if_due(self.insertion_order)
                .into_iter()
                .map(|task| ProcessedTask::failed(task, error.clone()))
                .collect();
        }
        notify_listeners(drained, Err(&error));
    }

    fn cluster_state_processed(self: Box<Self>, _source: &str, _old: &Arc<ClusterState>, _new: &Arc<ClusterState>) {
        notify_listeners(self.drained, Ok(()));
    }
}
