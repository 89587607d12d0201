use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::Metadata;

/// Node membership as seen by the local node. Routing proper lives elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    pub local_node_id: String,
    #[serde(default)]
    pub master_node_id: Option<String>,
    #[serde(default)]
    pub nodes: SmallVec<[String; 4]>,
}

impl DiscoveryNodes {
    /// Single-node membership where the local node is also master.
    pub fn single(node_id: impl Into<String>) -> Self {
        let id = node_id.into();
        let mut nodes = SmallVec::new();
        nodes.push(id.clone());
        Self { local_node_id: id.clone(), master_node_id: Some(id), nodes }
    }

    pub fn is_local_master(&self) -> bool { self.master_node_id.as_deref() == Some(self.local_node_id.as_str()) }
}

/// Immutable, versioned snapshot of cluster-wide metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub state_uuid: String,
    pub cluster_name: String,
    pub nodes: DiscoveryNodes,
    pub metadata: Arc<Metadata>,
}

impl ClusterState {
    pub fn new(cluster_name: impl Into<String>, nodes: DiscoveryNodes, metadata: Metadata) -> Self {
        Self {
            version: 0,
            state_uuid: uuid::Uuid::new_v4().to_string(),
            cluster_name: cluster_name.into(),
            nodes,
            metadata: Arc::new(metadata),
        }
    }

    pub fn builder_from(existing: &ClusterState) -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: existing.version,
            cluster_name: existing.cluster_name.clone(),
            nodes: existing.nodes.clone(),
            metadata: Arc::clone(&existing.metadata),
        }
    }

    pub fn metadata(&self) -> &Metadata { &self.metadata }
    pub fn local_node_id(&self) -> &str { &self.nodes.local_node_id }
}

pub struct ClusterStateBuilder {
    version: u64,
    cluster_name: String,
    nodes: DiscoveryNodes,
    metadata: Arc<Metadata>,
}

impl ClusterStateBuilder {
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = nodes;
        self
    }

    /// Next state: version bumped, fresh state uuid.
    pub fn build(self) -> ClusterState {
        ClusterState {
            version: self.version + 1,
            state_uuid: uuid::Uuid::new_v4().to_string(),
            cluster_name: self.cluster_name,
            nodes: self.nodes,
            metadata: self.metadata,
        }
    }
}
