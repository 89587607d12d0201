use std::fmt;

use mappa_core::{MappingError, MappingResult, MappingSource};

/// Terminal answer delivered to a mapping listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterStateUpdateResponse {
    pub acknowledged: bool,
}

/// Called exactly once with the outcome of a put or update.
pub type AckListener = Box<dyn FnOnce(MappingResult<ClusterStateUpdateResponse>) + Send + 'static>;

/// Re-derive the recorded mappings of `types` from the live mapper service.
#[derive(Debug, Clone)]
pub struct RefreshTask {
    pub collection: String,
    pub collection_uuid: String,
    pub types: Vec<String>,
}

/// Merge `source` into the mapping of `type_name`.
pub struct UpdateTask {
    pub collection: String,
    pub collection_uuid: String,
    pub type_name: String,
    pub source: MappingSource,
    /// Node that reported the change, when known.
    pub origin_node: Option<String>,
    pub listener: AckListener,
}

impl fmt::Debug for UpdateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateTask")
            .field("collection", &self.collection)
            .field("collection_uuid", &self.collection_uuid)
            .field("type_name", &self.type_name)
            .field("origin_node", &self.origin_node)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum MappingTask {
    Refresh(RefreshTask),
    Update(UpdateTask),
}

impl MappingTask {
    pub fn collection(&self) -> &str {
        match self {
            MappingTask::Refresh(t) => &t.collection,
            MappingTask::Update(t) => &t.collection,
        }
    }

    pub fn collection_uuid(&self) -> &str {
        match self {
            MappingTask::Refresh(t) => &t.collection_uuid,
            MappingTask::Update(t) => &t.collection_uuid,
        }
    }

    /// Types this task reads or writes.
    pub fn types(&self) -> Vec<&str> {
        match self {
            MappingTask::Refresh(t) => t.types.iter().map(|s| s.as_str()).collect(),
            MappingTask::Update(t) => vec![t.type_name.as_str()],
        }
    }
}

/// A drained task and, when its processing failed, why.
#[derive(Debug)]
pub struct ProcessedTask {
    pub task: MappingTask,
    pub failure: Option<MappingError>,
}

impl ProcessedTask {
    pub fn ok(task: MappingTask) -> Self { Self { task, failure: None } }
    pub fn failed(task: MappingTask, error: MappingError) -> Self { Self { task, failure: Some(error) } }
    pub fn is_failed(&self) -> bool { self.failure.is_some() }
}

/// Answer every update listener of a batch. A failed commit overrides per-task success.
pub(crate) fn notify_listeners(tasks: Vec<ProcessedTask>, commit: Result<(), &MappingError>) {
    for processed in tasks {
        let MappingTask::Update(update) = processed.task else { continue };
        let outcome = match (commit, processed.failure) {
            (Err(e), _) => Err(e.clone()),
            (Ok(()), Some(failure)) => Err(failure),
            (Ok(()), None) => Ok(ClusterStateUpdateResponse { acknowledged: true }),
        };
        (update.listener)(outcome);
    }
}
