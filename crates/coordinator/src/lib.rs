//! Mappa coordinator: keeps the mappings recorded in cluster state in step with the live mapper services.
//!
//! Refresh and update tasks are queued and folded into one state change per
//! cycle. Put-mapping requests run as their own state-update task and apply
//! to every targeted collection or to none.

#![forbid(unsafe_code)]

pub mod batch;
pub mod config;
pub mod put;
pub mod queue;
pub mod task;
mod transient;

use std::sync::Arc;

use mappa_core::{ClusterState, MappingError, MappingResult, MappingSource};
use mappa_indices::IndicesService;
use mappa_store::ClusterService;
use metrics::counter;
use tokio::sync::oneshot;
use tracing::debug;

pub use batch::BatchOutcome;
pub use config::CoordinatorConfig;
pub use put::PutMappingRequest;
pub use queue::MappingTaskQueue;
pub use task::{AckListener, ClusterStateUpdateResponse, MappingTask, ProcessedTask, RefreshTask, UpdateTask};

use batch::RefreshOrUpdateCycle;
use put::PutMappingCycle;

/// Entry point for every mapping change on the master.
#[derive(Clone)]
pub struct MappingCoordinator {
    cluster: ClusterService,
    indices: Arc<dyn IndicesService>,
    queue: Arc<MappingTaskQueue>,
    config: CoordinatorConfig,
}

impl MappingCoordinator {
    pub fn new(cluster: ClusterService, indices: Arc<dyn IndicesService>, config: CoordinatorConfig) -> Self {
        Self { cluster, indices, queue: Arc::new(MappingTaskQueue::new()), config }
    }

    pub fn config(&self) -> &CoordinatorConfig { &self.config }
    pub fn queue(&self) -> &MappingTaskQueue { &self.queue }
    pub fn state(&self) -> Arc<ClusterState> { self.cluster.state() }
    pub fn indices(&self) -> &Arc<dyn IndicesService> { &self.indices }

    /// Ask for the recorded mappings of `types` to be re-derived from the live mapper service.
    pub fn refresh_mapping(&self, collection: &str, collection_uuid: &str, types: &[&str]) {
        let task = RefreshTask {
            collection: collection.to_string(),
            collection_uuid: collection_uuid.to_string(),
            types: types.iter().map(|t| t.to_string()).collect(),
        };
        self.enqueue_and_submit(format!("refresh-mapping [{}]{:?}", collection, types), MappingTask::Refresh(task));
    }

    /// Merge a mapping change reported by `origin_node` into cluster state.
    pub fn update_mapping(
        &self,
        collection: &str,
        collection_uuid: &str,
        type_name: &str,
        source: MappingSource,
        origin_node: Option<String>,
        listener: AckListener,
    ) {
        let task = UpdateTask {
            collection: collection.to_string(),
            collection_uuid: collection_uuid.to_string(),
            type_name: type_name.to_string(),
            source,
            origin_node,
            listener,
        };
        self.enqueue_and_submit(format!("update-mapping [{}][{}]", collection, type_name), MappingTask::Update(task));
    }

    /// Apply an explicit mapping change. `listener` sees the outcome once the state is published.
    pub fn put_mapping(&self, request: PutMappingRequest, listener: AckListener) {
        let source = format!(
            "put-mapping [{}] type [{}]",
            request.collections.join(","),
            request.type_name.as_deref().unwrap_or("?")
        );
        let cycle = PutMappingCycle { indices: Arc::clone(&self.indices), request, listener };
        self.cluster.submit_state_update_task(source, self.config.priority, cycle);
    }

    pub async fn put_mapping_acked(&self, request: PutMappingRequest) -> MappingResult<ClusterStateUpdateResponse> {
        let (tx, rx) = oneshot::channel();
        self.put_mapping(request, ack_sender(tx));
        rx.await.map_err(|_| MappingError::Closed)?
    }

    pub async fn update_mapping_acked(
        &self,
        collection: &str,
        collection_uuid: &str,
        type_name: &str,
        source: MappingSource,
        origin_node: Option<String>,
    ) -> MappingResult<ClusterStateUpdateResponse> {
        let (tx, rx) = oneshot::channel();
        self.update_mapping(collection, collection_uuid, type_name, source, origin_node, ack_sender(tx));
        rx.await.map_err(|_| MappingError::Closed)?
    }

    /// Drain the queue against `current` without submitting a cycle.
    ///
    /// Listeners of drained update tasks are not called; they travel back in
    /// the outcome.
    pub fn execute_refresh_or_update(&self, current: &Arc<ClusterState>, insertion_order: u64) -> BatchOutcome {
        batch::execute_refresh_or_update(&self.indices, &self.queue, current, insertion_order)
    }

    /// Apply `request` to `current` without submitting it.
    pub fn execute_put_mapping(&self, current: &Arc<ClusterState>, request: &PutMappingRequest) -> MappingResult<Arc<ClusterState>> {
        put::execute_put_mapping(&self.indices, current, request)
    }

    fn enqueue_and_submit(&self, source: String, task: MappingTask) {
        let insertion_order = self.queue.enqueue(task);
        counter!("mapping_tasks_enqueued_total", 1u64);
        debug!(source = %source, insertion_order, "mapping task queued");
        let cycle = RefreshOrUpdateCycle {
            indices: Arc::clone(&self.indices),
            queue: Arc::clone(&self.queue),
            insertion_order,
            drained: Vec::new(),
        };
        self.cluster.submit_state_update_task(source, self.config.priority, cycle);
    }
}

fn ack_sender(tx: oneshot::Sender<MappingResult<ClusterStateUpdateResponse>>) -> AckListener {
    Box::new(move |outcome| {
        let _ = tx.send(outcome);
    })
}
