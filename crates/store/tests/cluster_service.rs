use std::sync::{Arc, Mutex};

use mappa_core::{ClusterState, CollectionMetadata, DiscoveryNodes, MappingError, MappingResult, Metadata};
use mappa_store::{ClusterService, ClusterStateUpdateTask, Priority};
use tokio::sync::oneshot;

type Outcome = Result<(u64, u64), MappingError>;

struct Scripted {
    label: &'static str,
    add_collection: Option<&'static str>,
    fail: bool,
    log: Arc<Mutex<Vec<&'static str>>>,
    done: Option<oneshot::Sender<Outcome>>,
}

impl Scripted {
    fn new(label: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { label, add_collection: None, fail: false, log: Arc::clone(log), done: Some(tx) }, rx)
    }
}

impl ClusterStateUpdateTask for Scripted {
    fn execute(&mut self, current: &Arc<ClusterState>) -> MappingResult<Arc<ClusterState>> {
        self.log.lock().unwrap().push(self.label);
        if self.fail {
            return Err(MappingError::IllegalArgument(self.label.to_string()));
        }
        match self.add_collection {
            Some(name) => {
                let md = Metadata::builder_from(current.metadata()).put(CollectionMetadata::builder(name).build()).build();
                Ok(Arc::new(ClusterState::builder_from(current).metadata(md).build()))
            }
            None => Ok(Arc::clone(current)),
        }
    }

    fn on_failure(mut self: Box<Self>, _source: &str, error: MappingError) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn cluster_state_processed(mut self: Box<Self>, _source: &str, old: &Arc<ClusterState>, new: &Arc<ClusterState>) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(Ok((old.version, new.version)));
        }
    }
}

fn initial() -> ClusterState { ClusterState::new("test", DiscoveryNodes::single("n1"), Metadata::default()) }

#[tokio::test]
async fn publishes_new_state_and_broadcasts_version() {
    let svc = ClusterService::start(initial(), 16);
    let mut versions = svc.handle().subscribe_version();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut scripted, rx) = Scripted::new("add", &log);
    scripted.add_collection = Some("idx");
    svc.submit_state_update_task("add-collection", Priority::Normal, scripted);

    assert_eq!(rx.await.unwrap(), Ok((0, 1)));
    versions.changed().await.unwrap();
    assert_eq!(*versions.borrow(), 1);
    assert!(svc.state().metadata().has_collection("idx"));
}

#[tokio::test]
async fn unchanged_state_is_not_published() {
    let svc = ClusterService::start(initial(), 16);
    let before = svc.state();
    let log = Arc::new(Mutex::new(Vec::new()));
    let (scripted, rx) = Scripted::new("noop", &log);
    svc.submit_state_update_task("noop", Priority::Normal, scripted);
    assert_eq!(rx.await.unwrap(), Ok((0, 0)));
    assert!(Arc::ptr_eq(&before, &svc.state()));
}

#[tokio::test]
async fn failures_reach_the_task() {
    let svc = ClusterService::start(initial(), 16);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (mut scripted, rx) = Scripted::new("boom", &log);
    scripted.fail = true;
    svc.submit_state_update_task("boom", Priority::Normal, scripted);
    assert_eq!(rx.await.unwrap(), Err(MappingError::IllegalArgument("boom".into())));
    assert_eq!(svc.state().version, 0);
}

#[tokio::test]
async fn higher_priority_runs_first() {
    // current-thread runtime: the writer loop only runs once we await, so all three are pending together
    let svc = ClusterService::start(initial(), 16);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (low, low_rx) = Scripted::new("low", &log);
    let (high, high_rx) = Scripted::new("high", &log);
    let (immediate, immediate_rx) = Scripted::new("immediate", &log);
    svc.submit_state_update_task("low", Priority::Low, low);
    svc.submit_state_update_task("high", Priority::High, high);
    svc.submit_state_update_task("immediate", Priority::Immediate, immediate);
    low_rx.await.unwrap().unwrap();
    high_rx.await.unwrap().unwrap();
    immediate_rx.await.unwrap().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["immediate", "high", "low"]);
}

#[tokio::test]
async fn full_queue_rejects_through_on_failure() {
    let svc = ClusterService::start(initial(), 1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (first, first_rx) = Scripted::new("first", &log);
    let (second, second_rx) = Scripted::new("second", &log);
    svc.submit_state_update_task("first", Priority::Normal, first);
    svc.submit_state_update_task("second", Priority::Normal, second);
    assert_eq!(second_rx.await.unwrap(), Err(MappingError::Rejected("second".into())));
    first_rx.await.unwrap().unwrap();
}
