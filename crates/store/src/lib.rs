//! Mappa store: the single writer of cluster state.
//!
//! Update tasks are submitted from any thread and executed one at a time by a
//! spawned loop, highest priority first and FIFO within a priority. Each
//! accepted state is published through an `ArcSwap` and its version is
//! broadcast on a `watch` channel.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use mappa_core::{ClusterState, MappingError, MappingResult};
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Execution priority of a submitted update. Earlier variants run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Immediate,
    Urgent,
    High,
    Normal,
    Low,
    Languid,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::Immediate => 5,
            Priority::Urgent => 4,
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
            Priority::Languid => 0,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(Priority::Immediate),
            "urgent" => Ok(Priority::Urgent),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "languid" => Ok(Priority::Languid),
            other => Err(format!("unknown priority [{}]", other)),
        }
    }
}

/// A unit of work run against the current cluster state by the single writer.
///
/// `execute` returns the next state; returning the same `Arc` means "no change"
/// and nothing is published. Exactly one of `on_failure` or
/// `cluster_state_processed` is called afterwards.
pub trait ClusterStateUpdateTask: Send + 'static {
    fn execute(&mut self, current: &Arc<ClusterState>) -> MappingResult<Arc<ClusterState>>;

    fn on_failure(self: Box<Self>, source: &str, error: MappingError);

    fn cluster_state_processed(self: Box<Self>, _source: &str, _old: &Arc<ClusterState>, _new: &Arc<ClusterState>) {}
}

struct Submission {
    source: String,
    priority: Priority,
    seq: u64,
    task: Box<dyn ClusterStateUpdateTask>,
}

impl PartialEq for Submission {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == Ordering::Equal }
}

impl Eq for Submission {}

impl PartialOrd for Submission {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for Submission {
    // Max-heap: higher priority wins, then the older submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.rank().cmp(&other.priority.rank()).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Read side: the last published state and its version stream.
#[derive(Clone)]
pub struct ClusterStateHandle {
    snap: Arc<ArcSwap<ClusterState>>,
    version_rx: watch::Receiver<u64>,
}

impl ClusterStateHandle {
    pub fn current(&self) -> Arc<ClusterState> { self.snap.load_full() }
    pub fn subscribe_version(&self) -> watch::Receiver<u64> { self.version_rx.clone() }
}

/// Write side: submit update tasks to the single writer loop.
#[derive(Clone)]
pub struct ClusterService {
    tx: mpsc::Sender<Submission>,
    seq: Arc<AtomicU64>,
    handle: ClusterStateHandle,
}

impl ClusterService {
    /// Spawn the writer loop on the current tokio runtime.
    pub fn start(initial: ClusterState, queue_cap: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Submission>(queue_cap.max(1));
        let (version_tx, version_rx) = watch::channel(initial.version);
        let snap = Arc::new(ArcSwap::from_pointee(initial));
        let snap_clone = Arc::clone(&snap);

        tokio::spawn(async move {
            let mut pending: BinaryHeap<Submission> = BinaryHeap::new();
            loop {
                if pending.is_empty() {
                    match rx.recv().await {
                        Some(s) => pending.push(s),
                        None => break,
                    }
                }
                while let Ok(s) = rx.try_recv() {
                    pending.push(s);
                }
                if let Some(sub) = pending.pop() {
                    run_submission(&snap_clone, &version_tx, sub);
                }
            }
            info!("cluster state loop stopped");
        });

        Self { tx, seq: Arc::new(AtomicU64::new(0)), handle: ClusterStateHandle { snap, version_rx } }
    }

    pub fn state(&self) -> Arc<ClusterState> { self.handle.current() }
    pub fn handle(&self) -> ClusterStateHandle { self.handle.clone() }

    /// Queue `task`. Rejections are reported through the task's own `on_failure`.
    pub fn submit_state_update_task<T: ClusterStateUpdateTask>(&self, source: impl Into<String>, priority: Priority, task: T) {
        let source = source.into();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(source = %source, ?priority, seq, "state update submitted");
        let sub = Submission { source, priority, seq, task: Box::new(task) };
        if let Err(e) = self.tx.try_send(sub) {
            let (sub, error) = match e {
                mpsc::error::TrySendError::Full(sub) => {
                    let err = MappingError::Rejected(sub.source.clone());
                    (sub, err)
                }
                mpsc::error::TrySendError::Closed(sub) => (sub, MappingError::Closed),
            };
            counter!("cluster_state_rejected_total", 1u64);
            warn!(source = %sub.source, error = %error, "state update not queued");
            sub.task.on_failure(&sub.source, error);
        }
    }
}

fn run_submission(snap: &ArcSwap<ClusterState>, version_tx: &watch::Sender<u64>, sub: Submission) {
    let Submission { source, mut task, .. } = sub;
    let t0 = Instant::now();
    let old = snap.load_full();
    let new = match task.execute(&old) {
        Ok(new) => new,
        Err(e) => {
            counter!("cluster_state_update_failures_total", 1u64);
            debug!(source = %source, error = %e, "state update failed");
            task.on_failure(&source, e);
            return;
        }
    };
    counter!("cluster_state_updates_total", 1u64);
    if Arc::ptr_eq(&new, &old) {
        debug!(source = %source, version = old.version, "state update made no change");
        task.cluster_state_processed(&source, &old, &new);
        return;
    }
    if new.version <= old.version {
        warn!(source = %source, old = old.version, new = new.version, "rejecting state that does not advance the version");
        task.on_failure(&source, MappingError::IllegalArgument(format!("state version must advance past {}", old.version)));
        return;
    }
    snap.store(Arc::clone(&new));
    let _ = version_tx.send(new.version);
    counter!("cluster_state_publish_total", 1u64);
    histogram!("cluster_state_update_ms", t0.elapsed().as_secs_f64() * 1000.0);
    info!(source = %source, version = new.version, "cluster state published");
    task.cluster_state_processed(&source, &old, &new);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("languid".parse::<Priority>(), Ok(Priority::Languid));
        assert!("soon".parse::<Priority>().is_err());
    }

    #[test]
    fn rank_orders_immediate_first() {
        assert!(Priority::Immediate.rank() > Priority::Urgent.rank());
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Low.rank() > Priority::Languid.rank());
    }
}
