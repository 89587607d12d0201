use std::sync::{Mutex, PoisonError};

use crate::task::MappingTask;

#[derive(Debug, Default)]
struct QueueState {
    tasks: Vec<MappingTask>,
    insertion_order: u64,
    processed_order: u64,
}

/// Pending refresh/update tasks, stamped with an insertion sequence number.
///
/// Any thread may enqueue. Draining happens inside a state-update cycle. A
/// cycle whose sequence number is below the processed order was already
/// covered by an earlier drain and gets nothing.
#[derive(Debug, Default)]
pub struct MappingTaskQueue {
    state: Mutex<QueueState>,
}

impl MappingTaskQueue {
    pub fn new() -> Self { Self::default() }

    /// Append `task`, returning its sequence number.
    pub fn enqueue(&self, task: MappingTask) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.insertion_order += 1;
        state.tasks.push(task);
        state.insertion_order
    }

    /// Take every pending task unless the queue is empty or `sequence` is stale.
    pub fn drain_if_due(&self, sequence: u64) -> Vec<MappingTask> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.tasks.is_empty() || sequence < state.processed_order {
            return Vec::new();
        }
        state.processed_order = state.insertion_order;
        std::mem::take(&mut state.tasks)
    }

    pub fn len(&self) -> usize { self.state.lock().unwrap_or_else(PoisonError::into_inner).tasks.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RefreshTask;

    fn refresh(collection: &str) -> MappingTask {
        MappingTask::Refresh(RefreshTask { collection: collection.into(), collection_uuid: "u1".into(), types: vec!["doc".into()] })
    }

    #[test]
    fn sequence_numbers_increase() {
        let q = MappingTaskQueue::new();
        assert_eq!(q.enqueue(refresh("a")), 1);
        assert_eq!(q.enqueue(refresh("b")), 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drain_takes_everything_in_arrival_order() {
        let q = MappingTaskQueue::new();
        q.enqueue(refresh("a"));
        let seq = q.enqueue(refresh("b"));
        let drained = q.drain_if_due(seq);
        assert_eq!(drained.iter().map(|t| t.collection()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(q.is_empty());
        assert!(q.drain_if_due(seq).is_empty());
    }

    #[test]
    fn stale_sequence_is_skipped() {
        let q = MappingTaskQueue::new();
        let first = q.enqueue(refresh("a"));
        let second = q.enqueue(refresh("b"));
        // the cycle for `second` drains both
        assert_eq!(q.drain_if_due(second).len(), 2);
        let third = q.enqueue(refresh("c"));
        // the retried cycle for `first` is older than the last drain
        assert!(q.drain_if_due(first).is_empty());
        assert_eq!(q.len(), 1);
        // a cycle at the processed order itself is still due
        assert_eq!(q.drain_if_due(second).len(), 1);
        assert!(third > second);
    }

    #[test]
    fn concurrent_enqueues_get_unique_sequences_and_one_drain_takes_all() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;
        let q = MappingTaskQueue::new();
        let mut seqs: Vec<u64> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let q = &q;
                    scope.spawn(move || {
                        let name = format!("c{}", p);
                        let mine: Vec<u64> = (0..PER_PRODUCER).map(|_| q.enqueue(refresh(&name))).collect();
                        // each producer sees its own sequence numbers strictly increasing
                        assert!(mine.windows(2).all(|w| w[0] < w[1]));
                        mine
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        let total = PRODUCERS * PER_PRODUCER;
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), total);
        assert_eq!(seqs, (1..=total as u64).collect::<Vec<_>>());

        let drained = q.drain_if_due(total as u64);
        assert_eq!(drained.len(), total);
        for p in 0..PRODUCERS {
            let name = format!("c{}", p);
            assert_eq!(drained.iter().filter(|t| t.collection() == name).count(), PER_PRODUCER);
        }
        assert!(q.is_empty());
    }
}
