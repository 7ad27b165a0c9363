use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

use crate::scheduler::job::JobPriority;

/// Heap entry: higher priority first, lower sequence first within a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: JobPriority,
    seq: u64,
    job_id: Uuid,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Waiting room for queued jobs: priority-first, FIFO within a priority band.
///
/// Sequence numbers are assigned monotonically at push time. A job that was
/// popped but could not be placed is pushed back with its original sequence
/// so the FIFO position inside its band is preserved.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job; returns the assigned sequence number.
    pub fn push(&mut self, job_id: Uuid, priority: JobPriority) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority,
            seq,
            job_id,
        });
        seq
    }

    /// Re-enqueue a passed-over job with its original sequence number.
    pub fn push_with_seq(&mut self, job_id: Uuid, priority: JobPriority, seq: u64) {
        self.heap.push(QueueEntry {
            priority,
            seq,
            job_id,
        });
    }

    /// Dequeue the highest-priority, oldest job.
    pub fn pop(&mut self) -> Option<(Uuid, JobPriority, u64)> {
        self.heap.pop().map(|e| (e.job_id, e.priority, e.seq))
    }

    /// Peek at the job that would be dequeued next.
    pub fn peek(&self) -> Option<Uuid> {
        self.heap.peek().map(|e| e.job_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Job ids in dispatch order.
    pub fn snapshot(&self) -> Vec<Uuid> {
        let mut entries = self.heap.clone().into_sorted_vec();
        entries.reverse();
        entries.into_iter().map(|e| e.job_id).collect()
    }
}
