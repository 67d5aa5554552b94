//! Priority work queue with in-flight and terminal accounting

use finflow_common::{TaskId, TaskPriority, TaskStatus};
use priority_queue::PriorityQueue;
use std::collections::HashSet;

/// Dequeue rank: higher priority first, FIFO within a priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRank {
    priority: TaskPriority,
    seq: u64,
}

impl Ord for QueueRank {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // The queue pops the maximum rank: lower priority ordinal wins,
        // then earlier admission wins.
        match other.priority.cmp(&self.priority) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueueRank {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Queue statistics.
///
/// The accounting identity holds at every observation:
/// `queued + running + suspended + completed + failed + cancelled == admitted`,
/// where `suspended` counts tasks paused or sleeping out a retry backoff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued_by_priority: [usize; 5],
    pub running: usize,
    pub suspended: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_admitted: usize,
}

impl QueueStats {
    pub fn queued(&self) -> usize {
        self.queued_by_priority.iter().sum()
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// Fingerprint invariant from the queue design
    pub fn balanced(&self) -> bool {
        self.queued() + self.running + self.suspended + self.terminal() == self.total_admitted
    }
}

/// Multi-level priority work queue.
///
/// Not internally locked: the task manager serializes access under its
/// coarse state lock.
pub struct WorkQueue {
    queue: PriorityQueue<TaskId, QueueRank>,
    running: HashSet<TaskId>,
    max_concurrent: usize,
    next_seq: u64,
    stats: QueueStats,
}

impl WorkQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queue: PriorityQueue::new(),
            running: HashSet::new(),
            max_concurrent,
            next_seq: 0,
            stats: QueueStats::default(),
        }
    }

    fn rank(&mut self, priority: TaskPriority) -> QueueRank {
        let rank = QueueRank {
            priority,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        rank
    }

    /// First admission of a task
    pub fn admit(&mut self, task_id: TaskId, priority: TaskPriority) {
        let rank = self.rank(priority);
        self.queue.push(task_id, rank);
        self.stats.total_admitted += 1;
        self.stats.queued_by_priority[priority.ordinal() as usize] += 1;
    }

    /// Re-admission after resume or retry; joins the back of its priority level
    pub fn requeue(&mut self, task_id: TaskId, priority: TaskPriority) {
        let rank = self.rank(priority);
        self.queue.push(task_id, rank);
        self.stats.queued_by_priority[priority.ordinal() as usize] += 1;
    }

    /// Whether another task may enter flight
    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_concurrent
    }

    /// Pop the highest-priority queued task satisfying `is_ready`, moving it
    /// into the running set.
    ///
    /// Entries failing the readiness check are pushed back with their
    /// original rank, preserving FIFO order within each priority level.
    pub fn pop_ready<F>(&mut self, is_ready: F) -> Option<TaskId>
    where
        F: Fn(&TaskId) -> bool,
    {
        if !self.has_capacity() {
            return None;
        }

        let mut deferred = Vec::new();
        let mut picked = None;
        while let Some((task_id, rank)) = self.queue.pop() {
            if is_ready(&task_id) {
                picked = Some((task_id, rank));
                break;
            }
            deferred.push((task_id, rank));
        }
        for (task_id, rank) in deferred {
            self.queue.push(task_id, rank);
        }

        let (task_id, rank) = picked?;
        self.stats.queued_by_priority[rank.priority.ordinal() as usize] -= 1;
        self.running.insert(task_id);
        self.stats.running = self.running.len();
        Some(task_id)
    }

    /// Remove a queued task without recording a terminal outcome
    pub fn remove_queued(&mut self, task_id: &TaskId) -> bool {
        match self.queue.remove(task_id) {
            Some((_, rank)) => {
                self.stats.queued_by_priority[rank.priority.ordinal() as usize] -= 1;
                true
            }
            None => false,
        }
    }

    /// Remove a task from the running set without recording a terminal outcome
    pub fn finish_running(&mut self, task_id: &TaskId) -> bool {
        let removed = self.running.remove(task_id);
        self.stats.running = self.running.len();
        removed
    }

    /// Record a terminal outcome for an admitted task
    pub fn note_terminal(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.stats.completed += 1,
            TaskStatus::Failed => self.stats.failed += 1,
            TaskStatus::Cancelled => self.stats.cancelled += 1,
            _ => {}
        }
    }

    /// Reverse a terminal outcome; used when a FAILED task is explicitly retried
    pub fn reopen_terminal(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.stats.completed = self.stats.completed.saturating_sub(1),
            TaskStatus::Failed => self.stats.failed = self.stats.failed.saturating_sub(1),
            TaskStatus::Cancelled => self.stats.cancelled = self.stats.cancelled.saturating_sub(1),
            _ => {}
        }
    }

    /// Track a task leaving or re-entering circulation (pause, retry backoff)
    pub fn note_suspended(&mut self, delta: i64) {
        if delta.is_negative() {
            self.stats.suspended = self.stats.suspended.saturating_sub(delta.unsigned_abs() as usize);
        } else {
            self.stats.suspended += delta as usize;
        }
    }

    pub fn contains_queued(&self, task_id: &TaskId) -> bool {
        self.queue.get(task_id).is_some()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.running.contains(task_id)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }
}
