use std::collections::{HashMap, VecDeque};

use crate::broker::job::{preview, Job, Payload};

/// Job registry plus the pending FIFO.
///
/// Every pending key is also tracked in `jobs`; jobs that are tracked but not
/// pending are held by some worker.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: HashMap<Payload, Job>,
    pending: VecDeque<Payload>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new job at the tail of the queue. Returns false if the payload
    /// is already tracked.
    pub fn submit(&mut self, job: Job) -> bool {
        if self.jobs.contains_key(job.key()) {
            return false;
        }
        self.pending.push_back(job.payload.clone());
        self.jobs.insert(job.payload.clone(), job);
        true
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&Job> {
        self.jobs.get(key)
    }

    /// Take the job at the front of the pending queue. It stays tracked.
    pub fn pop_front(&mut self) -> Option<Job> {
        while let Some(key) = self.pending.pop_front() {
            if let Some(job) = self.jobs.get(&key) {
                return Some(job.clone());
            }
            tracing::warn!(job = %preview(&key), "Dropping untracked key from pending queue");
        }
        None
    }

    /// Put a tracked job back at the front, ahead of newer submissions.
    pub fn push_front(&mut self, key: Payload) {
        if !self.jobs.contains_key(&key) {
            tracing::warn!(job = %preview(&key), "Refusing to requeue untracked job");
            return;
        }
        if self.pending.contains(&key) {
            return;
        }
        self.pending.push_front(key);
    }

    /// Stop tracking a job. The caller guarantees it is not pending.
    pub fn retire(&mut self, key: &[u8]) -> Option<Job> {
        self.jobs.remove(key)
    }

    pub fn is_pending(&self, key: &[u8]) -> bool {
        self.pending.iter().any(|k| k.as_slice() == key)
    }

    /// Pending jobs in dispatch order
    pub fn pending(&self) -> Vec<&Job> {
        self.pending
            .iter()
            .filter_map(|key| self.jobs.get(key))
            .collect()
    }

    pub fn front(&self) -> Option<&Job> {
        self.pending.front().and_then(|key| self.jobs.get(key))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of tracked jobs, pending or held
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }
}
