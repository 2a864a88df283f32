use std::collections::HashMap;

use crate::broker::job::Payload;
use crate::endpoint::Endpoint;

/// Liveness tracking for one registered worker
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub endpoint: Endpoint,
    pub pings_remaining: u32,
}

impl WorkerState {
    pub fn new(endpoint: Endpoint, max_pings: u32) -> Self {
        Self {
            endpoint,
            pings_remaining: max_pings,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.pings_remaining == 0
    }
}

/// Worker registry and the bidirectional worker <-> job assignment map.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<Endpoint, WorkerState>,
    assignments: HashMap<Endpoint, Payload>,
    holders: HashMap<Payload, Endpoint>,
    max_pings: u32,
}

impl WorkerRegistry {
    pub fn new(max_pings: u32) -> Self {
        Self {
            workers: HashMap::new(),
            assignments: HashMap::new(),
            holders: HashMap::new(),
            max_pings,
        }
    }

    /// Record a heartbeat. Returns true when the worker was not registered.
    pub fn heartbeat(&mut self, worker: &Endpoint) -> bool {
        match self.workers.get_mut(worker) {
            Some(state) => {
                state.pings_remaining = self.max_pings;
                false
            }
            None => {
                self.workers
                    .insert(worker.clone(), WorkerState::new(worker.clone(), self.max_pings));
                true
            }
        }
    }

    pub fn is_registered(&self, worker: &Endpoint) -> bool {
        self.workers.contains_key(worker)
    }

    pub fn pings_remaining(&self, worker: &Endpoint) -> Option<u32> {
        self.workers.get(worker).map(|w| w.pings_remaining)
    }

    /// Registered workers without a job, sorted for stable iteration
    pub fn free_workers(&self) -> Vec<Endpoint> {
        let mut free: Vec<Endpoint> = self
            .workers
            .keys()
            .filter(|w| !self.assignments.contains_key(*w))
            .cloned()
            .collect();
        free.sort();
        free
    }

    /// Bind a job to a registered, idle worker.
    pub fn assign(&mut self, worker: &Endpoint, key: Payload) -> bool {
        if !self.workers.contains_key(worker)
            || self.assignments.contains_key(worker)
            || self.holders.contains_key(&key)
        {
            return false;
        }
        self.holders.insert(key.clone(), worker.clone());
        self.assignments.insert(worker.clone(), key);
        true
    }

    pub fn assignment_of(&self, worker: &Endpoint) -> Option<&Payload> {
        self.assignments.get(worker)
    }

    pub fn holder_of(&self, key: &[u8]) -> Option<&Endpoint> {
        self.holders.get(key)
    }

    /// Drop a worker's assignment, returning the job key it held.
    pub fn release(&mut self, worker: &Endpoint) -> Option<Payload> {
        let key = self.assignments.remove(worker)?;
        self.holders.remove(&key);
        Some(key)
    }

    /// Unregister a worker along with its assignment.
    ///
    /// Returns `None` for an unknown worker, otherwise the key of the job it
    /// was holding, if any.
    pub fn remove(&mut self, worker: &Endpoint) -> Option<Option<Payload>> {
        self.workers.remove(worker)?;
        Some(self.release(worker))
    }

    /// Decrement every liveness counter and return the workers that ran out,
    /// sorted. Expired workers stay registered until removed.
    pub fn decrement_all(&mut self) -> Vec<Endpoint> {
        let mut expired: Vec<Endpoint> = self
            .workers
            .values_mut()
            .filter_map(|w| {
                w.pings_remaining = w.pings_remaining.saturating_sub(1);
                w.is_expired().then(|| w.endpoint.clone())
            })
            .collect();
        expired.sort();
        expired
    }

    pub fn all_workers(&self) -> Vec<&WorkerState> {
        self.workers.values().collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&Endpoint, &Payload)> {
        self.assignments.iter()
    }

    pub fn max_pings(&self) -> u32 {
        self.max_pings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::new(s)
    }

    #[test]
    fn first_heartbeat_registers() {
        let mut reg = WorkerRegistry::new(3);
        assert!(reg.heartbeat(&ep("w1")));
        assert!(!reg.heartbeat(&ep("w1")));
        assert_eq!(reg.worker_count(), 1);
        assert_eq!(reg.pings_remaining(&ep("w1")), Some(3));
    }

    #[test]
    fn heartbeat_resets_counter() {
        let mut reg = WorkerRegistry::new(3);
        reg.heartbeat(&ep("w1"));
        reg.decrement_all();
        reg.decrement_all();
        assert_eq!(reg.pings_remaining(&ep("w1")), Some(1));

        reg.heartbeat(&ep("w1"));
        assert_eq!(reg.pings_remaining(&ep("w1")), Some(3));
    }

    #[test]
    fn decrement_reports_expired() {
        let mut reg = WorkerRegistry::new(2);
        reg.heartbeat(&ep("w1"));
        assert!(reg.decrement_all().is_empty());
        assert_eq!(reg.decrement_all(), vec![ep("w1")]);
    }

    #[test]
    fn free_workers_excludes_assigned() {
        let mut reg = WorkerRegistry::new(3);
        reg.heartbeat(&ep("w1"));
        reg.heartbeat(&ep("w2"));
        assert!(reg.assign(&ep("w1"), b"job".to_vec()));

        assert_eq!(reg.free_workers(), vec![ep("w2")]);
        assert_eq!(reg.holder_of(b"job"), Some(&ep("w1")));
    }

    #[test]
    fn assign_enforces_one_job_per_worker() {
        let mut reg = WorkerRegistry::new(3);
        reg.heartbeat(&ep("w1"));
        reg.heartbeat(&ep("w2"));

        assert!(reg.assign(&ep("w1"), b"a".to_vec()));
        assert!(!reg.assign(&ep("w1"), b"b".to_vec()));
        // Same job cannot go to a second worker
        assert!(!reg.assign(&ep("w2"), b"a".to_vec()));
        // Unregistered workers never get jobs
        assert!(!reg.assign(&ep("ghost"), b"b".to_vec()));
    }

    #[test]
    fn remove_returns_held_job() {
        let mut reg = WorkerRegistry::new(3);
        reg.heartbeat(&ep("w1"));
        reg.assign(&ep("w1"), b"a".to_vec());

        assert_eq!(reg.remove(&ep("w1")), Some(Some(b"a".to_vec())));
        assert!(reg.holder_of(b"a").is_none());
        assert_eq!(reg.assigned_count(), 0);
        assert_eq!(reg.remove(&ep("w1")), None);
    }

    #[test]
    fn remove_idle_worker() {
        let mut reg = WorkerRegistry::new(3);
        reg.heartbeat(&ep("w1"));
        assert_eq!(reg.remove(&ep("w1")), Some(None));
    }
}
