use parking_lot::Mutex;
use serde::Serialize;

/// Point-in-time copy of the service counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub task_pulls_done: u64,
    pub task_pull_timeouts: u64,
    pub tasks_pulled: u64,
    pub tasks_panic: u64,
    pub tasks_method_not_found: u64,
    pub tasks_served: u64,
    pub tasks_running: i64,
    pub threads_used: i64,
}

impl StatsSnapshot {
    /// Tasks that reached a final outcome.
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_served + self.tasks_panic + self.tasks_method_not_found
    }
}

/// Thread-safe service counters.
#[derive(Debug, Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }

    pub fn add_task_pulls_done(&self, n: u64) {
        self.inner.lock().task_pulls_done += n;
    }

    pub fn add_task_pull_timeouts(&self, n: u64) {
        self.inner.lock().task_pull_timeouts += n;
    }

    pub fn add_tasks_pulled(&self, n: u64) {
        self.inner.lock().tasks_pulled += n;
    }

    pub fn add_tasks_panic(&self, n: u64) {
        self.inner.lock().tasks_panic += n;
    }

    pub fn add_tasks_method_not_found(&self, n: u64) {
        self.inner.lock().tasks_method_not_found += n;
    }

    pub fn add_tasks_served(&self, n: u64) {
        self.inner.lock().tasks_served += n;
    }

    pub fn add_tasks_running(&self, n: i64) {
        self.inner.lock().tasks_running += n;
    }

    pub fn add_threads_used(&self, n: i64) {
        self.inner.lock().threads_used += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_is_a_copy() {
        let stats = Stats::new();
        stats.add_tasks_pulled(2);
        let before = stats.snapshot();
        stats.add_tasks_served(1);

        assert_eq!(before.tasks_served, 0);
        assert_eq!(stats.snapshot().tasks_served, 1);
        assert_eq!(stats.snapshot().tasks_finished(), 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.add_threads_used(1);
                        stats.add_threads_used(-1);
                        stats.add_task_pulls_done(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = stats.snapshot();
        assert_eq!(snap.threads_used, 0);
        assert_eq!(snap.task_pulls_done, 8000);
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_value(Stats::new().snapshot()).unwrap();
        assert!(json.get("tasksMethodNotFound").is_some());
        assert!(json.get("taskPullTimeouts").is_some());
    }
}
