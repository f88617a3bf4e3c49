use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Task executors currently in flight, watched to detect a full drain.
#[derive(Clone, Default)]
pub(crate) struct ActiveWorkers {
    inner: Arc<WorkersInner>,
}

#[derive(Default)]
struct WorkersInner {
    active: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    drained: Notify,
}

impl ActiveWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new executor until the returned guard is dropped.
    pub fn register(&self) -> WorkerGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.active.lock().insert(id);
        WorkerGuard {
            id,
            inner: self.inner.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once no executor is in flight.
    pub async fn wait_drained(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

pub(crate) struct WorkerGuard {
    id: u64,
    inner: Arc<WorkersInner>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let empty = {
            let mut active = self.inner.active.lock();
            active.remove(&self.id);
            active.is_empty()
        };
        if empty {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_drained() {
        let workers = ActiveWorkers::new();
        workers.wait_drained().await;

        let a = workers.register();
        let b = workers.register();
        assert_eq!(workers.len(), 2);

        let watcher = workers.clone();
        let handle = tokio::spawn(async move { watcher.wait_drained().await });

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(b);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(workers.is_empty());
    }
}
