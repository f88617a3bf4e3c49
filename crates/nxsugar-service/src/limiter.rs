use nxsugar_core::Stats;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting semaphore bounding pulled-but-unfinished tasks.
pub(crate) struct Limiter {
    slots: Arc<Semaphore>,
    stats: Arc<Stats>,
}

impl Limiter {
    pub fn new(max_threads: usize, stats: Arc<Stats>) -> Self {
        Limiter {
            slots: Arc::new(Semaphore::new(max_threads)),
            stats,
        }
    }

    /// Wait for a free slot. `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<Slot> {
        let permit = self.slots.clone().acquire_owned().await.ok()?;
        self.stats.add_threads_used(1);
        Some(Slot {
            _permit: permit,
            stats: self.stats.clone(),
        })
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// One unit of limiter capacity. Released on drop.
pub(crate) struct Slot {
    _permit: OwnedSemaphorePermit,
    stats: Arc<Stats>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.add_threads_used(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_bounded() {
        let stats = Arc::new(Stats::new());
        let limiter = Limiter::new(2, stats.clone());

        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);
        assert_eq!(stats.snapshot().threads_used, 2);

        let third = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(third.is_err());

        drop(a);
        assert_eq!(limiter.available(), 1);
        assert_eq!(stats.snapshot().threads_used, 1);
        assert!(limiter.acquire().await.is_some());
    }
}
