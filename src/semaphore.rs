//! Bounded-parallelism permits with release on every exit path.
//!
//! A thin wrapper over tokio's fair FIFO semaphore. Permits can be released
//! explicitly from shared closures (the slot empties exactly once) and are
//! returned on drop otherwise, so neither the success nor the failure path
//! can leak a permit.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fair asynchronous permit queue.
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
}

impl AsyncSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Waiters are served in FIFO order once all permits are out.
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Permit {
            slot: Mutex::new(Some(permit)),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }
}

/// One outstanding permit. Dropping it releases; `release` releases early
/// and makes any later release (or the drop) a no-op.
pub struct Permit {
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Permit {
    pub fn release(&self) {
        let permit = self.slot.lock().expect("permit slot poisoned").take();
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_returns_immediately_when_permits_available() {
        let sem = AsyncSemaphore::new(2);
        let _a = sem.acquire().await;
        let _b = sem.acquire().await;
        assert_eq!(sem.available(), 0);
    }

    #[tokio::test]
    async fn release_transfers_the_permit_to_a_waiter() {
        let sem = Arc::new(AsyncSemaphore::new(1));
        let first = sem.acquire().await;

        let sem2 = sem.clone();
        let waiter = tokio::spawn(async move {
            let permit = sem2.acquire().await;
            permit.release();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must receive the released permit")
            .unwrap();
    }

    #[tokio::test]
    async fn double_release_does_not_mint_permits() {
        let sem = AsyncSemaphore::new(1);
        let permit = sem.acquire().await;
        permit.release();
        permit.release();
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn permit_count_is_bounded_under_contention() {
        let sem = Arc::new(AsyncSemaphore::new(2));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (sem, live, peak) = (sem.clone(), live.clone(), peak.clone());
            tasks.push(tokio::spawn(async move {
                let permit = sem.acquire().await;
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                permit.release();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
