//! Conductor-Core: FIFO Exclusive Lock
//!
//! A fair mutex for short in-memory critical sections. Waiters are granted
//! the lock strictly in arrival order, so concurrent producers on the task
//! queue cannot starve each other. Never hold a guard across network I/O.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

struct LockInner {
    state: Mutex<LockState>,
}

/// FIFO-fair exclusive lock. Cheap to clone; clones share the same lock.
#[derive(Clone)]
pub struct FifoLock {
    inner: Arc<LockInner>,
}

impl Default for FifoLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquire the lock, waiting behind earlier arrivals.
    pub async fn acquire(&self) -> FifoLockGuard {
        let waiter = {
            let mut state = self.inner.state.lock();
            if !state.locked {
                state.locked = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = waiter {
            // The releasing guard hands the lock over before signalling, so
            // a successful recv means we own it.
            let _ = rx.await;
        }

        FifoLockGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Acquire without waiting; `None` if the lock is held.
    pub fn try_acquire(&self) -> Option<FifoLockGuard> {
        let mut state = self.inner.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(FifoLockGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of tasks currently waiting.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }
}

/// Guard releasing the lock on drop; ownership passes to the next waiter.
pub struct FifoLockGuard {
    inner: Arc<LockInner>,
}

impl Drop for FifoLockGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        // Hand off to the first waiter still listening. A waiter whose
        // future was cancelled has dropped its receiver; skip it.
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.locked = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusive() {
        let lock = FifoLock::new();
        let guard = lock.acquire().await;
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let lock = FifoLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.acquire().await;

        let mut handles = Vec::new();
        for i in 0..5usize {
            let lock_clone = lock.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = lock_clone.acquire().await;
                order.lock().push(i);
            }));
            // Let each waiter enqueue before spawning the next.
            while lock.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(&*order.lock(), &[0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let lock = FifoLock::new();
        let guard = lock.acquire().await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        while lock.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        let acquired = Arc::new(AtomicUsize::new(0));
        let acquired2 = Arc::clone(&acquired);
        let second = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
                acquired2.fetch_add(1, Ordering::SeqCst);
            })
        };
        while lock.waiting() < 1 {
            tokio::task::yield_now().await;
        }

        drop(guard);
        second.await.unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
