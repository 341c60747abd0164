//! Bounded-parallelism gate with FIFO admission.
//!
//! Bounds the number of simultaneous *network calls*, independent of how
//! many logical requests are coalesced on top of them. Waiters are admitted
//! strictly in arrival order: release hands the freed slot directly to the
//! longest-waiting caller, so a burst of late arrivals can never starve an
//! early one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

struct LimiterState {
    available: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

struct LimiterInner {
    state: Mutex<LimiterState>,
}

/// A FIFO concurrency limiter.
///
/// # Examples
///
/// ```
/// use reqkit::limit::ConcurrencyLimiter;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let limiter = ConcurrencyLimiter::new(2);
/// let a = limiter.acquire().await;
/// let b = limiter.acquire().await;
/// assert_eq!(limiter.available(), 0);
/// drop(a);
/// assert_eq!(limiter.available(), 1);
/// # drop(b);
/// # });
/// ```
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `slots` concurrent admissions.
    ///
    /// `slots` is clamped to at least 1; a zero-slot limiter would deadlock
    /// every caller.
    pub fn new(slots: usize) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    available: slots.max(1),
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Acquires a slot, suspending until one frees if none is available.
    ///
    /// The returned [`Permit`] releases the slot on drop. Abandoning the
    /// future while queued forfeits the caller's place without consuming a
    /// slot.
    pub async fn acquire(&self) -> Permit {
        let rx = {
            let mut state = self.lock_state();
            if state.available > 0 {
                state.available -= 1;
                return Permit {
                    inner: Some(Arc::clone(&self.inner)),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        trace!("concurrency limiter full — queued");
        match rx.await {
            Ok(permit) => permit,
            // The sender is only dropped if release() observed our receiver
            // gone, which cannot happen while we are awaiting it. Admit the
            // caller rather than deadlocking.
            Err(_) => Permit {
                inner: Some(Arc::clone(&self.inner)),
            },
        }
    }

    /// Slots currently free (read-only snapshot).
    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    /// Callers currently queued (read-only snapshot).
    pub fn queued(&self) -> usize {
        self.lock_state().waiters.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.inner.state.lock().expect("limiter mutex poisoned")
    }
}

impl LimiterInner {
    /// Frees a slot, handing it directly to the longest-waiting caller.
    ///
    /// The handoff carries the [`Permit`] itself: if the waiter's future is
    /// dropped after the send lands, the permit inside the dead channel is
    /// dropped too and the slot comes back instead of leaking.
    fn release(inner: Arc<LimiterInner>) {
        let mut state = inner.state.lock().expect("limiter mutex poisoned");
        // Skip waiters that gave up while queued.
        while let Some(tx) = state.waiters.pop_front() {
            let permit = Permit {
                inner: Some(Arc::clone(&inner)),
            };
            match tx.send(permit) {
                // Slot transferred without touching `available`.
                Ok(()) => return,
                // Receiver already gone; disarm the bounced permit so its
                // drop does not re-enter the lock held here.
                Err(mut bounced) => bounced.inner = None,
            }
        }
        state.available += 1;
    }
}

/// An acquired slot. Dropping it releases the slot to the next waiter.
pub struct Permit {
    inner: Option<Arc<LimiterInner>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            LimiterInner::release(inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn immediate_acquire_up_to_capacity() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;
        assert_eq!(limiter.available(), 0);
        drop(a);
        drop(b);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn waiters_admitted_in_fifo_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let gate = limiter.acquire().await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let permit = limiter.acquire().await;
                order.lock().unwrap().push(i);
                drop(permit);
            }));
            // Ensure each waiter queues before the next arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(limiter.queued(), 4);
        drop(gate);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn bounds_simultaneous_holders() {
        let limiter = ConcurrencyLimiter::new(3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn slot_survives_waiter_aborted_after_handoff() {
        let limiter = ConcurrencyLimiter::new(1);
        let gate = limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _permit = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(limiter.queued(), 1);

        // Hand the slot to the queued waiter, then kill it before it can
        // run. The permit travelling through the dead channel must release.
        drop(gate);
        waiter.abort();
        let _ = waiter.await;

        let _permit = tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .expect("slot must survive a waiter aborted mid-handoff");
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_consume_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let gate = limiter.acquire().await;

        let abandoned = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let _ = limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(gate);
        // The slot must come back despite the dead waiter at the queue head.
        let _permit = tokio::time::timeout(Duration::from_millis(100), limiter.acquire())
            .await
            .expect("slot was lost to an abandoned waiter");
    }
}
