//! Single-flight request coalescing.
//!
//! N concurrent callers with the same [`RequestKey`] share one underlying
//! operation and one result. The first caller becomes the owner: it
//! registers a pending entry and spawns the operation on its own task so
//! that the flight outlives any individual caller. Later callers attach to
//! the entry and receive the same settled outcome.
//!
//! Invariants:
//!
//! - The pending table never leaks entries. Settlement removes the entry
//!   before broadcasting, and a drop guard removes it even if the operation
//!   panics.
//! - Cancelling one caller never cancels the shared operation unless it was
//!   the last remaining caller (reference-counted cancellation).
//! - This table is the authoritative dedup mechanism; the pending count
//!   exposed for observability is a read-only projection of it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::FetchError;
use crate::http::RawResponse;
use crate::key::RequestKey;
use crate::transport::CancelHandle;

type SharedOutcome = Arc<Result<RawResponse, FetchError>>;
type PendingTable = Arc<Mutex<HashMap<RequestKey, Pending>>>;

/// Whether a caller started the flight or attached to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    /// This caller registered the pending entry and drives the operation.
    Owner,
    /// This caller attached to an already-pending flight.
    Follower,
}

struct Pending {
    /// Distinguishes this flight from earlier or later ones under the same
    /// key, so a straggling detach cannot touch an unrelated flight.
    id: u64,
    tx: broadcast::Sender<SharedOutcome>,
    callers: usize,
    /// Cancel handle for the shared operation; fired only when the last
    /// attached caller detaches.
    cancel: CancelHandle,
}

/// Removes the pending entry if the flight dies without settling
/// (operation panic or task abort). Dropping the sender wakes followers
/// with a closed-channel error, which they surface as cancellation.
struct FlightGuard {
    table: PendingTable,
    key: RequestKey,
    settled: bool,
}

impl FlightGuard {
    /// Removes the entry ahead of the result broadcast. A caller arriving
    /// after this point starts a fresh flight instead of missing the result.
    fn settle(&mut self) {
        self.settled = true;
        if let Ok(mut table) = self.table.lock() {
            table.remove(&self.key);
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Ok(mut table) = self.table.lock() {
            table.remove(&self.key);
        }
    }
}

/// The single-flight table.
#[derive(Clone, Default)]
pub struct Coalescer {
    pending: PendingTable,
    flight_seq: Arc<AtomicU64>,
}

impl Coalescer {
    /// Creates an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only projection of how many flights are currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Runs `make_op` single-flight under `key`.
    ///
    /// If a flight for `key` is already pending the caller attaches to it
    /// and `make_op` is never invoked. Otherwise this caller becomes the
    /// owner: `make_op` receives the flight's shared [`CancelHandle`] and
    /// the resulting future is driven on a spawned task, so the flight
    /// survives the owner being cancelled while followers remain.
    ///
    /// `caller_cancel` detaches only this caller; the shared operation is
    /// cancelled when the last caller detaches.
    pub async fn coalesce<F, Fut>(
        &self,
        key: RequestKey,
        caller_cancel: Option<CancelHandle>,
        make_op: F,
    ) -> (FlightRole, Result<RawResponse, FetchError>)
    where
        F: FnOnce(CancelHandle) -> Fut,
        Fut: Future<Output = Result<RawResponse, FetchError>> + Send + 'static,
    {
        let started = Instant::now();

        let (role, flight_id, rx) = {
            let mut table = self.lock_table();
            if let Some(pending) = table.get_mut(&key) {
                pending.callers += 1;
                debug!(key = %key, callers = pending.callers, "attached to pending flight");
                (FlightRole::Follower, pending.id, pending.tx.subscribe())
            } else {
                let id = self.flight_seq.fetch_add(1, Ordering::Relaxed);
                let shared_cancel = CancelHandle::new();
                let (tx, rx) = broadcast::channel(1);
                table.insert(
                    key.clone(),
                    Pending {
                        id,
                        tx: tx.clone(),
                        callers: 1,
                        cancel: shared_cancel.clone(),
                    },
                );
                drop(table);

                let op = make_op(shared_cancel);
                let mut guard = FlightGuard {
                    table: Arc::clone(&self.pending),
                    key: key.clone(),
                    settled: false,
                };
                tokio::spawn(async move {
                    let outcome = Arc::new(op.await);
                    guard.settle();
                    // Send after removal; subscribers attached before the
                    // removal still receive the broadcast.
                    let _ = tx.send(outcome);
                });

                (FlightRole::Owner, id, rx)
            }
        };

        let outcome = self.wait(key, flight_id, rx, caller_cancel, started).await;
        (role, outcome)
    }

    async fn wait(
        &self,
        key: RequestKey,
        flight_id: u64,
        mut rx: broadcast::Receiver<SharedOutcome>,
        caller_cancel: Option<CancelHandle>,
        started: Instant,
    ) -> Result<RawResponse, FetchError> {
        let received = match caller_cancel {
            Some(cancel) => {
                tokio::select! {
                    out = rx.recv() => out,
                    _ = cancel.cancelled() => {
                        self.detach(&key, flight_id);
                        return Err(FetchError::Cancelled {
                            key,
                            elapsed: started.elapsed(),
                        });
                    }
                }
            }
            None => rx.recv().await,
        };

        match received {
            Ok(outcome) => (*outcome).clone(),
            // The flight died without settling; surface it as cancellation.
            Err(_) => Err(FetchError::Cancelled {
                key,
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Drops one caller from a pending flight, cancelling the shared
    /// operation if it was the last.
    ///
    /// The flight id guards the window where the flight the caller attached
    /// to has settled and a new one now occupies the key.
    fn detach(&self, key: &RequestKey, flight_id: u64) {
        let mut table = self.lock_table();
        if let Some(pending) = table.get_mut(key) {
            if pending.id != flight_id {
                return;
            }
            pending.callers = pending.callers.saturating_sub(1);
            if pending.callers == 0 {
                debug!(key = %key, "last caller detached — cancelling shared flight");
                pending.cancel.cancel();
            }
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<RequestKey, Pending>> {
        self.pending.lock().expect("coalescer table mutex poisoned")
    }
}
