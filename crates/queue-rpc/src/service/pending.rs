//! Correlation registry.
//!
//! Maps request ids of outstanding calls to the single-shot channel their
//! caller is waiting on. The inbound loop resolves entries as callbacks
//! arrive; removal and firing happen in one step, so a duplicate callback
//! for the same id finds nothing and is ignored.
//!
//! Flow:
//! 1. Caller generates a `RequestId`
//! 2. Caller calls `register()` to get a oneshot receiver
//! 3. Caller sends the call envelope
//! 4. Inbound loop receives the callback and calls `resolve()`
//! 5. Caller awaits the receiver (or times out)

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use queue_telemetry::{metric_inc, metrics};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{CallError, RemoteException, RequestId};

/// Delivered to a waiting caller
#[derive(Debug)]
pub struct Reply {
    /// Request this reply is for
    pub request_id: RequestId,
    /// Callee result, remote exception or eviction
    pub result: Result<Value, CallError>,
    /// Time between registration and delivery
    pub response_time: Duration,
}

/// An outstanding call
struct Waiter {
    sender: oneshot::Sender<Reply>,
    created_at: Instant,
    method: String,
    timeout: Option<Duration>,
}

impl Waiter {
    fn is_expired(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.duration_since(self.created_at) > timeout)
    }
}

/// Registry counters
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub total_registered: AtomicU64,
    pub total_resolved: AtomicU64,
    /// Callbacks that matched no waiter
    pub total_unmatched: AtomicU64,
    pub total_timeouts: AtomicU64,
    pub total_cancelled: AtomicU64,
}

/// Point-in-time copy of `RegistryStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStatsSnapshot {
    pub pending: usize,
    pub total_registered: u64,
    pub total_resolved: u64,
    pub total_unmatched: u64,
    pub total_timeouts: u64,
    pub total_cancelled: u64,
}

/// Request id to waiting caller.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<RequestId, Waiter>,
    stats: Arc<RegistryStats>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`.
    ///
    /// Only one waiter may exist per id. `timeout` makes the entry eligible
    /// for `remove_expired` once it has been pending that long.
    pub fn register(
        &self,
        request_id: RequestId,
        method: &str,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<Reply>, CallError> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                warn!(request_id = %request_id, method = method, "Request id already pending");
                return Err(CallError::DuplicateRequestId(request_id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Waiter {
                    sender: tx,
                    created_at: Instant::now(),
                    method: method.to_string(),
                    timeout,
                });
            }
        }

        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        metric_inc!(metrics::PENDING_CALLS);

        debug!(request_id = %request_id, method = method, "Registered pending call");

        Ok(rx)
    }

    /// Fire and remove the waiter for `request_id`.
    ///
    /// Returns false if no caller received the outcome: the id was unknown,
    /// already resolved, or its caller stopped waiting.
    pub fn resolve(&self, request_id: &RequestId, outcome: Result<Value, RemoteException>) -> bool {
        let Some((_, waiter)) = self.pending.remove(request_id) else {
            self.stats.total_unmatched.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %request_id, "Callback for unknown or completed request");
            return false;
        };
        metrics::PENDING_CALLS.dec();

        let response_time = waiter.created_at.elapsed();
        metrics::CALL_DURATION.observe(response_time.as_secs_f64());

        let reply = Reply {
            request_id: request_id.clone(),
            result: outcome.map_err(CallError::Remote),
            response_time,
        };

        match waiter.sender.send(reply) {
            Ok(()) => {
                self.stats.total_resolved.fetch_add(1, Ordering::Relaxed);
                debug!(
                    request_id = %request_id,
                    method = waiter.method,
                    response_time_ms = response_time.as_millis(),
                    "Resolved pending call"
                );
                true
            }
            Err(_) => {
                // Caller stopped waiting
                self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = %request_id, method = waiter.method, "Caller no longer waiting");
                false
            }
        }
    }

    /// Remove a waiter without firing it
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        if self.pending.remove(request_id).is_some() {
            metrics::PENDING_CALLS.dec();
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Record that a caller gave up waiting on `request_id`
    pub(crate) fn expire(&self, request_id: &RequestId) {
        if self.pending.remove(request_id).is_some() {
            metrics::PENDING_CALLS.dec();
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict waiters past their timeout, failing each with `CallError::Timeout`.
    ///
    /// Returns the number of waiters removed.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for request_id in expired {
            // A callback may have resolved it since the scan
            let Some((_, waiter)) = self
                .pending
                .remove_if(&request_id, |_, waiter| waiter.is_expired(now))
            else {
                continue;
            };
            metrics::PENDING_CALLS.dec();
            self.stats.total_timeouts.fetch_add(1, Ordering::Relaxed);
            removed += 1;

            let elapsed = now.duration_since(waiter.created_at);
            warn!(
                request_id = %request_id,
                method = waiter.method,
                elapsed_ms = elapsed.as_millis(),
                "Removing expired pending call"
            );

            let reply = Reply {
                request_id,
                result: Err(CallError::Timeout {
                    method: waiter.method,
                    after: waiter.timeout.unwrap_or(elapsed),
                }),
                response_time: elapsed,
            };
            let _ = waiter.sender.send(reply);
        }

        removed
    }

    /// Drop every waiter. Their callers observe `CallError::Dropped`.
    pub fn clear(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        metrics::PENDING_CALLS.sub(count as f64);
        self.stats
            .total_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            pending: self.pending.len(),
            total_registered: self.stats.total_registered.load(Ordering::Relaxed),
            total_resolved: self.stats.total_resolved.load(Ordering::Relaxed),
            total_unmatched: self.stats.total_unmatched.load(Ordering::Relaxed),
            total_timeouts: self.stats.total_timeouts.load(Ordering::Relaxed),
            total_cancelled: self.stats.total_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Background task evicting expired waiters until shutdown
pub async fn sweep_task(
    registry: Arc<CorrelationRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let removed = registry.remove_expired();
                if removed > 0 {
                    debug!(removed = removed, "Cleaned up expired pending calls");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::generate();

        let rx = registry.register(id.clone(), "add", None).unwrap();
        assert!(registry.is_pending(&id));
        assert_eq!(registry.pending_count(), 1);

        assert!(registry.resolve(&id, Ok(json!(5))));
        let reply = rx.await.unwrap();
        assert_eq!(reply.request_id, id);
        assert_eq!(reply.result.unwrap(), json!(5));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_with_remote_exception() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::generate();
        let rx = registry.register(id.clone(), "fail", None).unwrap();

        assert!(registry.resolve(&id, Err(RemoteException::new("boom", 42))));
        let err = rx.await.unwrap().result.unwrap_err();
        assert_eq!(err.remote().unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_second_resolve_is_ignored() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::generate();
        let _rx = registry.register(id.clone(), "add", None).unwrap();

        assert!(registry.resolve(&id, Ok(json!(1))));
        assert!(!registry.resolve(&id, Ok(json!(2))));
        assert_eq!(registry.snapshot().total_unmatched, 1);
    }

    #[test]
    fn test_unknown_id_not_matched() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve(&RequestId::from("nobody"), Ok(Value::Null)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::from("dup");
        let _rx = registry.register(id.clone(), "a", None).unwrap();

        match registry.register(id.clone(), "b", None) {
            Err(CallError::DuplicateRequestId(dup)) => assert_eq!(dup, id),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_counts_as_cancelled() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::generate();
        drop(registry.register(id.clone(), "add", None).unwrap());

        assert!(!registry.resolve(&id, Ok(json!(1))));
        assert_eq!(registry.snapshot().total_cancelled, 1);
        assert!(!registry.is_pending(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_expired_fails_waiter_with_timeout() {
        let registry = CorrelationRegistry::new();
        let short = RequestId::generate();
        let forever = RequestId::generate();

        let rx = registry
            .register(short.clone(), "slow", Some(Duration::from_millis(10)))
            .unwrap();
        let _rx2 = registry.register(forever.clone(), "slow", None).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registry.remove_expired(), 1);
        assert!(!registry.is_pending(&short));
        assert!(registry.is_pending(&forever));

        match rx.await.unwrap().result {
            Err(CallError::Timeout { method, after }) => {
                assert_eq!(method, "slow");
                assert_eq!(after, Duration::from_millis(10));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(registry.snapshot().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_clear_drops_waiters() {
        let registry = CorrelationRegistry::new();
        let rx = registry.register(RequestId::generate(), "a", None).unwrap();
        let _rx2 = registry.register(RequestId::generate(), "b", None).unwrap();

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.pending_count(), 0);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_cancel() {
        let registry = CorrelationRegistry::new();
        let id = RequestId::generate();
        let _rx = registry.register(id.clone(), "a", None).unwrap();

        assert!(registry.cancel(&id));
        assert!(!registry.cancel(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_stops_on_shutdown() {
        let registry = Arc::new(CorrelationRegistry::new());
        let (tx, rx) = watch::channel(false);
        let id = RequestId::generate();
        let waiter = registry
            .register(id, "slow", Some(Duration::from_secs(1)))
            .unwrap();

        let sweeper = tokio::spawn(sweep_task(registry.clone(), Duration::from_secs(2), rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(
            waiter.await.unwrap().result,
            Err(CallError::Timeout { .. })
        ));

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }

    proptest! {
        #[test]
        fn prop_each_waiter_fires_at_most_once(
            registered in prop::collection::hash_set("[a-d]{1,2}", 1..8),
            attempts in prop::collection::vec("[a-d]{1,2}", 0..40),
        ) {
            let registry = CorrelationRegistry::new();
            let _receivers: Vec<_> = registered
                .iter()
                .map(|id| registry.register(RequestId::from(id.as_str()), "m", None).unwrap())
                .collect();

            let mut fired = HashSet::new();
            for id in attempts.iter().chain(registered.iter()) {
                if registry.resolve(&RequestId::from(id.as_str()), Ok(Value::Null)) {
                    prop_assert!(registered.contains(id));
                    prop_assert!(fired.insert(id.clone()));
                }
            }
            prop_assert_eq!(fired.len(), registered.len());
            prop_assert_eq!(registry.pending_count(), 0);
        }
    }
}
