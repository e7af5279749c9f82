//! Matches responses to the requests that are waiting for them.
//!
//! Every outstanding request owns one [`PendingCall`] in a single table
//! behind one mutex. Whoever removes the entry from the table is the only
//! one allowed to fulfil it, which is what makes resolution exactly-once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{CallError, UnmatchedResponse};
use crate::protocol::{RequestId, RpcError};

type Completion = oneshot::Sender<Result<Value, CallError>>;

/// An outstanding request.
#[derive(Debug)]
pub struct PendingCall {
    id: RequestId,
    /// Tells apart successive calls that reuse the same id.
    serial: u64,
    method: String,
    issued_at: Instant,
    completion: Option<Completion>,
}

impl PendingCall {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[must_use]
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    fn fulfil(&mut self, outcome: Result<Value, CallError>) {
        if let Some(tx) = self.completion.take() {
            // The caller may have stopped waiting; nothing to do then.
            let _ = tx.send(outcome);
        }
    }
}

/// Receives the outcome of one request.
#[derive(Debug)]
pub struct CompletionHandle {
    id: RequestId,
    serial: u64,
    rx: oneshot::Receiver<Result<Value, CallError>>,
}

impl CompletionHandle {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Identifies this registration even after its id is reused.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl Future for CompletionHandle {
    type Output = Result<Value, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(CallError::ConnectionClosed)))
    }
}

#[derive(Debug, Default)]
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    next_serial: AtomicU64,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `id`. Fails if `id` is already pending.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
    ) -> Result<CompletionHandle, CallError> {
        let mut table = self.table();
        if table.contains_key(&id) {
            return Err(CallError::DuplicateId(id));
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.insert(
            id.clone(),
            PendingCall {
                id: id.clone(),
                serial,
                method: method.into(),
                issued_at: Instant::now(),
                completion: Some(tx),
            },
        );
        Ok(CompletionHandle { id, serial, rx })
    }

    /// Deliver a successful result.
    pub fn resolve(&self, id: &RequestId, result: Value) -> Result<(), UnmatchedResponse> {
        self.settle(id, Ok(result))
    }

    /// Deliver the server's error.
    pub fn reject(&self, id: &RequestId, error: RpcError) -> Result<(), UnmatchedResponse> {
        self.settle(id, Err(CallError::Rpc(error)))
    }

    /// Stop tracking `id` and fail its caller with [`CallError::Cancelled`].
    /// Returns `false` if nothing was pending under `id`.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let removed = self.table().remove(id);
        match removed {
            Some(mut call) => {
                tracing::debug!(%id, method = %call.method, "Cancelled pending call");
                call.fulfil(Err(CallError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Remove `id` without fulfilling it, for a request that never made it
    /// onto the wire.
    pub fn forget(&self, id: &RequestId) -> Option<PendingCall> {
        self.table().remove(id)
    }

    /// Fail the registration `serial` of `id` with `error`. A later call that
    /// reuses `id` is left alone. Returns `false` if it was already settled.
    pub fn expire(&self, id: &RequestId, serial: u64, error: CallError) -> bool {
        match self.take_matching(id, serial) {
            Some(mut call) => {
                call.fulfil(Err(error));
                true
            }
            None => false,
        }
    }

    /// Like [`Correlator::forget`], but only for the registration `serial`.
    pub fn abandon(&self, id: &RequestId, serial: u64) -> Option<PendingCall> {
        self.take_matching(id, serial)
    }

    fn take_matching(&self, id: &RequestId, serial: u64) -> Option<PendingCall> {
        let mut table = self.table();
        if table.get(id).is_some_and(|call| call.serial == serial) {
            table.remove(id)
        } else {
            None
        }
    }

    /// Fail every pending call with [`CallError::ConnectionClosed`] and empty
    /// the table. Returns the drained calls, oldest first.
    pub fn drain(&self) -> Vec<PendingCall> {
        let mut drained: Vec<PendingCall> = self.table().drain().map(|(_, call)| call).collect();
        drained.sort_by_key(|call| call.issued_at);
        for call in &mut drained {
            call.fulfil(Err(CallError::ConnectionClosed));
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Drained pending calls");
        }
        drained
    }

    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.table().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn settle(
        &self,
        id: &RequestId,
        outcome: Result<Value, CallError>,
    ) -> Result<(), UnmatchedResponse> {
        // Release the lock before waking the caller.
        let removed = self.table().remove(id);
        match removed {
            Some(mut call) => {
                tracing::trace!(
                    %id,
                    method = %call.method,
                    elapsed_ms = call.issued_at.elapsed().as_millis() as u64,
                    "Resolved pending call"
                );
                call.fulfil(outcome);
                Ok(())
            }
            None => Err(UnmatchedResponse { id: id.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_result_and_removes_entry() {
        let correlator = Correlator::new();
        let id = RequestId::from("1");
        let handle = correlator.register(id.clone(), "textDocument/hover").unwrap();
        assert!(correlator.contains(&id));

        correlator.resolve(&id, json!({"contents": "doc"})).unwrap();

        assert_eq!(handle.await.unwrap(), json!({"contents": "doc"}));
        assert!(!correlator.contains(&id));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_reject_delivers_rpc_error() {
        let correlator = Correlator::new();
        let id = RequestId::Number(2);
        let handle = correlator.register(id.clone(), "initialize").unwrap();

        correlator
            .reject(&id, RpcError::new(-32602, "bad params"))
            .unwrap();

        let err = handle.await.unwrap_err();
        assert_eq!(err.rpc().map(|e| e.code), Some(-32602));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let correlator = Correlator::new();
        let _first = correlator.register(RequestId::Number(1), "a").unwrap();
        let err = correlator.register(RequestId::Number(1), "b").unwrap_err();
        assert_eq!(err, CallError::DuplicateId(RequestId::Number(1)));
        assert_eq!(correlator.len(), 1);
    }

    #[test]
    fn test_same_number_and_string_ids_are_distinct() {
        let correlator = Correlator::new();
        let _a = correlator.register(RequestId::Number(1), "a").unwrap();
        let _b = correlator.register(RequestId::from("1"), "b").unwrap();
        assert_eq!(correlator.len(), 2);
    }

    #[tokio::test]
    async fn test_second_resolve_is_reported_unmatched() {
        let correlator = Correlator::new();
        let id = RequestId::from("1");
        let handle = correlator.register(id.clone(), "textDocument/hover").unwrap();

        correlator.resolve(&id, json!(1)).unwrap();
        let second = correlator.resolve(&id, json!(2));
        assert_eq!(second, Err(UnmatchedResponse { id: id.clone() }));
        assert!(correlator.reject(&id, RpcError::internal("late")).is_err());

        assert_eq!(handle.await.unwrap(), json!(1));
    }

    #[test]
    fn test_resolve_unknown_id_is_unmatched() {
        let correlator = Correlator::new();
        let err = correlator
            .resolve(&RequestId::Number(999), json!({}))
            .unwrap_err();
        assert_eq!(err.id, RequestId::Number(999));
    }

    #[tokio::test]
    async fn test_cancel_fulfils_with_cancelled() {
        let correlator = Correlator::new();
        let id = RequestId::Number(5);
        let handle = correlator.register(id.clone(), "textDocument/completion").unwrap();

        assert!(correlator.cancel(&id));
        assert!(!correlator.cancel(&id));
        assert_eq!(handle.await, Err(CallError::Cancelled));
        assert!(correlator.resolve(&id, json!(null)).is_err());
    }

    #[tokio::test]
    async fn test_drain_rejects_everything_with_connection_closed() {
        let correlator = Correlator::new();
        let first = correlator.register(RequestId::Number(1), "a").unwrap();
        let second = correlator.register(RequestId::Number(2), "b").unwrap();

        let drained = correlator.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id(), &RequestId::Number(1));
        assert_eq!(drained[1].method(), "b");
        assert!(correlator.is_empty());

        assert_eq!(first.await, Err(CallError::ConnectionClosed));
        assert_eq!(second.await, Err(CallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_forget_leaves_caller_unfulfilled() {
        let correlator = Correlator::new();
        let id = RequestId::Number(3);
        let handle = correlator.register(id.clone(), "a").unwrap();

        let call = correlator.forget(&id).unwrap();
        assert_eq!(call.method(), "a");
        drop(call);

        // Dropping the sender without a value surfaces as ConnectionClosed.
        assert_eq!(handle.await, Err(CallError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_expire_skips_a_reused_id() {
        let correlator = Correlator::new();
        let id = RequestId::Number(8);
        let stale = correlator.register(id.clone(), "a").unwrap();
        let stale_serial = stale.serial();
        correlator.resolve(&id, json!(1)).unwrap();
        assert_eq!(stale.await.unwrap(), json!(1));

        let fresh = correlator.register(id.clone(), "b").unwrap();
        assert_ne!(fresh.serial(), stale_serial);
        assert!(!correlator.expire(&id, stale_serial, CallError::Cancelled));
        assert!(correlator.abandon(&id, stale_serial).is_none());
        assert!(correlator.contains(&id));

        assert!(correlator.expire(&id, fresh.serial(), CallError::Cancelled));
        assert_eq!(fresh.await, Err(CallError::Cancelled));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_resolution_never_crosses() {
        let correlator = Correlator::new();
        let handles: Vec<_> = (0..16)
            .map(|n| {
                correlator
                    .register(RequestId::Number(n), format!("m{n}"))
                    .unwrap()
            })
            .collect();

        // Resolve in reverse, evens first.
        let order = (0..16).rev().filter(|n| n % 2 == 0).chain((0..16).rev().filter(|n| n % 2 == 1));
        for n in order {
            correlator
                .resolve(&RequestId::Number(n), json!({ "n": n }))
                .unwrap();
        }

        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.id(), &RequestId::Number(n as i64));
            assert_eq!(handle.await.unwrap(), json!({ "n": n }));
        }
    }

    mod props {
        use super::*;
        use futures_util::FutureExt;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn each_caller_gets_exactly_its_own_outcome(
                count in 1usize..24,
                order in proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
                string_ids in any::<bool>(),
            ) {
                let correlator = Correlator::new();
                let id_of = |n: usize| if string_ids {
                    RequestId::String(format!("req-{n}"))
                } else {
                    RequestId::Number(n as i64)
                };
                let handles: Vec<_> = (0..count)
                    .map(|n| correlator.register(id_of(n), format!("m{n}")).unwrap())
                    .collect();

                // Replay an arbitrary sequence of resolutions, duplicates included.
                let mut settled = vec![false; count];
                for index in order {
                    let n = index.index(count);
                    let outcome = correlator.resolve(&id_of(n), json!({ "n": n }));
                    prop_assert_eq!(outcome.is_ok(), !settled[n]);
                    settled[n] = true;
                }
                prop_assert_eq!(correlator.len(), settled.iter().filter(|s| !**s).count());

                for (n, handle) in handles.into_iter().enumerate() {
                    if settled[n] {
                        let value = handle.now_or_never().expect("settled call is ready").unwrap();
                        prop_assert_eq!(value, json!({ "n": n }));
                    } else {
                        prop_assert!(correlator.cancel(&id_of(n)));
                        prop_assert_eq!(handle.now_or_never(), Some(Err(CallError::Cancelled)));
                    }
                }
                prop_assert!(correlator.is_empty());
            }
        }
    }
}
