//! Request correlation shared by the duplex transports.

use super::SessionError;
use manifold_wire as wire;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};
use tokio::time::Instant;

/// Allocates request ids and correlates responses to waiting callers.
///
/// The reader task is the only completer; callers register before sending and
/// deregister on timeout or cancellation, so an entry can only ever be
/// finished once.
#[derive(Default)]
pub struct RequestTracker {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, SessionError>>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> PendingRequest<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        PendingRequest {
            tracker: self,
            id,
            rx,
        }
    }

    /// Deliver a response to its waiter. Returns false for unknown ids
    /// (late replies after timeout are expected and dropped).
    pub fn complete(&self, id: i64, result: Result<Value, SessionError>) -> bool {
        let Some(tx) = self.pending.lock().remove(&id) else {
            return false;
        };
        tx.send(result).is_ok()
    }

    fn forget(&self, id: i64) {
        self.pending.lock().remove(&id);
    }

    /// Fail every outstanding request, used when the transport dies.
    pub fn fail_all(&self, error: &SessionError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A registered request slot. Dropping it removes the pending entry, so a
/// caller that times out or is cancelled mid-await never leaks the slot.
pub struct PendingRequest<'a> {
    tracker: &'a RequestTracker,
    id: i64,
    rx: oneshot::Receiver<Result<Value, SessionError>>,
}

impl PendingRequest<'_> {
    pub fn id(&self) -> i64 {
        self.id
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.tracker.forget(self.id);
    }
}

/// Bounded concurrency per backend session.
///
/// When the cap is reached, new requests wait up to their remaining deadline;
/// waiters that time out fail as overloaded rather than as a call timeout.
pub struct CallGate {
    sem: Arc<Semaphore>,
}

impl CallGate {
    pub fn new(max_outstanding: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max_outstanding.max(1))),
        }
    }

    pub async fn acquire(
        &self,
        deadline: Instant,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, SessionError> {
        match tokio::time::timeout_at(deadline, self.sem.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Overloaded),
        }
    }
}

/// Convert a JSON-RPC response into the session-level result.
pub(super) fn response_into_result(resp: wire::Response) -> Result<Value, SessionError> {
    if let Some(err) = resp.error {
        return Err(SessionError::Backend {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    match resp.result {
        Some(v) => Ok(v),
        None => Err(SessionError::InvalidResponse(
            "response carries neither result nor error".to_string(),
        )),
    }
}

/// Await a correlated response with a deadline.
pub(super) async fn await_response(
    pending: &mut PendingRequest<'_>,
    deadline: Instant,
    started: Instant,
) -> Result<Value, SessionError> {
    match tokio::time::timeout_at(deadline, &mut pending.rx).await {
        Ok(Ok(result)) => result,
        // Sender dropped without completing: the transport died underneath us.
        Ok(Err(_)) => Err(SessionError::Closed),
        Err(_) => Err(SessionError::Timeout {
            elapsed_ms: duration_ms(started.elapsed()),
        }),
    }
}

pub(super) fn duration_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_correlates_by_id() {
        let tracker = RequestTracker::new();
        let mut p1 = tracker.register();
        let mut p2 = tracker.register();
        assert_ne!(p1.id(), p2.id());

        assert!(tracker.complete(p2.id(), Ok(serde_json::json!("two"))));
        assert!(tracker.complete(p1.id(), Ok(serde_json::json!("one"))));

        assert_eq!((&mut p1.rx).await.unwrap().unwrap(), serde_json::json!("one"));
        assert_eq!((&mut p2.rx).await.unwrap().unwrap(), serde_json::json!("two"));
    }

    #[tokio::test]
    async fn dropped_slots_are_forgotten_and_late_replies_ignored() {
        let tracker = RequestTracker::new();
        let id = {
            let pending = tracker.register();
            pending.id()
        };
        assert_eq!(tracker.outstanding(), 0);
        assert!(!tracker.complete(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn fail_all_drains_every_waiter() {
        let tracker = RequestTracker::new();
        let mut p1 = tracker.register();
        let mut p2 = tracker.register();
        tracker.fail_all(&SessionError::Closed);
        assert!(matches!((&mut p1.rx).await.unwrap(), Err(SessionError::Closed)));
        assert!(matches!((&mut p2.rx).await.unwrap(), Err(SessionError::Closed)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn gate_rejects_waiters_past_deadline() {
        let gate = CallGate::new(1);
        let held = gate
            .acquire(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let res = gate.acquire(Instant::now() + Duration::from_millis(20)).await;
        assert!(matches!(res, Err(SessionError::Overloaded)));
        drop(held);

        let res = gate.acquire(Instant::now() + Duration::from_millis(20)).await;
        assert!(res.is_ok());
    }

    #[test]
    fn response_error_becomes_backend_error() {
        let resp = wire::Response::err(
            wire::RequestId::Number(1),
            wire::ErrorObject {
                code: -32050,
                message: "nope".to_string(),
                data: None,
            },
        );
        let err = response_into_result(resp).unwrap_err();
        assert!(matches!(err, SessionError::Backend { code: -32050, .. }));
    }

    #[test]
    fn response_without_result_or_error_is_invalid() {
        let resp = wire::Response {
            jsonrpc: wire::JSONRPC_VERSION.to_string(),
            id: wire::RequestId::Number(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            response_into_result(resp),
            Err(SessionError::InvalidResponse(_))
        ));
    }
}
