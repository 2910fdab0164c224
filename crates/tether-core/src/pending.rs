//! Pending request table and response futures.
//!
//! Request ids grow monotonically, so a `BTreeMap` keyed by id iterates in
//! submission order. Each entry owns the sending half of a `oneshot` channel;
//! settling consumes it, which makes settling twice impossible.

use crate::destination::DestinationKey;
use crate::error::{CommError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Reply = oneshot::Sender<Result<Value>>;

/// One outstanding call.
#[derive(Debug)]
pub struct PendingRequest {
    pub req_id: u64,
    pub method: String,
    /// Serialized request, kept verbatim for resend.
    pub message: String,
    /// Session id the request is bound to, if any.
    pub session: Option<String>,
    pub destination: DestinationKey,
    /// Handed to the transport.
    pub sent: bool,
    reply: Reply,
}

impl PendingRequest {
    /// Deliver the outcome. Returns false if the caller already dropped its future.
    pub fn settle(self, outcome: Result<Value>) -> bool {
        self.reply.send(outcome).is_ok()
    }
}

/// Future for the outcome of a call.
///
/// Resolves exactly once. If the communication layer is torn down without
/// settling it, it resolves to [`CommError::Closed`].
#[derive(Debug)]
#[must_use = "a call's outcome is only observable by awaiting its future"]
pub struct ResponseFuture {
    state: FutureState,
}

#[derive(Debug)]
enum FutureState {
    Waiting(oneshot::Receiver<Result<Value>>),
    Failed(Option<CommError>),
}

impl ResponseFuture {
    /// A future that is already failed; used when a call is refused up front.
    pub fn failed(err: CommError) -> Self {
        Self {
            state: FutureState::Failed(Some(err)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self {
            state: FutureState::Waiting(rx),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            FutureState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(CommError::Closed)),
                Poll::Pending => Poll::Pending,
            },
            FutureState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(CommError::Closed))),
        }
    }
}

/// All outstanding calls, in submission order.
#[derive(Debug, Default)]
pub struct PendingTable {
    requests: BTreeMap<u64, PendingRequest>,
    next_req_id: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    /// Record a request and return the future for its outcome.
    pub fn insert(
        &mut self,
        req_id: u64,
        method: impl Into<String>,
        message: String,
        session: Option<String>,
        destination: DestinationKey,
        sent: bool,
    ) -> ResponseFuture {
        let (reply, rx) = oneshot::channel();
        self.requests.insert(
            req_id,
            PendingRequest {
                req_id,
                method: method.into(),
                message,
                session,
                destination,
                sent,
                reply,
            },
        );
        ResponseFuture::waiting(rx)
    }

    pub fn get(&self, req_id: u64) -> Option<&PendingRequest> {
        self.requests.get(&req_id)
    }

    pub fn get_mut(&mut self, req_id: u64) -> Option<&mut PendingRequest> {
        self.requests.get_mut(&req_id)
    }

    /// Remove a request without settling it.
    pub fn take(&mut self, req_id: u64) -> Option<PendingRequest> {
        self.requests.remove(&req_id)
    }

    /// Remove and settle a request. Returns its method name, or `None` if the id is unknown.
    pub fn settle(&mut self, req_id: u64, outcome: Result<Value>) -> Option<String> {
        let request = self.requests.remove(&req_id)?;
        let method = request.method.clone();
        if !request.settle(outcome) {
            tracing::debug!("Comm: caller for req #{} {} went away", req_id, method);
        }
        Some(method)
    }

    /// Ids of requests addressed to a connection keyed `destination`, in submission order.
    pub fn ids_matching(&self, destination: &DestinationKey) -> Vec<u64> {
        self.requests
            .values()
            .filter(|req| req.destination.matches(destination))
            .map(|req| req.req_id)
            .collect()
    }

    /// Reject every request addressed to `destination`. Returns how many were rejected.
    pub fn reject_matching(
        &mut self,
        destination: &DestinationKey,
        error: impl Fn(&PendingRequest) -> CommError,
    ) -> usize {
        let ids = self.ids_matching(destination);
        for id in &ids {
            if let Some(request) = self.requests.remove(id) {
                let err = error(&request);
                tracing::info!("Comm: Rejecting req #{} {}: {}", id, request.method, err);
                request.settle(Err(err));
            }
        }
        ids.len()
    }

    /// Reject everything, e.g. on process-wide disposal.
    pub fn reject_all(&mut self, error: impl Fn(&PendingRequest) -> CommError) -> usize {
        let requests = std::mem::take(&mut self.requests);
        let count = requests.len();
        for (_, request) in requests {
            let err = error(&request);
            request.settle(Err(err));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn insert(table: &mut PendingTable, destination: DestinationKey) -> (u64, ResponseFuture) {
        let id = table.next_id();
        let fut = table.insert(id, "m", format!("msg{}", id), None, destination, false);
        (id, fut)
    }

    #[test]
    fn test_ids_are_monotonic_from_zero() {
        let mut table = PendingTable::new();
        assert_eq!(table.next_id(), 0);
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
    }

    #[test]
    fn test_settle_resolves_and_removes() {
        let mut table = PendingTable::new();
        let (id, fut) = insert(&mut table, DestinationKey::Any);

        assert_eq!(table.settle(id, Ok(json!({"ok": true}))).as_deref(), Some("m"));
        assert!(table.is_empty());
        assert_eq!(fut.now_or_never().unwrap().unwrap(), json!({"ok": true}));

        // A second settlement finds nothing
        assert!(table.settle(id, Ok(Value::Null)).is_none());
    }

    #[test]
    fn test_unsettled_future_stays_pending() {
        let mut table = PendingTable::new();
        let (_id, fut) = insert(&mut table, DestinationKey::Any);
        assert!(fut.now_or_never().is_none());
    }

    #[test]
    fn test_reject_matching_keeps_other_destinations() {
        let mut table = PendingTable::new();
        let (_, f1) = insert(&mut table, DestinationKey::doc("doc1"));
        let (id2, f2) = insert(&mut table, DestinationKey::doc("doc2"));
        let (_, f3) = insert(&mut table, DestinationKey::Any);

        let rejected = table.reject_matching(&DestinationKey::doc("doc1"), |_| {
            CommError::ConnectionDisposed {
                destination: DestinationKey::doc("doc1"),
            }
        });

        assert_eq!(rejected, 2);
        assert_eq!(table.len(), 1);
        assert!(table.get(id2).is_some());
        assert!(matches!(
            f1.now_or_never(),
            Some(Err(CommError::ConnectionDisposed { .. }))
        ));
        assert!(matches!(
            f3.now_or_never(),
            Some(Err(CommError::ConnectionDisposed { .. }))
        ));
        assert!(f2.now_or_never().is_none());
    }

    #[test]
    fn test_ids_matching_in_submission_order() {
        let mut table = PendingTable::new();
        for _ in 0..5 {
            let _ = insert(&mut table, DestinationKey::doc("doc1"));
        }
        assert_eq!(table.ids_matching(&DestinationKey::doc("doc1")), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_future() {
        let fut = ResponseFuture::failed(CommError::NoConnection);
        assert!(matches!(fut.now_or_never(), Some(Err(CommError::NoConnection))));
    }

    #[test]
    fn test_dropped_table_closes_futures() {
        let mut table = PendingTable::new();
        let (_, fut) = insert(&mut table, DestinationKey::Any);
        drop(table);
        assert!(matches!(fut.now_or_never(), Some(Err(CommError::Closed))));
    }
}
