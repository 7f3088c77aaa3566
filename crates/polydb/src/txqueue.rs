//! The transaction request queue.
//!
//! Requests buffer here until the connection is ready, then execute in
//! strict FIFO order, one at a time. The queue is bounded: overflow drops
//! the oldest pending request (logged, and resolved with an error so its
//! caller is not left hanging) to preserve liveness for the newest work. A
//! connection failure purges the queue, delivering the failure to every
//! pending request.

use std::collections::VecDeque;
use std::time::Duration;

use polydb_common::{DbError, Result, Value};
use tokio::sync::oneshot;

use crate::backend::{TxClosure, TxKind, TxMode};

pub(crate) const MAX_QUEUE_LEN: usize = 1000;

/// Diagnostic threshold: how long the queue head may run before a warning
/// is logged. Not an enforcement mechanism.
pub(crate) const STALENESS_THRESHOLD: Duration = Duration::from_millis(3000);
pub(crate) const STALENESS_THRESHOLD_DEBUG: Duration = Duration::from_millis(500);

/// One buffered transaction request.
pub(crate) struct TxRequest {
    pub label: &'static str,
    pub stores: Vec<String>,
    pub mode: TxMode,
    pub closure: TxClosure,
    pub done: oneshot::Sender<(TxKind, Result<Value>)>,
}

impl TxRequest {
    pub fn resolve_error(self, err: DbError) {
        let _ = self.done.send((TxKind::Error, Err(err)));
    }
}

pub(crate) struct RequestQueue {
    entries: VecDeque<TxRequest>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        RequestQueue {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a request. On overflow the oldest entry is dropped and
    /// resolved with an error.
    pub fn push(&mut self, request: TxRequest) {
        if self.entries.len() >= self.capacity
            && let Some(oldest) = self.entries.pop_front()
        {
            tracing::warn!(
                label = oldest.label,
                capacity = self.capacity,
                "transaction queue overflow, dropping oldest request"
            );
            oldest.resolve_error(DbError::InvalidState(
                "transaction queue overflow".into(),
            ));
        }
        self.entries.push_back(request);
    }

    pub fn pop(&mut self) -> Option<TxRequest> {
        self.entries.pop_front()
    }

    /// Drop every pending request, delivering `err` to each. Returns the
    /// number purged.
    pub fn purge(&mut self, err: &DbError) -> usize {
        let purged = self.entries.len();
        if purged > 0 {
            tracing::error!(pending = purged, error = %err, "purging transaction queue");
        }
        for request in self.entries.drain(..) {
            let _ = request.done.send((TxKind::Error, Err(err.clone())));
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        label: &'static str,
    ) -> (TxRequest, oneshot::Receiver<(TxKind, Result<Value>)>) {
        let (done, rx) = oneshot::channel();
        (
            TxRequest {
                label,
                stores: vec![],
                mode: TxMode::ReadOnly,
                closure: Box::new(|_| Ok(Value::Null)),
                done,
            },
            rx,
        )
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut queue = RequestQueue::new(10);
        let (a, _ra) = request("a");
        let (b, _rb) = request("b");
        queue.push(a);
        queue.push(b);
        assert_eq!(queue.pop().unwrap().label, "a");
        assert_eq!(queue.pop().unwrap().label, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_drops_the_oldest_entry() {
        let mut queue = RequestQueue::new(2);
        let (a, mut ra) = request("a");
        let (b, _rb) = request("b");
        let (c, _rc) = request("c");
        queue.push(a);
        queue.push(b);
        queue.push(c);

        assert_eq!(queue.len(), 2);
        // The oldest request was resolved with an error, not silently lost.
        let (kind, result) = ra.try_recv().unwrap();
        assert_eq!(kind, TxKind::Error);
        assert!(result.is_err());
        // The newest work survives.
        assert_eq!(queue.pop().unwrap().label, "b");
        assert_eq!(queue.pop().unwrap().label, "c");
    }

    #[test]
    fn purge_resolves_every_pending_request() {
        let mut queue = RequestQueue::new(10);
        let (a, mut ra) = request("a");
        let (b, mut rb) = request("b");
        queue.push(a);
        queue.push(b);

        let purged = queue.purge(&DbError::Constraint("open failed".into()));
        assert_eq!(purged, 2);
        assert!(queue.is_empty());

        for rx in [&mut ra, &mut rb] {
            let (kind, result) = rx.try_recv().unwrap();
            assert_eq!(kind, TxKind::Error);
            assert_eq!(result.unwrap_err().kind(), "constraint_error");
        }
    }
}
