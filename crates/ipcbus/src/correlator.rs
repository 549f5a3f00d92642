// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response correlation.

use crate::codec::Value;
use crate::error::{ProtocolError, RequestError};
use crate::message::Payload;
use crate::peer::Peer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A resolved request.
#[derive(Debug, Clone)]
pub struct Response {
    /// Peer that answered.
    pub sender: Peer,
    /// Channel the request was issued on.
    pub channel: String,
    pub payload: Option<Payload>,
}

impl Response {
    /// Decoded response arguments (empty when absent).
    pub fn args(&self) -> Result<Vec<Value>, ProtocolError> {
        match &self.payload {
            Some(payload) => payload.to_args(),
            None => Ok(Vec::new()),
        }
    }

    /// First argument, the resolved value by convention.
    pub fn value(&self) -> Result<Value, ProtocolError> {
        Ok(self.args()?.into_iter().next().unwrap_or_default())
    }
}

type Outcome = Result<Response, RequestError>;

/// Outstanding requests of one transport.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new request id.
    pub fn register(self: &Arc<Self>, channel: &str) -> PendingRequest {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);
        PendingRequest {
            id,
            channel: channel.to_string(),
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Settle `id`. Returns `false` if it was not pending (already settled,
    /// timed out, or abandoned by the caller).
    pub fn settle(&self, id: &str, outcome: Outcome) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding request.
    pub fn fail_all(&self, err: RequestError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, id: &str) {
        self.pending.lock().remove(id);
    }
}

/// Caller side of one request. Dropping it removes the entry.
#[derive(Debug)]
pub struct PendingRequest {
    id: String,
    channel: String,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome; `None` waits without deadline.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Outcome {
        let result = match timeout {
            Some(after) => match tokio::time::timeout(after, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(RequestError::Timeout {
                        channel: self.channel.clone(),
                        after,
                    })
                }
            },
            None => (&mut self.rx).await,
        };
        result.unwrap_or(Err(RequestError::Closed))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.forget(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ProcessType;

    fn response() -> Response {
        Response {
            sender: Peer::new(ProcessType::Worker),
            channel: "svc".into(),
            payload: Some(Payload::Args(vec![Value::Int(42)])),
        }
    }

    #[tokio::test]
    async fn test_settle_once() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register("svc");
        let id = pending.id().to_string();

        assert!(correlator.settle(&id, Ok(response())));
        assert!(!correlator.settle(&id, Ok(response())));

        let resolved = pending.wait(None).await.unwrap();
        assert_eq!(resolved.value().unwrap(), Value::Int(42));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register("svc");
        let id = pending.id().to_string();

        let err = pending
            .wait(Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.settle(&id, Ok(response())));
    }

    #[tokio::test]
    async fn test_drop_forgets() {
        let correlator = RequestCorrelator::new();
        let pending = correlator.register("svc");
        assert_eq!(correlator.pending_count(), 1);
        drop(pending);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = RequestCorrelator::new();
        let a = correlator.register("a");
        let b = correlator.register("b");
        assert_eq!(correlator.fail_all(RequestError::Closed), 2);

        assert!(matches!(a.wait(None).await, Err(RequestError::Closed)));
        assert!(matches!(b.wait(None).await, Err(RequestError::Closed)));
    }
}
