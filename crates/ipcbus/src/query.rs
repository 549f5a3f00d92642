// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Query-state sessions.
//!
//! A query fans out from the requester's broker across its bridge link.
//! Every broker answers with a `QueryStateResponse` whose report carries an
//! `expect` count: how many further replies it caused. The session is
//! complete once `1 + sum(expect)` replies have arrived.

use crate::codec::Value;
use crate::peer::Peer;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tokio::sync::oneshot;

/// One broker's answer.
#[derive(Debug, Clone)]
pub struct QueryReply {
    pub sender: Peer,
    pub state: Value,
}

impl QueryReply {
    pub fn broker(&self) -> Option<&str> {
        self.state.get("broker").and_then(Value::as_str)
    }

    /// Channel names with at least one subscriber on this broker.
    pub fn channels(&self) -> Vec<String> {
        match self.state.get("channels") {
            Some(Value::Object(entries)) => entries.iter().map(|(k, _)| k.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

/// Aggregated result of one session.
#[derive(Debug, Clone)]
pub struct QueryReport {
    pub session: String,
    pub replies: Vec<QueryReply>,
    /// `false` when the deadline passed or the session was superseded.
    pub complete: bool,
}

impl QueryReport {
    fn empty(session: String) -> Self {
        Self {
            session,
            replies: Vec::new(),
            complete: false,
        }
    }

    /// Union of channels across every replying broker.
    pub fn channels(&self) -> BTreeSet<String> {
        self.replies.iter().flat_map(QueryReply::channels).collect()
    }
}

struct Session {
    id: String,
    expected: usize,
    replies: Vec<QueryReply>,
    done: oneshot::Sender<QueryReport>,
}

impl Session {
    fn finish(self, complete: bool) {
        let _ = self.done.send(QueryReport {
            session: self.id,
            replies: self.replies,
            complete,
        });
    }
}

/// Tracks the current query session of a transport.
///
/// Replies for any other session are stale and ignored.
#[derive(Default)]
pub(crate) struct QueryCollector {
    current: Mutex<Option<Session>>,
}

impl QueryCollector {
    /// Start a session, superseding the current one.
    pub(crate) fn begin(&self) -> (String, oneshot::Receiver<QueryReport>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (done, rx) = oneshot::channel();
        let previous = self.current.lock().replace(Session {
            id: id.clone(),
            expected: 1,
            replies: Vec::new(),
            done,
        });
        if let Some(previous) = previous {
            previous.finish(false);
        }
        (id, rx)
    }

    /// Record a reply. Returns `false` for a stale session.
    pub(crate) fn offer(&self, session: &str, sender: Peer, state: Value) -> bool {
        let mut current = self.current.lock();
        let Some(active) = current.as_mut().filter(|s| s.id == session) else {
            return false;
        };

        let more = state
            .get("expect")
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0) as usize;
        active.expected += more;
        active.replies.push(QueryReply { sender, state });

        if active.replies.len() >= active.expected {
            if let Some(finished) = current.take() {
                finished.finish(true);
            }
        }
        true
    }

    /// End `session` at its deadline with whatever arrived.
    pub(crate) fn expire(&self, session: &str) -> QueryReport {
        let mut current = self.current.lock();
        let taken = if current.as_ref().is_some_and(|s| s.id == session) {
            current.take()
        } else {
            None
        };
        match taken {
            Some(s) => QueryReport {
                session: s.id,
                replies: s.replies,
                complete: false,
            },
            None => QueryReport::empty(session.to_string()),
        }
    }

    pub(crate) fn cancel(&self) {
        if let Some(s) = self.current.lock().take() {
            s.finish(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ProcessType;

    fn broker_peer() -> Peer {
        Peer::new(ProcessType::Bridge)
    }

    fn report(name: &str, expect: i64) -> Value {
        Value::object([
            ("broker", Value::from(name)),
            (
                "channels",
                Value::object([("news", Value::Array(Vec::new()))]),
            ),
            ("expect", Value::Int(expect)),
        ])
    }

    #[tokio::test]
    async fn test_session_completes_after_expected_replies() {
        let collector = QueryCollector::default();
        let (session, rx) = collector.begin();

        assert!(collector.offer(&session, broker_peer(), report("local", 1)));
        assert!(collector.offer(&session, broker_peer(), report("upstream", 0)));

        let report = rx.await.unwrap();
        assert!(report.complete);
        assert_eq!(report.replies.len(), 2);
        assert_eq!(report.replies[1].broker(), Some("upstream"));
        assert_eq!(
            report.channels().into_iter().collect::<Vec<_>>(),
            vec!["news".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stale_session_is_ignored() {
        let collector = QueryCollector::default();
        let (old, old_rx) = collector.begin();
        let (new, _new_rx) = collector.begin();

        let superseded = old_rx.await.unwrap();
        assert!(!superseded.complete);

        assert!(!collector.offer(&old, broker_peer(), report("late", 0)));
        assert!(collector.offer(&new, broker_peer(), report("fresh", 0)));
    }

    #[test]
    fn test_expire_returns_partial() {
        let collector = QueryCollector::default();
        let (session, _rx) = collector.begin();
        assert!(collector.offer(&session, broker_peer(), report("local", 1)));

        let partial = collector.expire(&session);
        assert!(!partial.complete);
        assert_eq!(partial.replies.len(), 1);
        assert!(collector.expire(&session).replies.is_empty());
    }
}
