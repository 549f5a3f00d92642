// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Events handed to listeners.

use crate::codec::Value;
use crate::connector::Connector;
use crate::message::{Message, MessageKind, Payload, RequestDescriptor, ResponseDescriptor};
use crate::peer::Peer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One delivery to a listener.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub channel: String,
    pub sender: Peer,
    /// Present when the message is a request.
    pub request: Option<Arc<RequestResponder>>,
}

impl BusEvent {
    pub fn is_request(&self) -> bool {
        self.request.is_some()
    }
}

/// Answers one request. The first `resolve` or `reject` wins.
#[derive(Debug)]
pub struct RequestResponder {
    connector: Connector,
    responder: Peer,
    requester: Peer,
    descriptor: RequestDescriptor,
    settled: AtomicBool,
}

impl RequestResponder {
    pub(crate) fn new(
        connector: Connector,
        responder: Peer,
        requester: Peer,
        descriptor: RequestDescriptor,
    ) -> Self {
        Self {
            connector,
            responder,
            requester,
            descriptor,
            settled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn requester(&self) -> &Peer {
        &self.requester
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Send a successful response. `false` if already settled or not sent.
    pub fn resolve(&self, value: impl Into<Value>) -> bool {
        self.settle(true, value.into())
    }

    /// Send a rejection. `false` if already settled or not sent.
    pub fn reject(&self, err: impl Into<Value>) -> bool {
        self.settle(false, err.into())
    }

    fn settle(&self, resolve: bool, value: Value) -> bool {
        if self.settled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let response = Message::new(
            MessageKind::RequestResponse(ResponseDescriptor {
                id: self.descriptor.id.clone(),
                resolve,
            }),
            self.descriptor.reply_channel.clone(),
            self.responder.clone(),
        )
        .with_target(self.requester.clone());
        self.connector
            .post_message(response, Some(Payload::Args(vec![value])))
    }
}
