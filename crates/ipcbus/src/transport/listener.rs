// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listener registrations of one transport.

use super::event::BusEvent;
use crate::codec::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback for messages on a channel.
///
/// Runs on the connector's reader task and must not block.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &BusEvent, args: &[Value]);
}

impl<F> Listener for F
where
    F: Fn(&BusEvent, &[Value]) + Send + Sync,
{
    fn on_event(&self, event: &BusEvent, args: &[Value]) {
        self(event, args)
    }
}

/// Registration handle returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Listeners by channel, in registration order.
#[derive(Default)]
pub(crate) struct ListenerTable {
    next: u64,
    by_channel: BTreeMap<String, Vec<(ListenerId, Arc<dyn Listener>)>>,
    channel_of: BTreeMap<ListenerId, String>,
}

impl ListenerTable {
    pub(crate) fn add(&mut self, channel: &str, listener: Arc<dyn Listener>) -> ListenerId {
        self.next += 1;
        let id = ListenerId(self.next);
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .push((id, listener));
        self.channel_of.insert(id, channel.to_string());
        id
    }

    /// Returns the channel the listener was on.
    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<String> {
        let channel = self.channel_of.remove(&id)?;
        if let Some(list) = self.by_channel.get_mut(&channel) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                self.by_channel.remove(&channel);
            }
        }
        Some(channel)
    }

    /// Drop every listener on `channel`; returns how many.
    pub(crate) fn remove_channel(&mut self, channel: &str) -> usize {
        let removed = self.by_channel.remove(channel).unwrap_or_default();
        for (id, _) in &removed {
            self.channel_of.remove(id);
        }
        removed.len()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.channel_of.len();
        self.by_channel.clear();
        self.channel_of.clear();
        count
    }

    pub(crate) fn listeners(&self, channel: &str) -> Vec<Arc<dyn Listener>> {
        self.by_channel
            .get(channel)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// One entry per listener, for re-subscribing after a reconnect.
    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.by_channel
            .iter()
            .flat_map(|(channel, list)| std::iter::repeat(channel.clone()).take(list.len()))
            .collect()
    }

    pub(crate) fn count(&self, channel: Option<&str>) -> usize {
        match channel {
            Some(c) => self.by_channel.get(c).map_or(0, Vec::len),
            None => self.channel_of.len(),
        }
    }
}
