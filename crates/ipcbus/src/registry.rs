// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference-counted channel subscriptions.
//!
//! Each channel maps to an insertion-ordered list of subscribers; a
//! subscriber is a peer key, how many times it subscribed, and opaque data
//! (the broker stores the peer's connection id). A reverse index keyed by
//! peer makes dropping a peer proportional to its own channel count.
//!
//! The registry has a single owner and no internal locking.

use crate::peer::PeerKey;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Net change in the set of channels with at least one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// First listener on the channel.
    ChannelAdded(String),
    /// Last listener on the channel dropped.
    ChannelRemoved(String),
}

impl ChannelEvent {
    pub fn channel(&self) -> &str {
        match self {
            Self::ChannelAdded(c) | Self::ChannelRemoved(c) => c,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscriber<D> {
    key: PeerKey,
    ref_count: usize,
    data: D,
}

/// Channel subscription registry.
#[derive(Debug, Clone)]
pub struct ChannelRegistry<D> {
    channels: HashMap<String, Vec<Subscriber<D>>>,
    by_peer: HashMap<PeerKey, BTreeSet<String>>,
}

impl<D> Default for ChannelRegistry<D> {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            by_peer: HashMap::new(),
        }
    }
}

impl<D> ChannelRegistry<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference for `key` on `channel`.
    ///
    /// `data` is stored on the first reference and kept afterwards.
    pub fn add_ref(&mut self, channel: &str, key: &PeerKey, data: D) -> Option<ChannelEvent> {
        let created = !self.channels.contains_key(channel);
        let subscribers = self.channels.entry(channel.to_string()).or_default();

        match subscribers.iter_mut().find(|s| &s.key == key) {
            Some(existing) => existing.ref_count += 1,
            None => {
                subscribers.push(Subscriber {
                    key: key.clone(),
                    ref_count: 1,
                    data,
                });
                self.by_peer
                    .entry(key.clone())
                    .or_default()
                    .insert(channel.to_string());
            }
        }

        created.then(|| ChannelEvent::ChannelAdded(channel.to_string()))
    }

    /// Drop one reference. Releasing an absent entry is a no-op.
    pub fn release(&mut self, channel: &str, key: &PeerKey) -> Option<ChannelEvent> {
        let subscribers = self.channels.get_mut(channel)?;
        let idx = subscribers.iter().position(|s| &s.key == key)?;
        subscribers[idx].ref_count -= 1;
        if subscribers[idx].ref_count > 0 {
            return None;
        }
        self.drop_subscriber(channel, idx, key)
    }

    /// Drop every reference `key` holds on `channel`.
    pub fn release_all(&mut self, channel: &str, key: &PeerKey) -> Option<ChannelEvent> {
        let subscribers = self.channels.get(channel)?;
        let idx = subscribers.iter().position(|s| &s.key == key)?;
        self.drop_subscriber(channel, idx, key)
    }

    /// Drop every subscription of `key`. Events come in channel name order.
    pub fn remove(&mut self, key: &PeerKey) -> Vec<ChannelEvent> {
        let Some(channels) = self.by_peer.remove(key) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for channel in channels {
            if let Some(subscribers) = self.channels.get_mut(&channel) {
                subscribers.retain(|s| &s.key != key);
                if subscribers.is_empty() {
                    self.channels.remove(&channel);
                    events.push(ChannelEvent::ChannelRemoved(channel));
                }
            }
        }
        events
    }

    fn drop_subscriber(&mut self, channel: &str, idx: usize, key: &PeerKey) -> Option<ChannelEvent> {
        let subscribers = self.channels.get_mut(channel)?;
        subscribers.remove(idx);

        if let Some(peer_channels) = self.by_peer.get_mut(key) {
            peer_channels.remove(channel);
            if peer_channels.is_empty() {
                self.by_peer.remove(key);
            }
        }

        if subscribers.is_empty() {
            self.channels.remove(channel);
            return Some(ChannelEvent::ChannelRemoved(channel.to_string()));
        }
        None
    }

    /// Visit `(key, ref_count, data)` for every subscriber of `channel`, in
    /// subscription order.
    pub fn for_each_channel<F>(&self, channel: &str, mut f: F)
    where
        F: FnMut(&PeerKey, usize, &D),
    {
        if let Some(subscribers) = self.channels.get(channel) {
            for s in subscribers {
                f(&s.key, s.ref_count, &s.data);
            }
        }
    }

    /// Distinct data values of the subscribers of `channel`, skipping
    /// `exclude`. Order follows the first subscriber carrying each value.
    pub fn channel_conns(&self, channel: &str, exclude: Option<&PeerKey>) -> Vec<D>
    where
        D: Clone + PartialEq,
    {
        let mut out: Vec<D> = Vec::new();
        self.for_each_channel(channel, |key, _, data| {
            if Some(key) != exclude && !out.contains(data) {
                out.push(data.clone());
            }
        });
        out
    }

    /// Channels with at least one listener, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut out: Vec<String> = self.channels.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// References `key` holds on `channel` (0 when absent).
    pub fn ref_count(&self, channel: &str, key: &PeerKey) -> usize {
        self.channels
            .get(channel)
            .and_then(|subs| subs.iter().find(|s| &s.key == key))
            .map_or(0, |s| s.ref_count)
    }

    /// Channels `key` is subscribed to.
    pub fn peer_channels(&self, key: &PeerKey) -> Vec<String> {
        self.by_peer
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn peer_count(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let channels = self
            .channels
            .iter()
            .map(|(channel, subs)| {
                let entries = subs
                    .iter()
                    .map(|s| SubscriberSnapshot {
                        peer: s.key.clone(),
                        ref_count: s.ref_count,
                    })
                    .collect();
                (channel.clone(), entries)
            })
            .collect();
        RegistrySnapshot { channels }
    }
}

/// Serializable view of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct RegistrySnapshot {
    pub channels: BTreeMap<String, Vec<SubscriberSnapshot>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct SubscriberSnapshot {
    pub peer: PeerKey,
    pub ref_count: usize,
}
