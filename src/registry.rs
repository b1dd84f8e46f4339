use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::event::Event;

/// Events held back for a channel whose subscription is not yet acknowledged
const MAX_BUFFERED_EVENTS: usize = 100;

struct Entry {
    channel: Channel,
    buffered: VecDeque<Event>,
}

/// Outcome of routing an inbound channel event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// No such channel in the registry
    Dropped,
    /// Held until the subscription is acknowledged
    Buffered,
    /// Handed to this many callbacks
    Dispatched(usize),
}

/// Channel name to Channel map. Iteration order is the name order, which
/// keeps re-subscription deterministic.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: BTreeMap<String, Entry>,
}

impl ChannelRegistry {
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name).map(|entry| &entry.channel)
    }

    /// Return the existing channel, or store the one built by `create`.
    /// The flag is true when a new channel was stored.
    pub fn get_or_insert_with<F>(&mut self, name: &str, create: F) -> (Channel, bool)
    where
        F: FnOnce() -> Channel,
    {
        if let Some(entry) = self.channels.get(name) {
            return (entry.channel.clone(), false);
        }
        let channel = create();
        self.channels.insert(
            name.to_string(),
            Entry {
                channel: channel.clone(),
                buffered: VecDeque::new(),
            },
        );
        (channel, true)
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.channels.remove(name).map(|entry| {
            entry.channel.set_subscribed(false);
            entry.channel
        })
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels
            .values()
            .map(|entry| entry.channel.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// The socket is gone: nothing is subscribed and buffered events are stale
    pub fn mark_all_unsubscribed(&mut self) {
        for entry in self.channels.values_mut() {
            entry.channel.set_subscribed(false);
            entry.buffered.clear();
        }
    }

    /// Route an event to its channel's callbacks, or buffer it while the
    /// subscription is pending.
    pub fn deliver(&mut self, name: &str, event: Event) -> Delivery {
        let Some(entry) = self.channels.get_mut(name) else {
            debug!("Dropping {} for unknown channel {}", event.name, name);
            return Delivery::Dropped;
        };

        if entry.channel.is_subscribed() {
            return Delivery::Dispatched(entry.channel.dispatch(&event));
        }

        if entry.buffered.len() >= MAX_BUFFERED_EVENTS {
            warn!("Event buffer full for {}, dropping oldest event", name);
            entry.buffered.pop_front();
        }
        entry.buffered.push_back(event);
        Delivery::Buffered
    }

    /// Mark the channel subscribed, run the callbacks bound to the
    /// acknowledgement itself, then flush anything buffered.
    pub fn confirm(&mut self, name: &str, ack: &Event) -> Delivery {
        let Some(entry) = self.channels.get_mut(name) else {
            debug!("Subscription acknowledged for unknown channel {}", name);
            return Delivery::Dropped;
        };

        entry.channel.set_subscribed(true);
        let mut count = entry.channel.dispatch(ack);
        while let Some(event) = entry.buffered.pop_front() {
            count += entry.channel.dispatch(&event);
        }
        Delivery::Dispatched(count)
    }
}
