//! Who listens to which setting.
//!
//! The daemon keeps one subscriber set per setting name. A subscriber is
//! the `(server, service)` pair taken from the message envelope of the
//! `LISTEN` request; the same pair may watch any number of names. The last
//! subscriber of a name leaving drops the map entry.

use std::collections::{BTreeMap, BTreeSet};

/// A listening `(server, service)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Subscriber {
    pub server: String,
    pub service: String,
}

impl Subscriber {
    pub fn new(server: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            service: service.into(),
        }
    }
}

/// Per-name subscriber sets.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    listeners: BTreeMap<String, BTreeSet<Subscriber>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for each name. Returns true when the
    /// subscriber was already registered for at least one of them
    /// (the "already registered" reply signal).
    pub fn listen(&mut self, subscriber: &Subscriber, names: &[String]) -> bool {
        let mut already = false;
        for name in names {
            if !self
                .listeners
                .entry(name.clone())
                .or_default()
                .insert(subscriber.clone())
            {
                already = true;
            }
        }
        already
    }

    /// Drop a subscriber from each name. Returns true when the subscriber
    /// was not registered for at least one of them (the "not listening"
    /// reply signal).
    pub fn forget(&mut self, subscriber: &Subscriber, names: &[String]) -> bool {
        let mut missing = false;
        for name in names {
            match self.listeners.get_mut(name) {
                Some(set) => {
                    if !set.remove(subscriber) {
                        missing = true;
                    }
                    if set.is_empty() {
                        self.listeners.remove(name);
                    }
                }
                None => missing = true,
            }
        }
        missing
    }

    /// Everyone to notify about a change to `name`.
    pub fn subscribers(&self, name: &str) -> Vec<Subscriber> {
        self.listeners
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every subscription of a service that went away. When `server`
    /// is given, only that server's instance is dropped. Returns how many
    /// subscriptions were removed.
    pub fn forget_service(&mut self, server: Option<&str>, service: &str) -> usize {
        let mut removed = 0;
        self.listeners.retain(|_, set| {
            let before = set.len();
            set.retain(|sub| {
                sub.service != service || server.is_some_and(|srv| sub.server != srv)
            });
            removed += before - set.len();
            !set.is_empty()
        });
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
