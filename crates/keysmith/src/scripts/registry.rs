//! Channel subscription registry
//!
//! One registry per store connection maps each subscribed channel (literal or
//! pattern) to the handlers interested in it, so a single server-side
//! subscription can fan out to any number of in-process waiters.

use std::sync::Arc;

use dashmap::DashMap;
use keysmith_common::Channel;

use super::NotificationHandler;

#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: DashMap<Channel, Vec<Arc<dyn NotificationHandler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns `true` when it is the first one for the channel.
    pub fn add(&self, channel: &Channel, handler: Arc<dyn NotificationHandler>) -> bool {
        let mut handlers = self.channels.entry(channel.clone()).or_default();
        handlers.push(handler);
        handlers.len() == 1
    }

    /// Remove one registration of `handler`. Returns `true` when the channel has
    /// no handler left afterwards.
    pub fn remove(&self, channel: &Channel, handler: &Arc<dyn NotificationHandler>) -> bool {
        let emptied = match self.channels.get_mut(channel) {
            Some(mut handlers) => {
                if let Some(position) = handlers.iter().position(|h| same_handler(h, handler)) {
                    handlers.remove(position);
                }
                handlers.is_empty()
            }
            None => return false,
        };

        if emptied {
            self.channels.remove_if(channel, |_, handlers| handlers.is_empty());
        }
        emptied
    }

    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn handler_count(&self, channel: &Channel) -> usize {
        self.channels.get(channel).map(|h| h.len()).unwrap_or(0)
    }

    /// Deliver a message received through the subscription `subscription`.
    pub fn dispatch(&self, subscription: &Channel, channel: &str, payload: &[u8]) {
        let handlers = match self.channels.get(subscription) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            handler.handle(channel, payload);
        }
    }

    /// Deliver a message published on `channel` to every matching subscription.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let handlers: Vec<Arc<dyn NotificationHandler>> = self
            .channels
            .iter()
            .filter(|entry| {
                let subscription = entry.key();
                if subscription.is_pattern() {
                    glob_match(subscription.name().as_bytes(), channel.as_bytes())
                } else {
                    subscription.name() == channel
                }
            })
            .flat_map(|entry| entry.value().clone())
            .collect();

        for handler in &handlers {
            handler.handle(channel, payload);
        }
        handlers.len()
    }
}

fn same_handler(a: &Arc<dyn NotificationHandler>, b: &Arc<dyn NotificationHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Redis-style glob matching supporting `*`, `?` and `\` escapes
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
                continue;
            }
            Some(b'?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some(b'\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
                continue;
            }
            Some(&c) if c != b'\\' && c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }

        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
