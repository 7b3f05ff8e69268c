// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! In-process publish/subscribe event bus.
//!
//! Topics are hierarchical strings (`"status/wifi"`, `"cmd/bt"`); payloads
//! are the canonical [`Payload`] record shared by every publisher and
//! subscriber. Dispatch is synchronous and single-threaded: subscribers
//! for a topic fire in registration order against a snapshot of the
//! subscriber list, so handlers that subscribe or unsubscribe mid-dispatch
//! do not affect the dispatch in flight. A panicking subscriber is caught
//! and logged; it never stops dispatch to the remaining subscribers.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

/// Canonical event payload: an ordered string-keyed record.
pub type Payload = serde_json::Map<String, Value>;

/// Convert a `serde_json::json!` object literal into a [`Payload`].
/// Non-object values yield an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Cache lifetime attached to a publish.
///
/// The bus itself ignores this; it is consumed by the status layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Resolve against the status layer's configured defaults.
    Default,
    /// Expire this many milliseconds after recording.
    Ms(u64),
    /// Never expires; an explicit statement, not a timeout.
    Sticky,
}

/// A published event as seen by subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
    pub ttl: Ttl,
}

impl Event {
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

/// Subscriber callback. Invoked synchronously during `publish`.
pub type Callback = Box<dyn FnMut(&Event)>;

/// Opaque unsubscribe token returned by `subscribe`.
#[derive(Debug)]
pub struct Token {
    topic: String,
    id: u64,
}

/// Publish/subscribe contract shared by the raw bus and the status-caching
/// wrapper in front of it. Managers hold `Rc<dyn Bus>` and never know
/// which one they were given.
pub trait Bus {
    fn subscribe(&self, topic: &str, cb: Callback) -> Token;
    fn subscribe_once(&self, topic: &str, cb: Callback) -> Token;
    fn unsubscribe(&self, token: Token);
    fn publish_ttl(&self, topic: &str, payload: Payload, ttl: Ttl);

    fn publish(&self, topic: &str, payload: Payload) {
        self.publish_ttl(topic, payload, Ttl::Default);
    }
}

/// Shared handle to a bus implementation.
pub type BusHandle = Rc<dyn Bus>;

struct SubEntry {
    id: u64,
    once: bool,
    cb: Rc<RefCell<Callback>>,
}

/// The in-process event bus.
pub struct EventBus {
    subs: RefCell<HashMap<String, Vec<SubEntry>>>,
    next_id: Cell<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    fn register(&self, topic: &str, cb: Callback, once: bool) -> Token {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.subs
            .borrow_mut()
            .entry(topic.to_string())
            .or_default()
            .push(SubEntry {
                id,
                once,
                cb: Rc::new(RefCell::new(cb)),
            });
        Token {
            topic: topic.to_string(),
            id,
        }
    }

    fn remove(&self, topic: &str, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut subs = self.subs.borrow_mut();
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|entry| !ids.contains(&entry.id));
            if list.is_empty() {
                subs.remove(topic);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for EventBus {
    fn subscribe(&self, topic: &str, cb: Callback) -> Token {
        self.register(topic, cb, false)
    }

    fn subscribe_once(&self, topic: &str, cb: Callback) -> Token {
        self.register(topic, cb, true)
    }

    fn unsubscribe(&self, token: Token) {
        self.remove(&token.topic, &[token.id]);
    }

    fn publish_ttl(&self, topic: &str, payload: Payload, ttl: Ttl) {
        // Snapshot under the borrow, then dispatch without it so handlers
        // may subscribe/unsubscribe/publish freely.
        let snapshot: Vec<(u64, bool, Rc<RefCell<Callback>>)> = {
            let subs = self.subs.borrow();
            match subs.get(topic) {
                Some(list) => list
                    .iter()
                    .map(|e| (e.id, e.once, Rc::clone(&e.cb)))
                    .collect(),
                None => return,
            }
        };

        let event = Event {
            topic: topic.to_string(),
            payload,
            ttl,
        };

        let mut spent: Vec<u64> = Vec::new();
        for (id, once, cb) in snapshot {
            // A callback already running further up the stack is skipped
            // rather than re-entered.
            match cb.try_borrow_mut() {
                Ok(mut cb) => {
                    let result = catch_unwind(AssertUnwindSafe(|| (*cb)(&event)));
                    if result.is_err() {
                        warn!("subscriber for '{}' panicked; dropped", topic);
                    }
                }
                Err(_) => {
                    warn!("re-entrant dispatch on '{}'; subscriber skipped", topic);
                }
            }
            if once {
                spent.push(id);
            }
        }
        self.remove(topic, &spent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Callback {
        let log = Rc::clone(log);
        Box::new(move |_ev| log.borrow_mut().push(tag))
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        bus.subscribe("t", order_recorder(&log, "a"));
        bus.subscribe("t", order_recorder(&log, "b"));
        bus.subscribe("t", order_recorder(&log, "c"));
        bus.publish("t", Payload::new());
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        bus.subscribe_once("t", Box::new(move |_| c.set(c.get() + 1)));
        bus.publish("t", Payload::new());
        bus.publish("t", Payload::new());
        bus.publish("t", Payload::new());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let reached = Rc::new(Cell::new(false));
        bus.subscribe("t", Box::new(|_| panic!("boom")));
        let r = Rc::clone(&reached);
        bus.subscribe("t", Box::new(move |_| r.set(true)));
        bus.publish("t", Payload::new());
        assert!(reached.get());
    }

    #[test]
    fn test_once_removed_even_if_it_panics() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        bus.subscribe_once(
            "t",
            Box::new(move |_| {
                c.set(c.get() + 1);
                panic!("boom");
            }),
        );
        bus.publish("t", Payload::new());
        bus.publish("t", Payload::new());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let token = bus.subscribe("t", Box::new(move |_| c.set(c.get() + 1)));
        bus.unsubscribe(token);
        // Second removal of the same registration is a no-op.
        bus.unsubscribe(Token {
            topic: "t".into(),
            id: 999,
        });
        bus.publish("t", Payload::new());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_subscribe_during_dispatch_misses_current_publish() {
        let bus = Rc::new(EventBus::new());
        let count = Rc::new(Cell::new(0));
        let b = Rc::clone(&bus);
        let c = Rc::clone(&count);
        bus.subscribe(
            "t",
            Box::new(move |_| {
                let c2 = Rc::clone(&c);
                b.subscribe("t", Box::new(move |_| c2.set(c2.get() + 1)));
            }),
        );
        bus.publish("t", Payload::new());
        assert_eq!(count.get(), 0, "late subscriber must not see the snapshot");
        bus.publish("t", Payload::new());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_snapshot() {
        let bus = Rc::new(EventBus::new());
        let log = Rc::new(RefCell::new(Vec::new()));
        let token_slot: Rc<RefCell<Option<Token>>> = Rc::new(RefCell::new(None));

        let b = Rc::clone(&bus);
        let slot = Rc::clone(&token_slot);
        bus.subscribe(
            "t",
            Box::new(move |_| {
                if let Some(tok) = slot.borrow_mut().take() {
                    b.unsubscribe(tok);
                }
            }),
        );
        let token = bus.subscribe("t", order_recorder(&log, "b"));
        *token_slot.borrow_mut() = Some(token);

        // "b" is unsubscribed by the first handler but still fires this
        // round because dispatch runs against the snapshot.
        bus.publish("t", Payload::new());
        assert_eq!(*log.borrow(), vec!["b"]);
        bus.publish("t", Payload::new());
        assert_eq!(*log.borrow(), vec!["b"]);
    }

    #[test]
    fn test_ttl_option_is_ignored_by_bus() {
        let bus = EventBus::new();
        let seen = Rc::new(Cell::new(false));
        let s = Rc::clone(&seen);
        bus.subscribe("t", Box::new(move |ev| s.set(ev.ttl == Ttl::Ms(5_000))));
        bus.publish_ttl("t", Payload::new(), Ttl::Ms(5_000));
        assert!(seen.get());
    }

    #[test]
    fn test_payload_helper_and_accessors() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(String::new()));
        let s = Rc::clone(&seen);
        bus.subscribe(
            "cmd/wifi",
            Box::new(move |ev| {
                *s.borrow_mut() = ev.str_field("state").unwrap_or("").to_string();
            }),
        );
        bus.publish("cmd/wifi", payload(json!({ "state": "toggle" })));
        assert_eq!(*seen.borrow(), "toggle");
    }
}
