// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Last-known-good status cache.
//!
//! Screens and watchfaces must render correct radio/battery icons the
//! moment they become visible, before any fresh event arrives. The store
//! gives them a passive read path: every publish on a whitelisted topic
//! prefix is recorded with a TTL, and staleness is computed lazily on
//! read. No timers, no background eviction.
//!
//! Interception is an explicit decorator: [`StatusBus`] implements the
//! same [`Bus`] contract as the raw bus and is the handle every manager
//! receives, so call sites never change and nothing is rebound at
//! runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;

use crate::bus::{Bus, Callback, Payload, Token, Ttl};
use crate::clock::Clock;

#[derive(Debug, Clone)]
struct StatusEntry {
    payload: Payload,
    recorded_at: u64,
    ttl_ms: Option<u64>,
}

/// One row of a debug snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub topic: String,
    pub age_ms: u64,
    pub ttl_ms: Option<u64>,
    pub fresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

/// Passive TTL cache of the latest payload per whitelisted topic.
pub struct StatusStore {
    entries: RefCell<HashMap<String, StatusEntry>>,
    ttl_defaults: RefCell<HashMap<String, Option<u64>>>,
    prefixes: Vec<String>,
    clock: Rc<dyn Clock>,
    attached: Cell<bool>,
}

impl StatusStore {
    /// New store caching topics under the given prefixes
    /// (default whitelist: `["status/"]`). An empty prefix list caches
    /// everything.
    pub fn new(clock: Rc<dyn Clock>, prefixes: Vec<String>) -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            ttl_defaults: RefCell::new(HashMap::new()),
            prefixes,
            clock,
            attached: Cell::new(false),
        }
    }

    pub fn with_default_prefixes(clock: Rc<dyn Clock>) -> Self {
        Self::new(clock, vec!["status/".to_string()])
    }

    /// Enable interception. Idempotent.
    pub fn attach(&self) {
        self.attached.set(true);
    }

    /// Disable interception; publishes pass through untouched afterwards.
    /// Idempotent and symmetric with [`attach`](Self::attach).
    pub fn detach(&self) {
        self.attached.set(false);
    }

    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    /// Record a publish if the topic is whitelisted. Called by
    /// [`StatusBus`] before forwarding.
    fn record(&self, topic: &str, payload: &Payload, ttl: Ttl) {
        if !self.attached.get() || !self.is_whitelisted(topic) {
            return;
        }
        let ttl_ms = self.resolve_ttl(topic, ttl);
        self.entries.borrow_mut().insert(
            topic.to_string(),
            StatusEntry {
                payload: payload.clone(),
                recorded_at: self.clock.now_ms(),
                ttl_ms,
            },
        );
    }

    /// Effective TTL: explicit argument, else per-topic default, else
    /// wildcard default, else no expiry.
    fn resolve_ttl(&self, topic: &str, ttl: Ttl) -> Option<u64> {
        match ttl {
            Ttl::Ms(ms) => Some(ms),
            Ttl::Sticky => None,
            Ttl::Default => {
                let defaults = self.ttl_defaults.borrow();
                if let Some(ttl) = defaults.get(topic) {
                    *ttl
                } else if let Some(ttl) = defaults.get("*") {
                    *ttl
                } else {
                    None
                }
            }
        }
    }

    fn is_whitelisted(&self, topic: &str) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }
        self.prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }

    fn is_fresh(&self, entry: &StatusEntry, now: u64) -> bool {
        match entry.ttl_ms {
            None => true,
            Some(ttl) => now.saturating_sub(entry.recorded_at) <= ttl,
        }
    }

    /// Latest payload for `topic`, or `None` if absent (or stale when
    /// `fresh_only` is set).
    pub fn get(&self, topic: &str, fresh_only: bool) -> Option<Payload> {
        let entries = self.entries.borrow();
        let entry = entries.get(topic)?;
        if fresh_only && !self.is_fresh(entry, self.clock.now_ms()) {
            return None;
        }
        Some(entry.payload.clone())
    }

    pub fn has(&self, topic: &str, fresh_only: bool) -> bool {
        self.get(topic, fresh_only).is_some()
    }

    /// Milliseconds since the last record for `topic`, floored at zero.
    pub fn age_ms(&self, topic: &str) -> Option<u64> {
        let entries = self.entries.borrow();
        let entry = entries.get(topic)?;
        Some(self.clock.now_ms().saturating_sub(entry.recorded_at))
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Set (or clear, with `None`) the default TTL for a topic. The
    /// pseudo-topic `"*"` sets the wildcard default.
    pub fn set_default_ttl(&self, topic: &str, ttl_ms: Option<u64>) {
        self.ttl_defaults
            .borrow_mut()
            .insert(topic.to_string(), ttl_ms);
    }

    pub fn defaults(&self) -> HashMap<String, Option<u64>> {
        self.ttl_defaults.borrow().clone()
    }

    /// Lightweight dump for debugging or a diagnostics screen.
    pub fn snapshot(&self, include_payload: bool) -> Vec<SnapshotEntry> {
        let now = self.clock.now_ms();
        self.entries
            .borrow()
            .iter()
            .map(|(topic, entry)| SnapshotEntry {
                topic: topic.clone(),
                age_ms: now.saturating_sub(entry.recorded_at),
                ttl_ms: entry.ttl_ms,
                fresh: self.is_fresh(entry, now),
                payload: include_payload.then(|| entry.payload.clone()),
            })
            .collect()
    }
}

/// Bus decorator that records whitelisted publishes into a [`StatusStore`]
/// before forwarding them unchanged to the inner bus.
pub struct StatusBus {
    inner: Rc<dyn Bus>,
    store: Rc<StatusStore>,
}

impl StatusBus {
    /// Wrap `inner`, attaching the store. The returned handle is what
    /// every manager should be constructed with.
    pub fn new(inner: Rc<dyn Bus>, store: Rc<StatusStore>) -> Self {
        store.attach();
        Self { inner, store }
    }

    pub fn store(&self) -> &Rc<StatusStore> {
        &self.store
    }
}

impl Bus for StatusBus {
    fn subscribe(&self, topic: &str, cb: Callback) -> Token {
        self.inner.subscribe(topic, cb)
    }

    fn subscribe_once(&self, topic: &str, cb: Callback) -> Token {
        self.inner.subscribe_once(topic, cb)
    }

    fn unsubscribe(&self, token: Token) {
        self.inner.unsubscribe(token)
    }

    fn publish_ttl(&self, topic: &str, payload: Payload, ttl: Ttl) {
        self.store.record(topic, &payload, ttl);
        self.inner.publish_ttl(topic, payload, ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{payload, EventBus};
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::cell::Cell;

    fn fixture() -> (Rc<ManualClock>, Rc<StatusStore>, StatusBus) {
        let clock = Rc::new(ManualClock::new(0));
        let store = Rc::new(StatusStore::with_default_prefixes(
            Rc::clone(&clock) as Rc<dyn Clock>
        ));
        let bus = StatusBus::new(Rc::new(EventBus::new()), Rc::clone(&store));
        (clock, store, bus)
    }

    #[test]
    fn test_ttl_freshness_boundary() {
        let (clock, store, bus) = fixture();
        bus.publish_ttl(
            "status/wifi",
            payload(json!({ "state": "on" })),
            Ttl::Ms(8_000),
        );

        clock.set_ms(7_999);
        assert!(store.get("status/wifi", true).is_some());

        clock.set_ms(8_000);
        assert!(store.get("status/wifi", true).is_some(), "age == ttl is fresh");

        clock.set_ms(8_001);
        assert!(store.get("status/wifi", true).is_none());
        assert!(store.get("status/wifi", false).is_some(), "stale read allowed");
        assert_eq!(store.age_ms("status/wifi"), Some(8_001));
    }

    #[test]
    fn test_sticky_never_expires() {
        let (clock, store, bus) = fixture();
        bus.publish_ttl("status/bt", payload(json!({ "state": "off" })), Ttl::Sticky);
        clock.set_ms(u64::MAX / 2);
        assert!(store.get("status/bt", true).is_some());
    }

    #[test]
    fn test_default_ttl_resolution_order() {
        let (clock, store, bus) = fixture();
        store.set_default_ttl("status/wifi", Some(1_000));
        store.set_default_ttl("*", Some(10_000));

        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        bus.publish("status/lora", payload(json!({ "state": "rx" })));
        bus.publish_ttl("status/bt", payload(json!({ "state": "on" })), Ttl::Ms(500));

        clock.set_ms(700);
        assert!(store.get("status/bt", true).is_none(), "explicit wins");
        assert!(store.get("status/wifi", true).is_some());

        clock.set_ms(1_500);
        assert!(store.get("status/wifi", true).is_none(), "per-topic default");
        assert!(store.get("status/lora", true).is_some(), "wildcard default");

        clock.set_ms(10_500);
        assert!(store.get("status/lora", true).is_none());
    }

    #[test]
    fn test_no_defaults_means_no_expiry() {
        let (clock, store, bus) = fixture();
        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        clock.set_ms(1_000_000);
        assert!(store.get("status/wifi", true).is_some());
    }

    #[test]
    fn test_whitelist_filters_topics() {
        let (_clock, store, bus) = fixture();
        bus.publish("cmd/wifi", payload(json!({ "state": "on" })));
        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        assert!(!store.has("cmd/wifi", false));
        assert!(store.has("status/wifi", false));
        assert_eq!(store.topics(), vec!["status/wifi".to_string()]);
    }

    #[test]
    fn test_attach_detach_symmetry() {
        let (_clock, store, bus) = fixture();
        store.detach();
        store.detach(); // idempotent

        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        bus.subscribe("status/wifi", Box::new(move |_| s.set(s.get() + 1)));

        // Forwarding is unchanged, caching is off.
        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        assert_eq!(seen.get(), 1);
        assert!(!store.has("status/wifi", false));

        store.attach();
        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        assert!(store.has("status/wifi", false));
    }

    #[test]
    fn test_snapshot_reports_freshness() {
        let (clock, store, bus) = fixture();
        bus.publish_ttl("status/bt", payload(json!({ "state": "on" })), Ttl::Ms(100));
        clock.set_ms(250);

        let snap = store.snapshot(false);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].topic, "status/bt");
        assert_eq!(snap[0].age_ms, 250);
        assert_eq!(snap[0].ttl_ms, Some(100));
        assert!(!snap[0].fresh);
        assert!(snap[0].payload.is_none());

        let snap = store.snapshot(true);
        assert!(snap[0].payload.is_some());
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let (_clock, store, bus) = fixture();
        bus.publish("status/wifi", payload(json!({ "state": "on" })));
        bus.publish("status/wifi", payload(json!({ "state": "connected" })));
        let p = store.get("status/wifi", true).unwrap();
        assert_eq!(p.get("state").and_then(|v| v.as_str()), Some("connected"));
    }
}
