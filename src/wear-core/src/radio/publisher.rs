// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Status publication policy shared by all radio managers.
//!
//! A status is forwarded only when its signature (state plus any tracked
//! sub-field the manager folds in) differs from the last forwarded one.
//! Bursts inside the coalescing window collapse to their final value,
//! which then passes through the rate limiter: the minimum interval is
//! measured from the last forwarded publish, and while throttled the
//! newest value replaces any pending one (last-value-wins).

use tracing::debug;

use crate::bus::{Bus, Payload, Ttl};

#[derive(Debug, Clone)]
struct Pending {
    sig: String,
    payload: Payload,
    ttl: Ttl,
}

/// Only-on-change, coalescing, rate-limited publisher for one status topic.
#[derive(Debug)]
pub struct StatusPublisher {
    topic: String,
    rate_limit_ms: u64,
    coalesce_ms: u64,
    last_sig: Option<String>,
    last_payload: Option<Payload>,
    last_pub_ms: Option<u64>,
    coal: Option<Pending>,
    coal_deadline: u64,
    throttled: Option<Pending>,
}

impl StatusPublisher {
    pub fn new(topic: impl Into<String>, rate_limit_ms: u64, coalesce_ms: u64) -> Self {
        Self {
            topic: topic.into(),
            rate_limit_ms,
            coalesce_ms,
            last_sig: None,
            last_payload: None,
            last_pub_ms: None,
            coal: None,
            coal_deadline: 0,
            throttled: None,
        }
    }

    /// Offer a new status. `sig` is the change-detection signature; equal
    /// signatures are dropped without touching the windows.
    pub fn offer(&mut self, bus: &dyn Bus, now_ms: u64, sig: String, payload: Payload, ttl: Ttl) {
        let current = self
            .coal
            .as_ref()
            .map(|p| p.sig.as_str())
            .or(self.throttled.as_ref().map(|p| p.sig.as_str()))
            .or(self.last_sig.as_deref());
        if current == Some(sig.as_str()) {
            return;
        }

        let pending = Pending { sig, payload, ttl };
        if self.coalesce_ms > 0 {
            if self.coal.is_none() {
                self.coal_deadline = now_ms + self.coalesce_ms;
            }
            // Within the window the latest value simply wins.
            self.coal = Some(pending);
        } else {
            self.submit(bus, now_ms, pending);
        }
    }

    /// Publish unconditionally, clearing any pending windows. Used for
    /// initial snapshots.
    pub fn force(&mut self, bus: &dyn Bus, now_ms: u64, sig: String, payload: Payload, ttl: Ttl) {
        self.coal = None;
        self.throttled = None;
        self.forward(bus, now_ms, Pending { sig, payload, ttl });
    }

    /// Re-publish a steady state so its TTL does not lapse while the
    /// radio is healthy. Bypasses only-on-change, honors the rate limit.
    pub fn refresh(&mut self, bus: &dyn Bus, now_ms: u64, payload: Payload, ttl: Ttl) {
        if self.coal.is_some() || self.throttled.is_some() {
            return;
        }
        let Some(sig) = self.last_sig.clone() else {
            return;
        };
        if self.rate_ok(now_ms) {
            self.forward(bus, now_ms, Pending { sig, payload, ttl });
        }
    }

    /// Flush expired coalescing/rate-limit windows. Call once per tick.
    pub fn tick(&mut self, bus: &dyn Bus, now_ms: u64) {
        if self.coal.is_some() && now_ms >= self.coal_deadline {
            let pending = self.coal.take();
            if let Some(pending) = pending {
                self.submit(bus, now_ms, pending);
            }
        }
        if self.throttled.is_some() && self.rate_ok(now_ms) {
            let pending = self.throttled.take();
            if let Some(pending) = pending {
                // The state may have flapped back while throttled.
                if self.last_sig.as_deref() != Some(pending.sig.as_str()) {
                    self.forward(bus, now_ms, pending);
                }
            }
        }
    }

    /// Signature of the last forwarded publish.
    pub fn last_sig(&self) -> Option<&str> {
        self.last_sig.as_deref()
    }

    fn rate_ok(&self, now_ms: u64) -> bool {
        match self.last_pub_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.rate_limit_ms,
        }
    }

    fn submit(&mut self, bus: &dyn Bus, now_ms: u64, pending: Pending) {
        if self.last_sig.as_deref() == Some(pending.sig.as_str()) {
            return;
        }
        if self.rate_ok(now_ms) {
            self.forward(bus, now_ms, pending);
        } else {
            self.throttled = Some(pending);
        }
    }

    fn forward(&mut self, bus: &dyn Bus, now_ms: u64, pending: Pending) {
        debug!("{} <- {}", self.topic, pending.sig);
        self.last_sig = Some(pending.sig);
        self.last_payload = Some(pending.payload.clone());
        self.last_pub_ms = Some(now_ms);
        bus.publish_ttl(&self.topic, pending.payload, pending.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{payload, Event, EventBus};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture(bus: &EventBus, topic: &str) -> Rc<RefCell<Vec<Event>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        bus.subscribe(topic, Box::new(move |ev| l.borrow_mut().push(ev.clone())));
        log
    }

    fn state_payload(state: &str) -> Payload {
        payload(json!({ "state": state }))
    }

    #[test]
    fn test_only_on_change() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/wifi");
        let mut publisher = StatusPublisher::new("status/wifi", 0, 0);

        publisher.offer(&bus, 0, "on".into(), state_payload("on"), Ttl::Default);
        publisher.offer(&bus, 10, "on".into(), state_payload("on"), Ttl::Default);
        publisher.offer(&bus, 20, "on".into(), state_payload("on"), Ttl::Default);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_rate_limit_last_value_wins() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/wifi");
        let mut publisher = StatusPublisher::new("status/wifi", 500, 0);

        // Initial publish opens the rate window.
        publisher.offer(&bus, 0, "on".into(), state_payload("on"), Ttl::Default);
        assert_eq!(log.borrow().len(), 1);

        // Two changes 100ms apart inside the window collapse to one
        // forwarded publish carrying the latest value.
        publisher.offer(&bus, 100, "connecting".into(), state_payload("connecting"), Ttl::Default);
        publisher.offer(&bus, 200, "connected".into(), state_payload("connected"), Ttl::Default);
        publisher.tick(&bus, 499);
        assert_eq!(log.borrow().len(), 1, "still throttled");

        publisher.tick(&bus, 500);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].str_field("state"), Some("connected"));
    }

    #[test]
    fn test_throttled_flap_back_is_dropped() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/bt");
        let mut publisher = StatusPublisher::new("status/bt", 500, 0);

        publisher.offer(&bus, 0, "on".into(), state_payload("on"), Ttl::Default);
        publisher.offer(&bus, 100, "connected".into(), state_payload("connected"), Ttl::Default);
        publisher.offer(&bus, 200, "on".into(), state_payload("on"), Ttl::Default);
        publisher.tick(&bus, 600);
        assert_eq!(log.borrow().len(), 1, "net-zero change publishes nothing");
    }

    #[test]
    fn test_coalescing_burst_collapses_to_final_value() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/bt");
        let mut publisher = StatusPublisher::new("status/bt", 0, 16);

        publisher.offer(&bus, 0, "connected".into(), state_payload("connected"), Ttl::Default);
        publisher.offer(&bus, 4, "on".into(), state_payload("on"), Ttl::Default);
        publisher.offer(&bus, 8, "connected".into(), state_payload("connected"), Ttl::Default);
        assert_eq!(log.borrow().len(), 0, "window still open");

        publisher.tick(&bus, 16);
        let log = log.borrow();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].str_field("state"), Some("connected"));
    }

    #[test]
    fn test_coalesce_then_rate_limit_composition() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/bt");
        let mut publisher = StatusPublisher::new("status/bt", 500, 16);

        publisher.force(&bus, 0, "off".into(), state_payload("off"), Ttl::Default);
        assert_eq!(log.borrow().len(), 1);

        // Burst coalesces to "pairing", which then waits out the limiter.
        publisher.offer(&bus, 5, "on".into(), state_payload("on"), Ttl::Default);
        publisher.offer(&bus, 10, "pairing".into(), state_payload("pairing"), Ttl::Default);
        publisher.tick(&bus, 21);
        assert_eq!(log.borrow().len(), 1, "coalesced value is throttled");
        publisher.tick(&bus, 500);
        let log = log.borrow();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].str_field("state"), Some("pairing"));
    }

    #[test]
    fn test_ttl_rides_along() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/bt");
        let mut publisher = StatusPublisher::new("status/bt", 0, 0);

        publisher.offer(&bus, 0, "connected".into(), state_payload("connected"), Ttl::Sticky);
        publisher.offer(&bus, 10, "error".into(), state_payload("error"), Ttl::Ms(8_000));
        let log = log.borrow();
        assert_eq!(log[0].ttl, Ttl::Sticky);
        assert_eq!(log[1].ttl, Ttl::Ms(8_000));
    }

    #[test]
    fn test_refresh_republishes_same_state() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/lora");
        let mut publisher = StatusPublisher::new("status/lora", 500, 0);

        publisher.offer(&bus, 0, "rx".into(), state_payload("rx"), Ttl::Ms(8_000));
        publisher.refresh(&bus, 100, state_payload("rx"), Ttl::Ms(8_000));
        assert_eq!(log.borrow().len(), 1, "refresh honors the rate limit");

        publisher.refresh(&bus, 1_000, state_payload("rx"), Ttl::Ms(8_000));
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(publisher.last_sig(), Some("rx"));
    }

    #[test]
    fn test_refresh_noop_before_first_publish() {
        let bus = EventBus::new();
        let log = capture(&bus, "status/lora");
        let mut publisher = StatusPublisher::new("status/lora", 0, 0);
        publisher.refresh(&bus, 0, state_payload("rx"), Ttl::Default);
        assert_eq!(log.borrow().len(), 0);
    }
}
