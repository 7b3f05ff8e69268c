// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Rate-limited diagnostics channel.
//!
//! `diag/<radio>` carries free-form event+detail records for
//! observability. Each event type has its own last-publish timestamp so
//! one noisy type cannot starve the others.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value;
use tracing::debug;

use crate::bus::{Bus, Payload};
use crate::clock::Clock;

/// Per-event-type rate-limited publisher for one diagnostics topic.
pub struct DiagThrottle {
    topic: String,
    min_interval_ms: u64,
    clock: Rc<dyn Clock>,
    last_by_event: HashMap<String, u64>,
}

impl DiagThrottle {
    pub fn new(topic: impl Into<String>, min_interval_ms: u64, clock: Rc<dyn Clock>) -> Self {
        Self {
            topic: topic.into(),
            min_interval_ms,
            clock,
            last_by_event: HashMap::new(),
        }
    }

    /// Publish `{event, detail, ts}` unless the same event type fired
    /// within the minimum interval.
    pub fn publish(&mut self, bus: &dyn Bus, event: &str, detail: Payload) {
        let now = self.clock.now_ms();
        if let Some(last) = self.last_by_event.get(event) {
            if now.saturating_sub(*last) < self.min_interval_ms {
                return;
            }
        }
        self.last_by_event.insert(event.to_string(), now);

        let mut payload = Payload::new();
        payload.insert("event".to_string(), Value::from(event));
        payload.insert("detail".to_string(), Value::Object(detail));
        payload.insert("ts".to_string(), Value::from(self.clock.unix_s()));
        debug!("{} <- {}", self.topic, event);
        bus.publish(&self.topic, payload);
    }

    /// Shorthand for an event with no detail.
    pub fn event(&mut self, bus: &dyn Bus, event: &str) {
        self.publish(bus, event, Payload::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{payload, Event, EventBus};
    use crate::clock::ManualClock;
    use serde_json::json;
    use std::cell::RefCell;

    fn capture(bus: &EventBus, topic: &str) -> Rc<RefCell<Vec<Event>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        bus.subscribe(topic, Box::new(move |ev| l.borrow_mut().push(ev.clone())));
        log
    }

    #[test]
    fn test_same_event_type_is_throttled() {
        let clock = Rc::new(ManualClock::new(0));
        let bus = EventBus::new();
        let log = capture(&bus, "diag/wifi");
        let mut diag = DiagThrottle::new("diag/wifi", 250, Rc::clone(&clock) as Rc<dyn Clock>);

        diag.event(&bus, "connect_timeout");
        clock.advance_ms(100);
        diag.event(&bus, "connect_timeout");
        assert_eq!(log.borrow().len(), 1);

        clock.advance_ms(150);
        diag.event(&bus, "connect_timeout");
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_noisy_event_does_not_starve_others() {
        let clock = Rc::new(ManualClock::new(0));
        let bus = EventBus::new();
        let log = capture(&bus, "diag/bt");
        let mut diag = DiagThrottle::new("diag/bt", 250, Rc::clone(&clock) as Rc<dyn Clock>);

        diag.event(&bus, "disconnected");
        clock.advance_ms(10);
        diag.event(&bus, "disconnected");
        diag.event(&bus, "radio_on");
        assert_eq!(log.borrow().len(), 2);
        assert_eq!(log.borrow()[1].str_field("event"), Some("radio_on"));
    }

    #[test]
    fn test_detail_and_ts_shape() {
        let clock = Rc::new(ManualClock::new(42_000));
        let bus = EventBus::new();
        let log = capture(&bus, "diag/wifi");
        let mut diag = DiagThrottle::new("diag/wifi", 250, Rc::clone(&clock) as Rc<dyn Clock>);

        diag.publish(&bus, "connecting", payload(json!({ "ssid": "home" })));
        let log = log.borrow();
        assert_eq!(log[0].str_field("event"), Some("connecting"));
        assert_eq!(log[0].u64_field("ts"), Some(42));
        let detail = log[0].payload.get("detail").unwrap();
        assert_eq!(detail.get("ssid").and_then(|v| v.as_str()), Some("home"));
    }
}
