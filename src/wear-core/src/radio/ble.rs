// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Short-range bridge manager (BLE peripheral).
//!
//! Publishes `status/bt {state, err?, ts}` (only-on-change, coalesced,
//! rate-limited) and `diag/bt {event, detail, ts}`. Subscribes to
//! `cmd/bt`, the legacy `bt/*` control topics, the generic power topics
//! and `bridge/out`.
//!
//! The interrupt path never touches the bus: connect/disconnect/data
//! events are pushed onto the bounded handoff queue and drained a few per
//! tick inside `poll`. Advertising restarts are guarded by a cooldown and
//! the exponential backoff; a pairing window times out back to `on`.
//!
//! Bridging: inbound frames are `{topic, payload}` envelopes filtered
//! through an allow-list before re-publication; outbound frames are
//! filtered symmetrically, wrapped in a versioned envelope and fragmented
//! to the link's payload budget.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use crate::bus::{Bus, BusHandle, Event, Payload, Token, Ttl};
use crate::clock::Clock;
use crate::config::BleConfig;

use super::backoff::Backoff;
use super::bridge::{max_payload_for_mtu, AllowList, InboundFrame, OutboundFrame};
use super::diag::DiagThrottle;
use super::link::{LinkEvent, RadioLink};
use super::publisher::StatusPublisher;
use super::queue::{irq_queue, IrqQueue};
use super::{subscribe_weak, ErrCode, PowerEdge, PowerGate, RadioCommand, RadioManager, POWER_TOPICS};

/// Short-range bridge states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleState {
    Off,
    On,
    Pairing,
    Connected,
    Error,
}

impl BleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Pairing => "pairing",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// Short-range bridge state machine.
pub struct BleManager {
    bus: BusHandle,
    clock: Rc<dyn Clock>,
    cfg: BleConfig,
    link: Box<dyn RadioLink>,

    state: BleState,
    err: Option<ErrCode>,
    enabled: bool,
    adv_active: bool,
    adv_guard_until: u64,
    pair_deadline: Option<u64>,
    force_pairing: bool,
    deadline_ms: u64,
    backoff: Backoff,
    connected_peer: Option<String>,

    gate: PowerGate,
    publisher: StatusPublisher,
    diag: DiagThrottle,
    tokens: Vec<Token>,
    queue: IrqQueue,

    allow_in: AllowList,
    allow_out: AllowList,
    max_payload: usize,
    last_notif_sig: Option<(u64, u64)>,
}

impl BleManager {
    pub fn new(
        bus: BusHandle,
        clock: Rc<dyn Clock>,
        cfg: BleConfig,
        mut link: Box<dyn RadioLink>,
    ) -> Rc<RefCell<Self>> {
        let (irq_tx, queue) = irq_queue(cfg.irq_queue_cap);
        link.bind_irq(irq_tx);

        let publisher = StatusPublisher::new("status/bt", cfg.rate_limit_ms, cfg.coalesce_ms);
        let diag = DiagThrottle::new("diag/bt", cfg.diag_rate_limit_ms, Rc::clone(&clock));
        let enabled = cfg.enabled;
        let backoff = Backoff::new(cfg.backoff_floor_ms, cfg.backoff_max_ms);
        let allow_in = AllowList::new(cfg.allow_in.clone());
        let allow_out = AllowList::new(cfg.allow_out.clone());
        let max_payload = max_payload_for_mtu(cfg.mtu);
        Rc::new(RefCell::new(Self {
            bus,
            clock,
            cfg,
            link,
            state: BleState::Off,
            err: None,
            enabled,
            adv_active: false,
            adv_guard_until: 0,
            pair_deadline: None,
            force_pairing: false,
            deadline_ms: 0,
            backoff,
            connected_peer: None,
            gate: PowerGate::new(),
            publisher,
            diag,
            tokens: Vec::new(),
            queue,
            allow_in,
            allow_out,
            max_payload,
            last_notif_sig: None,
        }))
    }

    /// Subscribe to command, power and bridge topics and, if enabled,
    /// power the radio on.
    pub fn start(this: &Rc<RefCell<Self>>) {
        let bus = this.borrow().bus.clone();
        let mut tokens = vec![
            subscribe_weak(&bus, "cmd/bt", this, |m, ev| m.on_cmd(ev)),
            subscribe_weak(&bus, "bridge/out", this, |m, ev| m.on_bridge_out(ev)),
        ];
        for topic in ["bt/enable", "bt/disable", "bt/toggle", "bt/reconnect"] {
            tokens.push(subscribe_weak(&bus, topic, this, |m, ev| {
                m.on_legacy(&ev.topic)
            }));
        }
        for topic in POWER_TOPICS {
            tokens.push(subscribe_weak(&bus, topic, this, |m, ev| {
                m.on_power(&ev.topic)
            }));
        }

        let mut m = this.borrow_mut();
        m.tokens.extend(tokens);
        let now = m.clock.now_ms();
        m.publish_snapshot(now);
        if m.enabled {
            m.radio_on();
        }
    }

    fn publish_snapshot(&mut self, now_ms: u64) {
        let (sig, payload) = self.status_payload(BleState::Off);
        self.publisher
            .force(self.bus.as_ref(), now_ms, sig, payload, Ttl::Sticky);
    }

    /// Power the radio off and drop all subscriptions.
    pub fn stop(&mut self) {
        self.radio_off();
        for token in self.tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
    }

    pub fn state(&self) -> BleState {
        self.state
    }

    // ---------- commands ----------

    fn on_cmd(&mut self, event: &Event) {
        match RadioCommand::from_event(event) {
            Some(RadioCommand::On) => {
                self.enabled = true;
                self.radio_on();
            }
            Some(RadioCommand::Off) => {
                self.enabled = false;
                self.radio_off();
            }
            Some(RadioCommand::Pairing) => {
                self.enabled = true;
                self.force_pairing = true;
                if self.state == BleState::On && self.adv_active {
                    // Already advertising: just open the pairing window.
                    let now = self.clock.now_ms();
                    self.enter_pairing(now);
                    self.force_pairing = false;
                } else {
                    self.radio_on();
                }
            }
            Some(RadioCommand::Toggle) => {
                self.enabled = !self.enabled;
                if self.enabled {
                    self.radio_on();
                } else {
                    self.radio_off();
                }
            }
            Some(RadioCommand::Reconnect) => self.kick_peer(),
            _ => {}
        }
    }

    fn on_legacy(&mut self, topic: &str) {
        match topic {
            "bt/enable" => {
                self.enabled = true;
                self.radio_on();
            }
            "bt/disable" => {
                self.enabled = false;
                self.radio_off();
            }
            "bt/toggle" => {
                self.enabled = !self.enabled;
                if self.enabled {
                    self.radio_on();
                } else {
                    self.radio_off();
                }
            }
            "bt/reconnect" => self.kick_peer(),
            _ => {}
        }
    }

    /// Drop the current peer so it re-bonds; re-advertising follows the
    /// normal backoff path.
    fn kick_peer(&mut self) {
        if self.state == BleState::Connected {
            self.link.disconnect();
        }
        let now = self.clock.now_ms();
        self.schedule_backoff(now);
    }

    // ---------- power policy ----------

    fn on_power(&mut self, topic: &str) {
        match PowerEdge::from_topic(topic) {
            Some(PowerEdge::Dim) => {
                if !self.gate.note_dim() {
                    return;
                }
                if self.cfg.sleep_radio {
                    self.gate.set_dim_powered_off(self.state != BleState::Off);
                    self.diag.event(self.bus.as_ref(), "dim_radio_off");
                    self.radio_off();
                }
                // Radio stays on otherwise; re-advertising is suspended
                // in poll() while dimmed.
            }
            Some(PowerEdge::Sleep) => {
                self.diag.event(self.bus.as_ref(), "sleep_enter");
                self.gate.note_sleep();
                if self.cfg.sleep_radio {
                    let had_radio = self.state != BleState::Off;
                    self.radio_off();
                    self.gate.set_dim_powered_off(had_radio);
                }
            }
            Some(PowerEdge::Wake) => {
                if !self.gate.note_wake() {
                    return;
                }
                self.diag.event(self.bus.as_ref(), "wake");
                if self.enabled {
                    if self.cfg.sleep_radio && self.gate.dim_powered_off() {
                        self.radio_on();
                    } else if matches!(self.state, BleState::On | BleState::Error) {
                        // Resume advertising promptly.
                        self.deadline_ms = self.clock.now_ms();
                    }
                }
                self.gate.set_dim_powered_off(false);
            }
            None => {}
        }
    }

    // ---------- radio / advertising ----------

    fn radio_on(&mut self) {
        let now = self.clock.now_ms();
        match self.link.power_on() {
            Ok(()) => {
                self.err = None;
                self.set_state(now, BleState::On);
                self.start_advertising(now);
                let mut detail = Payload::new();
                detail.insert(
                    "name".to_string(),
                    Value::from(self.cfg.device_name.as_str()),
                );
                self.diag.publish(self.bus.as_ref(), "radio_on", detail);
            }
            Err(e) => {
                warn!("ble: radio_on failed: {e}");
                self.err = Some(ErrCode::Hw);
                self.set_state(now, BleState::Error);
            }
        }
    }

    fn radio_off(&mut self) {
        let now = self.clock.now_ms();
        if self.connected_peer.is_some() {
            self.link.disconnect();
        }
        self.link.cancel_connect();
        self.link.power_off();
        self.adv_active = false;
        self.connected_peer = None;
        self.pair_deadline = None;
        self.set_state(now, BleState::Off);
        self.diag.event(self.bus.as_ref(), "radio_off");
    }

    fn start_advertising(&mut self, now_ms: u64) {
        // Idempotency guard with restart cooldown.
        if self.adv_active && now_ms < self.adv_guard_until {
            return;
        }
        match self.link.begin_connect() {
            Ok(()) => {
                self.adv_active = true;
                self.adv_guard_until = now_ms + self.cfg.adv_guard_ms;
                if self.force_pairing || self.cfg.pairing_on_start {
                    self.enter_pairing(now_ms);
                } else {
                    self.set_state(now_ms, BleState::On);
                    self.pair_deadline = None;
                }
                self.diag.event(self.bus.as_ref(), "adv_start");
                self.force_pairing = false;
            }
            Err(e) => {
                warn!("ble: advertising failed: {e}");
                self.err = Some(ErrCode::Adv);
                self.set_state(now_ms, BleState::Error);
                self.schedule_backoff(now_ms);
                self.adv_active = false;
            }
        }
    }

    fn enter_pairing(&mut self, now_ms: u64) {
        self.set_state(now_ms, BleState::Pairing);
        self.pair_deadline = Some(now_ms + self.cfg.pairing_timeout_ms);
    }

    fn schedule_backoff(&mut self, now_ms: u64) {
        self.deadline_ms = self.backoff.arm(now_ms);
        let mut detail = Payload::new();
        detail.insert(
            "ms".to_string(),
            Value::from(self.deadline_ms.saturating_sub(now_ms)),
        );
        self.diag.publish(self.bus.as_ref(), "readv_wait", detail);
    }

    // ---------- bridge ----------

    fn handle_inbound(&mut self, raw: &[u8]) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                let mut detail = Payload::new();
                detail.insert("err".to_string(), Value::from(e.to_string()));
                self.diag
                    .publish(self.bus.as_ref(), "frame_parse_error", detail);
                return;
            }
        };
        if !self.allow_in.allows(&frame.topic) {
            let mut detail = Payload::new();
            detail.insert("topic".to_string(), Value::from(frame.topic));
            self.diag.publish(self.bus.as_ref(), "in_blocked", detail);
            return;
        }

        self.bus.publish(&frame.topic, frame.payload.clone());

        // Normalize notification pings into the status taxonomy.
        if frame.topic == "notif/new" || frame.topic == "notifications/new" {
            let count = frame
                .payload
                .get("count")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let flag = frame
                .payload
                .get("flag")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let sig = (count, flag);
            if self.last_notif_sig != Some(sig) {
                self.last_notif_sig = Some(sig);
                let mut payload = Payload::new();
                payload.insert("count".to_string(), Value::from(count));
                payload.insert("flag".to_string(), Value::from(flag));
                self.bus.publish_ttl(
                    "status/notifications",
                    payload,
                    Ttl::Ms(self.cfg.notif_ttl_ms),
                );
            }
        }
    }

    fn on_bridge_out(&mut self, event: &Event) {
        if !self.cfg.bridge_enabled || self.state != BleState::Connected {
            return;
        }
        let Some(topic) = event.str_field("topic").map(str::to_string) else {
            return;
        };
        if !self.allow_out.allows(&topic) {
            return;
        }
        let payload = match event.payload.get("payload") {
            Some(Value::Object(map)) => map.clone(),
            _ => Payload::new(),
        };
        let seq = (self.clock.now_ms() & 0xFFFF_FFFF) as u32;
        let frame = OutboundFrame::new(seq, topic, self.clock.unix_s(), payload);
        let fragments = match frame.fragments(self.max_payload) {
            Ok(fragments) => fragments,
            Err(e) => {
                let mut detail = Payload::new();
                detail.insert("err".to_string(), Value::from(e.to_string()));
                self.diag.publish(self.bus.as_ref(), "tx_error", detail);
                return;
            }
        };
        for fragment in fragments {
            if let Err(e) = self.link.send(&fragment) {
                let mut detail = Payload::new();
                detail.insert("err".to_string(), Value::from(e.to_string()));
                self.diag.publish(self.bus.as_ref(), "tx_error", detail);
                return;
            }
        }
    }

    // ---------- publish ----------

    fn set_state(&mut self, now_ms: u64, state: BleState) {
        self.state = state;
        let ttl = match state {
            BleState::Connected => {
                if self.cfg.connected_sticky {
                    Ttl::Sticky
                } else {
                    Ttl::Ms(self.cfg.connected_ttl_ms)
                }
            }
            BleState::Off => Ttl::Sticky,
            _ => Ttl::Ms(self.cfg.status_ttl_ms),
        };
        let (sig, payload) = self.status_payload(state);
        self.publisher
            .offer(self.bus.as_ref(), now_ms, sig, payload, ttl);
    }

    fn status_payload(&self, state: BleState) -> (String, Payload) {
        let mut payload = Payload::new();
        payload.insert("state".to_string(), Value::from(state.as_str()));
        if state == BleState::Error {
            if let Some(err) = self.err {
                payload.insert("err".to_string(), Value::from(err.as_str()));
            }
        }
        payload.insert("ts".to_string(), Value::from(self.clock.unix_s()));

        let err = if state == BleState::Error {
            self.err.map(|e| e.as_str()).unwrap_or("")
        } else {
            ""
        };
        (format!("{}|{}", state.as_str(), err), payload)
    }
}

impl RadioManager for BleManager {
    fn poll(&mut self, now_ms: u64) {
        self.publisher.tick(self.bus.as_ref(), now_ms);

        // Re-advertise once the backoff deadline passes; suspended while
        // dimmed with the radio kept on.
        if matches!(self.state, BleState::On | BleState::Error)
            && self.enabled
            && !self.adv_active
            && now_ms >= self.deadline_ms
            && !(self.gate.is_dimmed() && !self.cfg.sleep_radio)
        {
            self.start_advertising(now_ms);
        }

        // Pairing window expiry: one transition back to `on`.
        if self.state == BleState::Pairing {
            if let Some(deadline) = self.pair_deadline {
                if now_ms >= deadline {
                    self.link.cancel_connect();
                    self.pair_deadline = None;
                    self.adv_active = false;
                    self.set_state(now_ms, BleState::On);
                    self.diag.event(self.bus.as_ref(), "pairing_timeout");
                    self.schedule_backoff(now_ms);
                }
            }
        }

        // Drain a small dose of interrupt events per tick.
        for _ in 0..self.cfg.irq_drain_per_tick.max(1) {
            let Some(event) = self.queue.pop() else {
                break;
            };
            match event {
                LinkEvent::Connected { peer } => {
                    self.adv_active = false;
                    self.pair_deadline = None;
                    self.backoff.reset();
                    let mut detail = Payload::new();
                    if let Some(addr) = &peer {
                        detail.insert("addr".to_string(), Value::from(addr.as_str()));
                    }
                    self.connected_peer = peer;
                    self.set_state(now_ms, BleState::Connected);
                    self.diag.publish(self.bus.as_ref(), "connected", detail);
                }
                LinkEvent::Disconnected { peer } => {
                    self.adv_active = false;
                    self.connected_peer = None;
                    let mut detail = Payload::new();
                    if let Some(addr) = &peer {
                        detail.insert("addr".to_string(), Value::from(addr.as_str()));
                    }
                    self.set_state(now_ms, BleState::On);
                    self.diag.publish(self.bus.as_ref(), "disconnected", detail);
                    self.schedule_backoff(now_ms);
                }
                LinkEvent::DataReceived { data } => self.handle_inbound(&data),
                LinkEvent::TxDone => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{payload, Bus, EventBus};
    use crate::clock::ManualClock;
    use crate::radio::link::{LinkError, LinkResult};
    use crate::radio::queue::IrqSender;
    use serde_json::json;

    #[derive(Default)]
    struct MockState {
        hw_present: bool,
        adv_ok: bool,
        adv_calls: u32,
        sent: Vec<Vec<u8>>,
        irq: Option<IrqSender>,
    }

    struct MockLink {
        state: Rc<RefCell<MockState>>,
    }

    impl RadioLink for MockLink {
        fn power_on(&mut self) -> LinkResult<()> {
            if !self.state.borrow().hw_present {
                return Err(LinkError::new("no controller"));
            }
            Ok(())
        }

        fn power_off(&mut self) {}

        fn begin_connect(&mut self) -> LinkResult<()> {
            let mut s = self.state.borrow_mut();
            s.adv_calls += 1;
            if s.adv_ok {
                Ok(())
            } else {
                Err(LinkError::new("adv failed"))
            }
        }

        fn send(&mut self, frame: &[u8]) -> LinkResult<()> {
            self.state.borrow_mut().sent.push(frame.to_vec());
            Ok(())
        }

        fn bind_irq(&mut self, sender: IrqSender) {
            self.state.borrow_mut().irq = Some(sender);
        }
    }

    struct Fixture {
        clock: Rc<ManualClock>,
        bus: Rc<EventBus>,
        mock: Rc<RefCell<MockState>>,
        manager: Rc<RefCell<BleManager>>,
        statuses: Rc<RefCell<Vec<Event>>>,
    }

    impl Fixture {
        fn push_irq(&self, event: LinkEvent) {
            let sender = self.mock.borrow().irq.clone().unwrap();
            assert!(sender.push(event));
        }

        fn poll(&self) {
            let now = self.clock.now_ms();
            self.manager.borrow_mut().poll(now);
        }

        fn last_state(&self) -> String {
            self.statuses
                .borrow()
                .last()
                .and_then(|ev| ev.str_field("state").map(str::to_string))
                .unwrap_or_default()
        }
    }

    fn test_cfg() -> BleConfig {
        BleConfig {
            enabled: true,
            rate_limit_ms: 0,
            coalesce_ms: 0,
            diag_rate_limit_ms: 0,
            ..BleConfig::default()
        }
    }

    fn fixture(cfg: BleConfig) -> Fixture {
        let clock = Rc::new(ManualClock::new(0));
        let bus = Rc::new(EventBus::new());
        let mock = Rc::new(RefCell::new(MockState {
            hw_present: true,
            adv_ok: true,
            ..MockState::default()
        }));
        let statuses = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&statuses);
        bus.subscribe(
            "status/bt",
            Box::new(move |ev| log.borrow_mut().push(ev.clone())),
        );

        let manager = BleManager::new(
            Rc::clone(&bus) as BusHandle,
            Rc::clone(&clock) as Rc<dyn Clock>,
            cfg,
            Box::new(MockLink {
                state: Rc::clone(&mock),
            }),
        );
        BleManager::start(&manager);
        Fixture {
            clock,
            bus,
            mock,
            manager,
            statuses,
        }
    }

    #[test]
    fn test_startup_advertises_and_reports_on() {
        let f = fixture(test_cfg());
        assert_eq!(f.last_state(), "on");
        assert_eq!(f.mock.borrow().adv_calls, 1);
        assert_eq!(f.manager.borrow().state(), BleState::On);
    }

    #[test]
    fn test_connect_disconnect_cycle_via_queue() {
        let f = fixture(test_cfg());
        f.push_irq(LinkEvent::Connected {
            peer: Some("AA:BB:CC:DD:EE:FF".to_string()),
        });
        f.clock.advance_ms(50);
        f.poll();
        assert_eq!(f.last_state(), "connected");
        assert_eq!(
            f.statuses.borrow().last().unwrap().ttl,
            Ttl::Sticky,
            "connected-sticky default"
        );

        f.push_irq(LinkEvent::Disconnected { peer: None });
        f.clock.advance_ms(50);
        f.poll();
        assert_eq!(f.last_state(), "on");

        // Re-advertising waits out the backoff floor (800ms).
        let calls = f.mock.borrow().adv_calls;
        f.clock.advance_ms(100);
        f.poll();
        assert_eq!(f.mock.borrow().adv_calls, calls);
        f.clock.advance_ms(800);
        f.poll();
        assert_eq!(f.mock.borrow().adv_calls, calls + 1);
    }

    #[test]
    fn test_connected_long_ttl_when_not_sticky() {
        let mut cfg = test_cfg();
        cfg.connected_sticky = false;
        let f = fixture(cfg);
        f.push_irq(LinkEvent::Connected { peer: None });
        f.poll();
        assert_eq!(f.statuses.borrow().last().unwrap().ttl, Ttl::Ms(300_000));
    }

    #[test]
    fn test_flap_inside_coalescing_window_nets_nothing() {
        let mut cfg = test_cfg();
        cfg.coalesce_ms = 16;
        let f = fixture(cfg);
        // Flush the startup "on" out of the coalescing window first.
        f.clock.advance_ms(16);
        f.poll();
        assert_eq!(f.last_state(), "on");
        let published = f.statuses.borrow().len();

        f.push_irq(LinkEvent::Connected { peer: None });
        f.push_irq(LinkEvent::Disconnected { peer: None });
        f.poll(); // drains both (quota 2) inside one window
        f.clock.advance_ms(16);
        f.poll(); // flush: pending "on" equals last published "on"
        assert_eq!(f.statuses.borrow().len(), published);
    }

    #[test]
    fn test_pairing_command_and_timeout() {
        let f = fixture(test_cfg());
        f.bus.publish("cmd/bt", payload(json!({ "state": "pairing" })));
        assert_eq!(f.last_state(), "pairing");

        f.clock.advance_ms(30_001);
        f.poll();
        assert_eq!(f.last_state(), "on");

        // After the backoff the manager advertises again, invisible.
        f.clock.advance_ms(800);
        f.poll();
        assert_eq!(f.last_state(), "on");
        assert_eq!(f.manager.borrow().state(), BleState::On);
    }

    #[test]
    fn test_adv_failure_reports_error_and_retries() {
        let f = fixture(BleConfig {
            enabled: false,
            ..test_cfg()
        });
        f.mock.borrow_mut().adv_ok = false;
        f.bus.publish("cmd/bt", payload(json!({ "state": "on" })));
        assert_eq!(f.last_state(), "error");
        assert_eq!(
            f.statuses.borrow().last().unwrap().str_field("err"),
            Some("adv")
        );

        // Backoff floor, then a successful restart.
        f.mock.borrow_mut().adv_ok = true;
        f.clock.advance_ms(800);
        f.poll();
        assert_eq!(f.last_state(), "on");
    }

    #[test]
    fn test_hardware_absent_reports_hw_error() {
        let mut cfg = test_cfg();
        cfg.enabled = true;
        let clock = Rc::new(ManualClock::new(0));
        let bus = Rc::new(EventBus::new());
        let statuses = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&statuses);
        bus.subscribe(
            "status/bt",
            Box::new(move |ev| log.borrow_mut().push(ev.clone())),
        );
        let mock = Rc::new(RefCell::new(MockState::default()));
        let manager = BleManager::new(
            Rc::clone(&bus) as BusHandle,
            Rc::clone(&clock) as Rc<dyn Clock>,
            cfg,
            Box::new(MockLink { state: mock }),
        );
        BleManager::start(&manager);
        let binding = statuses.borrow();
        let ev = binding.last().unwrap();
        assert_eq!(ev.str_field("state"), Some("error"));
        assert_eq!(ev.str_field("err"), Some("hw"));
    }

    #[test]
    fn test_inbound_allowed_topic_is_republished() {
        let f = fixture(test_cfg());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        f.bus.subscribe(
            "notif/new",
            Box::new(move |ev| s.borrow_mut().push(ev.clone())),
        );
        let notif_status = Rc::new(RefCell::new(Vec::new()));
        let n = Rc::clone(&notif_status);
        f.bus.subscribe(
            "status/notifications",
            Box::new(move |ev| n.borrow_mut().push(ev.clone())),
        );

        f.push_irq(LinkEvent::DataReceived {
            data: br#"{"topic":"notif/new","payload":{"count":3,"flag":1}}"#.to_vec(),
        });
        f.poll();

        assert_eq!(seen.borrow().len(), 1);
        let binding = notif_status.borrow();
        assert_eq!(binding.len(), 1);
        assert_eq!(binding[0].u64_field("count"), Some(3));
        assert_eq!(binding[0].ttl, Ttl::Ms(15_000));
    }

    #[test]
    fn test_inbound_duplicate_notification_deduped() {
        let f = fixture(test_cfg());
        let notif_status = Rc::new(RefCell::new(Vec::new()));
        let n = Rc::clone(&notif_status);
        f.bus.subscribe(
            "status/notifications",
            Box::new(move |ev| n.borrow_mut().push(ev.clone())),
        );

        for _ in 0..2 {
            f.push_irq(LinkEvent::DataReceived {
                data: br#"{"topic":"notif/new","payload":{"count":2,"flag":1}}"#.to_vec(),
            });
            f.poll();
        }
        assert_eq!(notif_status.borrow().len(), 1, "same (count, flag) once");

        f.push_irq(LinkEvent::DataReceived {
            data: br#"{"topic":"notif/new","payload":{"count":4,"flag":1}}"#.to_vec(),
        });
        f.poll();
        assert_eq!(notif_status.borrow().len(), 2);
    }

    #[test]
    fn test_inbound_blocked_topic_never_reaches_bus() {
        let f = fixture(test_cfg());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        f.bus.subscribe(
            "cmd/wifi",
            Box::new(move |ev| s.borrow_mut().push(ev.clone())),
        );

        f.push_irq(LinkEvent::DataReceived {
            data: br#"{"topic":"cmd/wifi","payload":{"state":"off"}}"#.to_vec(),
        });
        f.poll();
        assert!(seen.borrow().is_empty(), "peer cannot inject commands");
    }

    #[test]
    fn test_outbound_bridge_fragments_and_filters() {
        let f = fixture(test_cfg());
        f.push_irq(LinkEvent::Connected { peer: None });
        f.poll();

        // Blocked topic: nothing leaves.
        f.bus.publish(
            "bridge/out",
            payload(json!({ "topic": "status/wifi", "payload": { "state": "on" } })),
        );
        assert!(f.mock.borrow().sent.is_empty());

        // Allowed topic with a large payload fragments to the MTU budget.
        f.bus.publish(
            "bridge/out",
            payload(json!({
                "topic": "status/notifications",
                "payload": { "text": "y".repeat(400) }
            })),
        );
        let sent = f.mock.borrow().sent.clone();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|frag| frag.len() <= 180));
        let joined: Vec<u8> = sent.concat();
        let value: serde_json::Value = serde_json::from_slice(&joined).unwrap();
        assert_eq!(value["topic"], "status/notifications");
        assert_eq!(value["v"], 1);
    }

    #[test]
    fn test_outbound_requires_connection() {
        let f = fixture(test_cfg());
        f.bus.publish(
            "bridge/out",
            payload(json!({ "topic": "status/battery", "payload": { "percent": 80 } })),
        );
        assert!(f.mock.borrow().sent.is_empty());
    }

    #[test]
    fn test_dim_powers_off_and_wake_restores() {
        let mut cfg = test_cfg();
        cfg.sleep_radio = true;
        let f = fixture(cfg);
        assert_eq!(f.last_state(), "on");

        f.bus.publish("display/dim", Payload::new());
        assert_eq!(f.last_state(), "off");
        assert_eq!(f.statuses.borrow().last().unwrap().ttl, Ttl::Sticky);

        f.bus.publish("sys/wake", Payload::new());
        assert_eq!(f.last_state(), "on");
    }

    #[test]
    fn test_dim_with_radio_on_suspends_readvertising() {
        let f = fixture(test_cfg()); // sleep_radio = false
        f.push_irq(LinkEvent::Disconnected { peer: None });
        f.poll();
        let calls = f.mock.borrow().adv_calls;

        f.bus.publish("display/dim", Payload::new());
        f.clock.advance_ms(10_000);
        f.poll();
        assert_eq!(f.mock.borrow().adv_calls, calls, "no re-adv while dimmed");

        f.bus.publish("display/wake", Payload::new());
        f.clock.advance_ms(10);
        f.poll();
        assert_eq!(f.mock.borrow().adv_calls, calls + 1);
    }

    #[test]
    fn test_queue_overflow_is_bounded() {
        let f = fixture(test_cfg());
        let sender = f.mock.borrow().irq.clone().unwrap();
        let mut accepted = 0;
        for _ in 0..20 {
            if sender.push(LinkEvent::TxDone) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 8, "queue capacity bounds interrupt bursts");
    }
}
