// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Wide-area network manager.
//!
//! Single owner of the station radio; talks exclusively over the bus.
//!
//! Publishes `status/wifi {state, rssi?, ssid?, ip?, err?, ts}` (TTL per
//! state) and `diag/wifi {event, detail, ts}`. Subscribes to `cmd/wifi`,
//! the legacy `wifi/enable|disable|toggle|reconnect` topics, and the
//! generic power topics.
//!
//! Connect attempts are time-sliced: `begin_connect` starts association
//! and every later `poll` checks completion against a deadline covering
//! association plus address acquisition. Failures arm the exponential
//! backoff; a successful link resets it.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use crate::bus::{Bus, BusHandle, Event, Payload, Token, Ttl};
use crate::clock::Clock;
use crate::config::WifiConfig;

use super::backoff::Backoff;
use super::diag::DiagThrottle;
use super::link::RadioLink;
use super::publisher::StatusPublisher;
use super::{subscribe_weak, ErrCode, PowerEdge, PowerGate, RadioCommand, RadioManager, POWER_TOPICS};

/// Station radio states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiState {
    Off,
    On,
    /// Association in progress.
    Search,
    /// Link up, waiting for an address.
    Connecting,
    Connected,
    /// Access-point fallback; parked until commanded.
    Ap,
    Error,
}

impl WifiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Search => "search",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ap => "ap",
            Self::Error => "error",
        }
    }
}

/// Wide-area network state machine.
pub struct WifiManager {
    bus: BusHandle,
    clock: Rc<dyn Clock>,
    cfg: WifiConfig,
    link: Box<dyn RadioLink>,

    state: WifiState,
    err: Option<ErrCode>,
    enabled: bool,
    want_connect: bool,
    deadline_ms: u64,
    backoff: Backoff,
    reconnects: u32,
    last_rssi: Option<i32>,
    last_rssi_pub: u64,
    last_ip: Option<String>,

    gate: PowerGate,
    publisher: StatusPublisher,
    diag: DiagThrottle,
    tokens: Vec<Token>,
}

impl WifiManager {
    pub fn new(
        bus: BusHandle,
        clock: Rc<dyn Clock>,
        cfg: WifiConfig,
        link: Box<dyn RadioLink>,
    ) -> Rc<RefCell<Self>> {
        let publisher = StatusPublisher::new("status/wifi", cfg.rate_limit_ms, 0);
        let diag = DiagThrottle::new("diag/wifi", cfg.diag_rate_limit_ms, Rc::clone(&clock));
        let enabled = cfg.enabled;
        let backoff = Backoff::new(cfg.backoff_floor_ms, cfg.backoff_max_ms);
        Rc::new(RefCell::new(Self {
            bus,
            clock,
            cfg,
            link,
            state: WifiState::Off,
            err: None,
            enabled,
            want_connect: false,
            deadline_ms: 0,
            backoff,
            reconnects: 0,
            last_rssi: None,
            last_rssi_pub: 0,
            last_ip: None,
            gate: PowerGate::new(),
            publisher,
            diag,
            tokens: Vec::new(),
        }))
    }

    /// Subscribe to command and power topics and, if enabled, power the
    /// radio on.
    pub fn start(this: &Rc<RefCell<Self>>) {
        let bus = this.borrow().bus.clone();
        let mut tokens = vec![subscribe_weak(&bus, "cmd/wifi", this, |m, ev| m.on_cmd(ev))];
        for topic in ["wifi/enable", "wifi/disable", "wifi/toggle", "wifi/reconnect"] {
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

    /// Power the radio off and drop all subscriptions.
    pub fn stop(&mut self) {
        self.radio_off();
        for token in self.tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
    }

    pub fn state(&self) -> WifiState {
        self.state
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    // ---------- commands ----------

    fn on_cmd(&mut self, event: &Event) {
        match RadioCommand::from_event(event) {
            Some(RadioCommand::On) => self.cmd_on(),
            Some(RadioCommand::Off) => self.cmd_off(),
            Some(RadioCommand::Toggle) => {
                if self.enabled {
                    self.cmd_off()
                } else {
                    self.cmd_on()
                }
            }
            Some(RadioCommand::Reconnect) => self.reconnect(),
            _ => {}
        }
    }

    fn on_legacy(&mut self, topic: &str) {
        match topic {
            "wifi/enable" => self.cmd_on(),
            "wifi/disable" => self.cmd_off(),
            "wifi/toggle" => {
                if self.enabled {
                    self.cmd_off()
                } else {
                    self.cmd_on()
                }
            }
            "wifi/reconnect" => self.reconnect(),
            _ => {}
        }
    }

    fn cmd_on(&mut self) {
        self.enabled = true;
        // An explicit command overrides any dim bookkeeping.
        self.gate.set_dim_powered_off(false);
        self.radio_on();
    }

    fn cmd_off(&mut self) {
        self.enabled = false;
        self.radio_off();
    }

    fn reconnect(&mut self) {
        if self.state == WifiState::Off {
            return;
        }
        self.link.disconnect();
        self.reconnects += 1;
        let now = self.clock.now_ms();
        self.start_connect(now);
    }

    // ---------- power policy ----------

    fn on_power(&mut self, topic: &str) {
        match PowerEdge::from_topic(topic) {
            Some(PowerEdge::Dim) => {
                if !self.gate.note_dim() {
                    return;
                }
                if self.cfg.sleep_radio {
                    self.gate.set_dim_powered_off(self.state != WifiState::Off);
                    self.diag.event(self.bus.as_ref(), "dim_radio_off");
                    self.radio_off();
                } else {
                    self.diag.event(self.bus.as_ref(), "dim_radio_on");
                }
            }
            Some(PowerEdge::Sleep) => {
                self.diag.event(self.bus.as_ref(), "sleep_enter");
                self.gate.note_sleep();
                if self.cfg.sleep_radio {
                    let had_radio = self.state != WifiState::Off;
                    self.radio_off();
                    self.gate.set_dim_powered_off(had_radio);
                }
            }
            Some(PowerEdge::Wake) => {
                let was_dim = self.gate.note_wake();
                let mut detail = Payload::new();
                detail.insert("was_dim".to_string(), Value::from(was_dim));
                self.diag.publish(self.bus.as_ref(), "wake", detail);
                if self.enabled {
                    if self.cfg.sleep_radio && self.gate.dim_powered_off() {
                        self.radio_on();
                    } else if matches!(self.state, WifiState::On | WifiState::Error) {
                        self.want_connect = true;
                        self.deadline_ms = self.clock.now_ms();
                    }
                }
                self.gate.set_dim_powered_off(false);
            }
            None => {}
        }
    }

    // ---------- radio ----------

    fn radio_on(&mut self) {
        let now = self.clock.now_ms();
        match self.link.power_on() {
            Ok(()) => {
                self.err = None;
                self.set_state(now, WifiState::On, None);
                self.want_connect = true;
                self.deadline_ms = now; // immediate attempt in poll()
                self.diag.event(self.bus.as_ref(), "radio_on");
            }
            Err(e) => {
                warn!("wifi: radio_on failed: {e}");
                self.err = Some(ErrCode::Hw);
                self.set_state(now, WifiState::Error, None);
            }
        }
    }

    fn radio_off(&mut self) {
        let now = self.clock.now_ms();
        self.link.disconnect();
        self.link.power_off();
        self.want_connect = false;
        self.last_ip = None;
        self.last_rssi = None;
        self.set_state(now, WifiState::Off, None);
        self.diag.event(self.bus.as_ref(), "radio_off");
    }

    // ---------- connect workflow ----------

    fn start_connect(&mut self, now_ms: u64) {
        let Some(ssid) = self.cfg.ssid.clone() else {
            self.diag.event(self.bus.as_ref(), "no_ssid");
            self.set_state(now_ms, WifiState::Error, None);
            self.want_connect = false;
            return;
        };
        match self.link.begin_connect() {
            Ok(()) => {
                self.set_state(now_ms, WifiState::Search, None);
                self.deadline_ms = now_ms
                    + self.cfg.connect_timeout_ms
                    + if self.cfg.use_dhcp {
                        self.cfg.dhcp_timeout_ms
                    } else {
                        0
                    };
                self.want_connect = true;
                let mut detail = Payload::new();
                detail.insert("ssid".to_string(), Value::from(ssid));
                self.diag.publish(self.bus.as_ref(), "connecting", detail);
            }
            Err(e) => {
                warn!("wifi: connect trigger failed: {e}");
                self.set_state(now_ms, WifiState::Error, None);
                self.schedule_backoff(now_ms);
            }
        }
    }

    fn schedule_backoff(&mut self, now_ms: u64) {
        self.deadline_ms = self.backoff.arm(now_ms);
        self.want_connect = true;
        let mut detail = Payload::new();
        detail.insert(
            "ms".to_string(),
            Value::from(self.deadline_ms.saturating_sub(now_ms)),
        );
        self.diag.publish(self.bus.as_ref(), "reconnect_wait", detail);
    }

    fn on_connected(&mut self, now_ms: u64) {
        let ip = self.link.local_addr();
        let rssi = self.link.signal_quality();
        self.last_ip = ip.clone().or(self.last_ip.take());
        self.set_state(now_ms, WifiState::Connected, rssi);
        self.backoff.reset();
        let event = if self.cfg.use_dhcp { "dhcp_ok" } else { "link_ok" };
        let mut detail = Payload::new();
        if let Some(ip) = ip {
            detail.insert("ip".to_string(), Value::from(ip));
        }
        self.diag.publish(self.bus.as_ref(), event, detail);
    }

    fn on_connect_timeout(&mut self, now_ms: u64) {
        self.diag.event(self.bus.as_ref(), "connect_timeout");
        if self.cfg.ap_fallback {
            self.want_connect = false;
            self.set_state(now_ms, WifiState::Ap, None);
            self.diag.event(self.bus.as_ref(), "ap_fallback");
        } else {
            self.set_state(now_ms, WifiState::Error, None);
            self.schedule_backoff(now_ms);
        }
    }

    // ---------- publish ----------

    fn publish_snapshot(&mut self, now_ms: u64) {
        let (sig, payload) = self.status_payload(WifiState::Off, None);
        self.publisher
            .force(self.bus.as_ref(), now_ms, sig, payload, Ttl::Sticky);
    }

    fn set_state(&mut self, now_ms: u64, state: WifiState, rssi: Option<i32>) {
        self.state = state;
        if let Some(rssi) = rssi {
            self.last_rssi = Some(rssi);
        }
        let ttl = match state {
            WifiState::Connected => Ttl::Ms(self.cfg.connected_ttl_ms),
            WifiState::Off => Ttl::Sticky,
            _ => Ttl::Ms(self.cfg.status_ttl_ms),
        };
        let (sig, payload) = self.status_payload(state, rssi);
        self.publisher
            .offer(self.bus.as_ref(), now_ms, sig, payload, ttl);
    }

    fn status_payload(&self, state: WifiState, rssi: Option<i32>) -> (String, Payload) {
        let mut payload = Payload::new();
        payload.insert("state".to_string(), Value::from(state.as_str()));
        if let Some(rssi) = rssi {
            payload.insert("rssi".to_string(), Value::from(rssi));
        }
        if state == WifiState::Connected {
            if let Some(ssid) = &self.cfg.ssid {
                payload.insert("ssid".to_string(), Value::from(ssid.as_str()));
            }
            if let Some(ip) = &self.last_ip {
                payload.insert("ip".to_string(), Value::from(ip.as_str()));
            }
        }
        if state == WifiState::Error {
            if let Some(err) = self.err {
                payload.insert("err".to_string(), Value::from(err.as_str()));
            }
        }
        payload.insert("ts".to_string(), Value::from(self.clock.unix_s()));

        let sig = format!(
            "{}|{}|{}",
            state.as_str(),
            rssi.map(|r| r.to_string()).unwrap_or_default(),
            self.last_ip.clone().unwrap_or_default()
        );
        (sig, payload)
    }
}

impl RadioManager for WifiManager {
    fn poll(&mut self, now_ms: u64) {
        self.publisher.tick(self.bus.as_ref(), now_ms);

        match self.state {
            WifiState::Search | WifiState::Connecting => {
                if self.link.is_connected() {
                    let addr_pending = self.cfg.use_dhcp && self.link.local_addr().is_none();
                    if addr_pending {
                        if self.state == WifiState::Search {
                            self.set_state(now_ms, WifiState::Connecting, None);
                        }
                        if now_ms >= self.deadline_ms {
                            self.on_connect_timeout(now_ms);
                        }
                    } else {
                        self.on_connected(now_ms);
                    }
                } else if now_ms >= self.deadline_ms {
                    self.on_connect_timeout(now_ms);
                }
            }
            WifiState::Connected => {
                if self.gate.is_dimmed() && !self.cfg.sleep_radio {
                    // Radio stays on across dim, but activity is
                    // suspended: no reconnects, no telemetry.
                    if !self.link.is_connected() {
                        self.diag.event(self.bus.as_ref(), "link_lost_dim");
                        self.set_state(now_ms, WifiState::On, None);
                        self.want_connect = false;
                    }
                    return;
                }
                if !self.link.is_connected() {
                    self.diag.event(self.bus.as_ref(), "link_lost");
                    self.reconnects += 1;
                    self.start_connect(now_ms);
                } else if self.cfg.rssi_interval_ms > 0
                    && now_ms.saturating_sub(self.last_rssi_pub) >= self.cfg.rssi_interval_ms
                {
                    self.last_rssi_pub = now_ms;
                    if let Some(rssi) = self.link.signal_quality() {
                        let moved = self
                            .last_rssi
                            .map(|last| (rssi - last).abs() >= self.cfg.rssi_delta)
                            .unwrap_or(true);
                        if moved {
                            self.set_state(now_ms, WifiState::Connected, Some(rssi));
                        }
                    }
                }
            }
            WifiState::On | WifiState::Error => {
                if self.enabled && self.want_connect && now_ms >= self.deadline_ms {
                    if self.gate.is_dimmed() && !self.cfg.sleep_radio {
                        return;
                    }
                    self.start_connect(now_ms);
                }
            }
            WifiState::Off | WifiState::Ap => {}
        }
    }
}
