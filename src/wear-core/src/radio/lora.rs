// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Long-range packet radio manager.
//!
//! Receive is the steady state: inbound frames can arrive at any time and
//! must be able to wake the whole system, so the dim policy here has a
//! middle ground where transmit is blocked while receive stays live. A frame
//! received over the air publishes `sys/wake {"src":"lora"}` and the
//! payload on `lora/rx`.
//!
//! Publishes `status/lora {state, err?, ts}` and `diag/lora`; subscribes
//! to `cmd/lora` (`on|off|toggle|rx|tx`) and the generic power topics.
//! The steady `rx` status is refreshed periodically (rate-limited) so its
//! short TTL only lapses when the manager actually stops ticking.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tracing::warn;

use crate::bus::{Bus, BusHandle, Event, Payload, Token, Ttl};
use crate::clock::Clock;
use crate::config::LoraConfig;

use super::backoff::Backoff;
use super::diag::DiagThrottle;
use super::link::{LinkEvent, RadioLink};
use super::publisher::StatusPublisher;
use super::queue::{irq_queue, IrqQueue};
use super::{subscribe_weak, ErrCode, PowerEdge, PowerGate, RadioCommand, RadioManager, POWER_TOPICS};

/// Long-range radio states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraState {
    Off,
    On,
    Rx,
    Tx,
    /// Recent traffic on the link (frame received or transmitted).
    Link,
    Error,
}

impl LoraState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::On => "on",
            Self::Rx => "rx",
            Self::Tx => "tx",
            Self::Link => "link",
            Self::Error => "error",
        }
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

/// Long-range radio state machine.
pub struct LoraManager {
    bus: BusHandle,
    clock: Rc<dyn Clock>,
    cfg: LoraConfig,
    link: Box<dyn RadioLink>,

    state: LoraState,
    err: Option<ErrCode>,
    enabled: bool,
    /// Radio actually powered (distinct from `enabled`: sleep can power
    /// the radio down without revoking the operator's intent).
    powered: bool,
    tx_paused: bool,
    last_tx: Option<u64>,
    last_refresh: u64,
    retry_deadline: Option<u64>,
    backoff: Backoff,

    gate: PowerGate,
    publisher: StatusPublisher,
    diag: DiagThrottle,
    tokens: Vec<Token>,
    queue: IrqQueue,
}

impl LoraManager {
    pub fn new(
        bus: BusHandle,
        clock: Rc<dyn Clock>,
        cfg: LoraConfig,
        mut link: Box<dyn RadioLink>,
    ) -> Rc<RefCell<Self>> {
        let (irq_tx, queue) = irq_queue(cfg.irq_queue_cap);
        link.bind_irq(irq_tx);

        let publisher = StatusPublisher::new("status/lora", cfg.rate_limit_ms, 0);
        let diag = DiagThrottle::new("diag/lora", cfg.diag_rate_limit_ms, Rc::clone(&clock));
        let enabled = cfg.enabled;
        let backoff = Backoff::new(cfg.backoff_floor_ms, cfg.backoff_max_ms);
        Rc::new(RefCell::new(Self {
            bus,
            clock,
            cfg,
            link,
            state: LoraState::Off,
            err: None,
            enabled,
            powered: false,
            tx_paused: false,
            last_tx: None,
            last_refresh: 0,
            retry_deadline: None,
            backoff,
            gate: PowerGate::new(),
            publisher,
            diag,
            tokens: Vec::new(),
            queue,
        }))
    }

    /// Subscribe to command and power topics and, if enabled, power the
    /// radio on into receive.
    pub fn start(this: &Rc<RefCell<Self>>) {
        let bus = this.borrow().bus.clone();
        let mut tokens = vec![subscribe_weak(&bus, "cmd/lora", this, |m, ev| m.on_cmd(ev))];
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
        let (sig, payload) = self.status_payload(LoraState::Off);
        self.publisher
            .force(self.bus.as_ref(), now_ms, sig, payload, Ttl::Sticky);
    }

    /// Power the radio off and drop all subscriptions.
    pub fn stop(&mut self) {
        self.radio_off();
        self.enabled = false;
        for token in self.tokens.drain(..) {
            self.bus.unsubscribe(token);
        }
    }

    pub fn state(&self) -> LoraState {
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
            Some(RadioCommand::Toggle) => {
                self.enabled = !self.enabled;
                if self.enabled {
                    self.radio_on();
                } else {
                    self.radio_off();
                }
            }
            Some(RadioCommand::Rx) => {
                if self.enabled && self.powered {
                    self.enter_rx();
                }
            }
            Some(RadioCommand::Tx) => self.handle_tx(event),
            _ => {}
        }
    }

    fn handle_tx(&mut self, event: &Event) {
        if !self.enabled || !self.powered {
            return;
        }
        if self.tx_paused {
            self.diag.event(self.bus.as_ref(), "tx_blocked");
            return;
        }
        let now = self.clock.now_ms();
        if self.cfg.tx_cooldown_ms > 0 {
            if let Some(last) = self.last_tx {
                if now.saturating_sub(last) < self.cfg.tx_cooldown_ms {
                    self.diag.event(self.bus.as_ref(), "tx_cooldown");
                    return;
                }
            }
        }
        let data = event.str_field("data").unwrap_or_default().as_bytes().to_vec();
        match self.link.send(&data) {
            Ok(()) => {
                self.last_tx = Some(now);
                self.set_state(now, LoraState::Tx);
            }
            Err(e) => {
                warn!("lora: tx failed: {e}");
                self.err = Some(ErrCode::Proto);
                self.set_state(now, LoraState::Error);
                self.schedule_retry(now);
            }
        }
    }

    // ---------- power policy ----------

    fn on_power(&mut self, topic: &str) {
        match PowerEdge::from_topic(topic) {
            Some(PowerEdge::Dim) => {
                if !self.gate.note_dim() || !self.enabled {
                    return;
                }
                if self.cfg.pause_on_dim {
                    self.tx_paused = true;
                    self.diag.event(self.bus.as_ref(), "dim_tx_paused");
                } else {
                    self.diag.event(self.bus.as_ref(), "dim_radio_on");
                }
            }
            Some(PowerEdge::Sleep) => {
                if !self.enabled {
                    return;
                }
                self.gate.note_sleep();
                if self.cfg.sleep_radio {
                    let had_radio = self.powered;
                    self.radio_off();
                    self.gate.set_dim_powered_off(had_radio);
                } else {
                    // Receive stays armed so inbound traffic can wake us.
                    self.tx_paused = true;
                    self.diag.event(self.bus.as_ref(), "sleep_radio_rx_only");
                }
            }
            Some(PowerEdge::Wake) => {
                self.gate.note_wake();
                if !self.enabled {
                    return;
                }
                self.tx_paused = false;
                self.diag.event(self.bus.as_ref(), "wake");
                if !self.powered && self.gate.dim_powered_off() {
                    self.radio_on();
                } else if self.powered {
                    self.enter_rx();
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
                self.powered = true;
                self.set_state(now, LoraState::On);
                self.enter_rx();
                self.diag.event(self.bus.as_ref(), "radio_on");
            }
            Err(e) => {
                warn!("lora: radio_on failed: {e}");
                self.err = Some(ErrCode::Hw);
                self.powered = false;
                self.set_state(now, LoraState::Error);
            }
        }
    }

    fn radio_off(&mut self) {
        let now = self.clock.now_ms();
        self.link.disconnect();
        self.link.power_off();
        self.powered = false;
        self.tx_paused = false;
        self.retry_deadline = None;
        self.set_state(now, LoraState::Off);
        self.diag.event(self.bus.as_ref(), "radio_off");
    }

    fn enter_rx(&mut self) {
        let now = self.clock.now_ms();
        match self.link.begin_connect() {
            Ok(()) => self.set_state(now, LoraState::Rx),
            Err(e) => {
                warn!("lora: rx start failed: {e}");
                self.err = Some(ErrCode::Hw);
                self.set_state(now, LoraState::Error);
                self.schedule_retry(now);
            }
        }
    }

    fn schedule_retry(&mut self, now_ms: u64) {
        let deadline = self.backoff.arm(now_ms);
        self.retry_deadline = Some(deadline);
        let mut detail = Payload::new();
        detail.insert("ms".to_string(), Value::from(deadline.saturating_sub(now_ms)));
        self.diag.publish(self.bus.as_ref(), "retry_wait", detail);
    }

    // ---------- inbound ----------

    fn on_frame_received(&mut self, now_ms: u64, data: Vec<u8>) {
        self.backoff.reset();
        self.set_state(now_ms, LoraState::Link);
        let mut detail = Payload::new();
        detail.insert("len".to_string(), Value::from(data.len()));
        self.diag.publish(self.bus.as_ref(), "rx", detail);

        // Inbound traffic wakes the system.
        let mut wake = Payload::new();
        wake.insert("src".to_string(), Value::from("lora"));
        self.bus.publish("sys/wake", wake);

        let mut payload = Payload::new();
        payload.insert("len".to_string(), Value::from(data.len()));
        payload.insert("data".to_string(), Value::from(to_hex(&data)));
        self.bus.publish("lora/rx", payload);
    }

    // ---------- publish ----------

    fn set_state(&mut self, now_ms: u64, state: LoraState) {
        self.state = state;
        let ttl = match state {
            LoraState::Off => Ttl::Sticky,
            _ => Ttl::Ms(self.cfg.status_ttl_ms),
        };
        let (sig, payload) = self.status_payload(state);
        self.publisher
            .offer(self.bus.as_ref(), now_ms, sig, payload, ttl);
    }

    fn status_payload(&self, state: LoraState) -> (String, Payload) {
        let mut payload = Payload::new();
        payload.insert("state".to_string(), Value::from(state.as_str()));
        if state == LoraState::Error {
            if let Some(err) = self.err {
                payload.insert("err".to_string(), Value::from(err.as_str()));
            }
        }
        payload.insert("ts".to_string(), Value::from(self.clock.unix_s()));
        (state.as_str().to_string(), payload)
    }
}

impl RadioManager for LoraManager {
    fn poll(&mut self, now_ms: u64) {
        self.publisher.tick(self.bus.as_ref(), now_ms);
        if !self.powered {
            return;
        }

        // Error recovery waits out the backoff.
        if let Some(deadline) = self.retry_deadline {
            if now_ms < deadline {
                return;
            }
            self.retry_deadline = None;
            self.enter_rx();
        }

        // Drain a small dose of interrupt events per tick.
        for _ in 0..self.cfg.irq_drain_per_tick.max(1) {
            let Some(event) = self.queue.pop() else {
                break;
            };
            match event {
                LinkEvent::DataReceived { data } => self.on_frame_received(now_ms, data),
                LinkEvent::TxDone => self.set_state(now_ms, LoraState::Link),
                LinkEvent::Connected { .. } | LinkEvent::Disconnected { .. } => {}
            }
        }

        // Keep the steady rx status fresh; `link` decays back to `rx`.
        if now_ms.saturating_sub(self.last_refresh) >= self.cfg.refresh_interval_ms {
            self.last_refresh = now_ms;
            match self.state {
                LoraState::Rx => {
                    let (_, payload) = self.status_payload(LoraState::Rx);
                    self.publisher.refresh(
                        self.bus.as_ref(),
                        now_ms,
                        payload,
                        Ttl::Ms(self.cfg.status_ttl_ms),
                    );
                }
                LoraState::Tx | LoraState::Link => self.set_state(now_ms, LoraState::Rx),
                _ => {}
            }
        }
    }
}
