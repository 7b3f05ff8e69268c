// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Display/sleep power state machine.
//!
//! `ACTIVE --(idle > dim_timeout)--> DIM --(idle > sleep_timeout)--> SLEEP`.
//! Sleep is only reachable in the lightsleep/deepsleep modes; `dim` mode
//! saturates at DIM and `off` never transitions automatically. A physical
//! button short-press toggles: dimmed wakes, active forces the next state.
//!
//! Every display publish is mirrored onto a generic power topic
//! (`display/dim` -> `power/will_dim`, `display/wake` -> `power/active`)
//! so radio managers only ever deal with the generic taxonomy. Entering
//! sleep is the single legitimate blocking point in the core: the
//! hardware call suspends everything until a wake source fires, then the
//! machine resumes in ACTIVE and replays a full redraw.
//!
//! Missing hardware (no button, no sleep support, no battery monitor)
//! degrades silently to no-ops; `service()` never fails.

use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusHandle, Payload};
use crate::clock::Clock;
use crate::config::{PowerConfig, SleepMode};

/// Display power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Active,
    Dim,
    Sleep,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Dim => "DIM",
            Self::Sleep => "SLEEP",
        }
    }
}

/// Events reported by the PMU button driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Short,
    Long,
}

impl ButtonEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

/// PMU button driver seam. Polled every service tick.
pub trait PmuButton {
    fn poll_events(&mut self) -> Vec<ButtonEvent>;
}

/// Sleep hardware seam. Implementations handle their own failures; a
/// missing implementation means sleep degrades to staying dimmed.
pub trait SleepHardware {
    /// Arm the configured wake sources before suspending.
    fn prepare_wake_sources(&mut self);

    /// Suspend until a wake source fires. Blocks the whole process.
    fn light_sleep(&mut self);

    /// Power down. On real hardware this does not return.
    fn deep_sleep(&mut self);
}

/// Battery/charger monitor seam.
pub trait PowerMonitor {
    fn battery_percent(&mut self) -> Option<u8>;
    fn is_charging(&mut self) -> Option<bool>;
}

/// Optional hardware handed to the manager at construction.
#[derive(Default)]
pub struct PowerHardware {
    pub button: Option<Box<dyn PmuButton>>,
    pub sleep: Option<Box<dyn SleepHardware>>,
    pub monitor: Option<Box<dyn PowerMonitor>>,
}

/// The display/sleep state machine.
pub struct PowerManager {
    bus: BusHandle,
    clock: Rc<dyn Clock>,
    cfg: PowerConfig,

    state: PowerState,
    last_activity: u64,
    dimmed: bool,
    keep_awake: bool,
    notified_dim: bool,
    notified_sleep: bool,

    button: Option<Box<dyn PmuButton>>,
    sleep_hw: Option<Box<dyn SleepHardware>>,
    monitor: Option<Box<dyn PowerMonitor>>,
}

impl PowerManager {
    pub fn new(bus: BusHandle, clock: Rc<dyn Clock>, cfg: PowerConfig, hw: PowerHardware) -> Self {
        let last_activity = clock.now_ms();
        let manager = Self {
            bus,
            clock,
            cfg,
            state: PowerState::Active,
            last_activity,
            dimmed: false,
            keep_awake: false,
            notified_dim: false,
            notified_sleep: false,
            button: hw.button,
            sleep_hw: hw.sleep,
            monitor: hw.monitor,
        };
        info!(
            "power manager: mode {:?}, dim {}ms, sleep {}ms",
            manager.cfg.sleep_mode, manager.cfg.dim_timeout_ms, manager.cfg.sleep_timeout_ms
        );
        manager.publish_state(PowerState::Active);
        manager
    }

    // ---------- public api ----------

    /// Regular tick from the main loop.
    pub fn service(&mut self) {
        let now = self.clock.now_ms();
        self.poll_button(now);

        if self.cfg.sleep_mode == SleepMode::Off {
            return;
        }

        if self.keep_awake {
            self.ensure_active();
            self.last_activity = now;
            self.clear_notices();
            return;
        }

        self.maybe_notice(now);

        let idle = now.saturating_sub(self.last_activity);
        if !self.dimmed && idle > self.cfg.dim_timeout_ms {
            debug!("idle {}ms: dimming", idle);
            self.enter_dim();
        }

        if matches!(
            self.cfg.sleep_mode,
            SleepMode::LightSleep | SleepMode::DeepSleep
        ) && idle > self.cfg.sleep_timeout_ms
        {
            debug!("idle {}ms: sleeping", idle);
            self.enter_sleep();
            self.last_activity = self.clock.now_ms();
            self.clear_notices();
        }
    }

    /// User activity detected (touch, swipe). Resets the idle timer and
    /// wakes the display if needed.
    pub fn ping(&mut self) {
        self.last_activity = self.clock.now_ms();
        self.bus.publish("sys/activity", Payload::new());
        if self.dimmed {
            self.display_wake();
        }
        self.set_state(PowerState::Active);
        self.clear_notices();
    }

    /// Reset only the idle timer, with no display side effects. For code
    /// paths that already handled the display themselves.
    pub fn kick(&mut self) {
        self.last_activity = self.clock.now_ms();
        self.clear_notices();
    }

    pub fn set_keep_awake(&mut self, enabled: bool) {
        if enabled == self.keep_awake {
            return;
        }
        self.keep_awake = enabled;
        debug!("keep_awake = {}", enabled);
        if enabled {
            self.ensure_active();
            self.clear_notices();
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_dimmed(&self) -> bool {
        self.dimmed
    }

    /// Battery percentage, if a monitor is present.
    pub fn battery_percent(&mut self) -> Option<u8> {
        self.monitor.as_mut()?.battery_percent()
    }

    /// Charger attached, if a monitor is present.
    pub fn is_charging(&mut self) -> Option<bool> {
        self.monitor.as_mut()?.is_charging()
    }

    // ---------- notices ----------

    fn clear_notices(&mut self) {
        self.notified_dim = false;
        self.notified_sleep = false;
    }

    fn maybe_notice(&mut self, now_ms: u64) {
        let idle = now_ms.saturating_sub(self.last_activity);

        if !self.dimmed && self.cfg.pre_dim_notice_ms > 0 && !self.notified_dim {
            let eta = self.cfg.dim_timeout_ms.saturating_sub(idle);
            if eta > 0 && eta <= self.cfg.pre_dim_notice_ms {
                let mut payload = Payload::new();
                payload.insert("eta_ms".to_string(), Value::from(eta));
                self.bus.publish("power/will_dim", payload);
                self.notified_dim = true;
            }
        }

        if self.cfg.pre_sleep_notice_ms > 0
            && !self.notified_sleep
            && matches!(
                self.cfg.sleep_mode,
                SleepMode::LightSleep | SleepMode::DeepSleep
            )
        {
            let eta = self.cfg.sleep_timeout_ms.saturating_sub(idle);
            if eta > 0 && eta <= self.cfg.pre_sleep_notice_ms {
                let mut payload = Payload::new();
                payload.insert("eta_ms".to_string(), Value::from(eta));
                self.bus.publish("power/will_sleep", payload);
                self.notified_sleep = true;
            }
        }
    }

    // ---------- state / display ----------

    fn ensure_active(&mut self) {
        if self.dimmed {
            self.display_wake();
        }
        self.set_state(PowerState::Active);
    }

    fn set_state(&mut self, state: PowerState) {
        if state == self.state {
            return;
        }
        self.state = state;
        self.publish_state(state);
    }

    fn publish_state(&self, state: PowerState) {
        let mut payload = Payload::new();
        payload.insert("state".to_string(), Value::from(state.as_str()));
        self.bus.publish("power/state", payload);
    }

    /// Publish a display topic and its generic power mirror, so radio
    /// managers never special-case display semantics.
    fn publish_mirrored(&self, topic: &str) {
        self.bus.publish(topic, Payload::new());
        match topic {
            "display/dim" => self.bus.publish("power/will_dim", Payload::new()),
            "display/wake" => self.bus.publish("power/active", Payload::new()),
            _ => {}
        }
    }

    fn display_dim(&self) {
        self.publish_mirrored("display/dim");
    }

    fn display_wake(&mut self) {
        self.publish_mirrored("display/wake");
        self.bus.publish("sys/redraw_full", Payload::new());
        self.dimmed = false;
    }

    fn enter_dim(&mut self) {
        self.display_dim();
        self.dimmed = true;
        self.set_state(PowerState::Dim);
    }

    // ---------- sleep ----------

    fn enter_sleep(&mut self) {
        if self.sleep_hw.is_none() {
            warn!("sleep requested but no sleep hardware; staying dimmed");
            if !self.dimmed {
                self.enter_dim();
            }
            return;
        }

        self.display_dim();
        self.dimmed = true;
        if let Some(hw) = self.sleep_hw.as_mut() {
            hw.prepare_wake_sources();
        }
        self.set_state(PowerState::Sleep);

        match self.cfg.sleep_mode {
            SleepMode::LightSleep => {
                info!("entering lightsleep");
                if let Some(hw) = self.sleep_hw.as_mut() {
                    // Blocks until a wake source fires.
                    hw.light_sleep();
                }
            }
            SleepMode::DeepSleep => {
                info!("entering deepsleep");
                if let Some(hw) = self.sleep_hw.as_mut() {
                    // Does not return on real hardware.
                    hw.deep_sleep();
                }
            }
            _ => {}
        }
        self.handle_wake();
    }

    /// Resume after a wake interrupt: replay a full redraw and return to
    /// ACTIVE.
    pub fn handle_wake(&mut self) {
        self.bus.publish("sys/wake", Payload::new());
        self.bus.publish("sys/redraw_full", Payload::new());
        self.set_state(PowerState::Active);
        self.dimmed = false;
        self.clear_notices();
    }

    // ---------- button ----------

    fn poll_button(&mut self, now_ms: u64) {
        let Some(button) = self.button.as_mut() else {
            return;
        };
        let events = button.poll_events();
        if events.is_empty() {
            return;
        }
        let mut payload = Payload::new();
        payload.insert(
            "events".to_string(),
            Value::from(
                events
                    .iter()
                    .map(|e| Value::from(e.as_str()))
                    .collect::<Vec<_>>(),
            ),
        );
        self.bus.publish("pmu/button", payload);

        if events.contains(&ButtonEvent::Short) {
            self.on_button_short(now_ms);
        }
    }

    /// Short press: dimmed wakes; active forces the configured next
    /// state and restarts the idle timer.
    fn on_button_short(&mut self, now_ms: u64) {
        if self.state == PowerState::Dim || self.dimmed {
            self.display_wake();
            self.set_state(PowerState::Active);
            self.last_activity = now_ms;
            self.clear_notices();
            return;
        }

        if self.state == PowerState::Active {
            match self.cfg.sleep_mode {
                SleepMode::Dim => {
                    self.enter_dim();
                    self.last_activity = now_ms;
                }
                SleepMode::LightSleep | SleepMode::DeepSleep => {
                    self.enter_sleep();
                    self.last_activity = self.clock.now_ms();
                    self.clear_notices();
                }
                SleepMode::Off => {}
            }
        }
        // SLEEP state wakes via hardware sources; nothing to do here.
    }
}
