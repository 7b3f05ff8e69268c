// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! The radio-manager pattern.
//!
//! Three radios (wide-area network, short-range bridge, long-range packet
//! radio) share one non-blocking state-machine design: connect/retry with
//! exponential backoff, coalesced and rate-limited status publication,
//! per-event-type diagnostic throttling, and power-policy-driven radio
//! shutdown. The shared mechanics live in this module's building blocks;
//! each concrete manager owns only its state enum and hardware calls.

pub mod backoff;
pub mod ble;
pub mod bridge;
pub mod diag;
pub mod link;
pub mod lora;
pub mod publisher;
pub mod queue;
pub mod wifi;

use std::cell::RefCell;
use std::rc::Rc;

use crate::bus::{Bus, BusHandle, Event, Token};

pub use backoff::Backoff;
pub use ble::{BleManager, BleState};
pub use bridge::AllowList;
pub use diag::DiagThrottle;
pub use link::{LinkError, LinkEvent, RadioLink};
pub use lora::{LoraManager, LoraState};
pub use publisher::StatusPublisher;
pub use queue::{irq_queue, IrqQueue, IrqSender};
pub use wifi::{WifiManager, WifiState};

/// Per-tick poll contract shared by all radio managers.
pub trait RadioManager {
    /// Single non-blocking tick; must return promptly.
    fn poll(&mut self, now_ms: u64);
}

/// Parsed `cmd/<radio>` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCommand {
    On,
    Off,
    Toggle,
    Pairing,
    Reconnect,
    Rx,
    Tx,
}

impl RadioCommand {
    /// Parse the `state` field of a command payload. Unknown values are
    /// ignored by the caller.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event.str_field("state")? {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            "pairing" => Some(Self::Pairing),
            "reconnect" => Some(Self::Reconnect),
            "rx" => Some(Self::Rx),
            "tx" => Some(Self::Tx),
            _ => None,
        }
    }
}

/// One-word error code attached to an `error` status payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    /// Hardware absent or failed at init.
    Hw,
    /// Advertising failure.
    Adv,
    /// Protocol-level failure (malformed frame, bad envelope).
    Proto,
}

impl ErrCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hw => "hw",
            Self::Adv => "adv",
            Self::Proto => "proto",
        }
    }
}

/// Dim/sleep bookkeeping shared by every manager.
///
/// The power manager mirrors `display/dim` onto `power/will_dim`, so a
/// manager subscribed to both sees each transition twice; the gate
/// debounces the edges.
#[derive(Debug, Default)]
pub struct PowerGate {
    dimmed: bool,
    /// Whether dim powered the radio off (so wake knows to restore it).
    dim_powered_off: bool,
}

impl PowerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dim-family topic seen; returns `true` on the first edge only.
    pub fn note_dim(&mut self) -> bool {
        if self.dimmed {
            return false;
        }
        self.dimmed = true;
        true
    }

    /// Sleep notice seen; dim restrictions apply and any dim-restore
    /// bookkeeping is cancelled (sleep handles the radio itself).
    pub fn note_sleep(&mut self) {
        self.dimmed = true;
        self.dim_powered_off = false;
    }

    /// Wake-family topic seen; returns `true` if we were dimmed.
    pub fn note_wake(&mut self) -> bool {
        let was = self.dimmed;
        self.dimmed = false;
        was
    }

    pub fn is_dimmed(&self) -> bool {
        self.dimmed
    }

    pub fn set_dim_powered_off(&mut self, off: bool) {
        self.dim_powered_off = off;
    }

    pub fn dim_powered_off(&self) -> bool {
        self.dim_powered_off
    }
}

/// Subscribe a manager method behind a weak handle. The callback is a
/// no-op once the manager is dropped, and a dispatch that would re-enter
/// a manager already borrowed (e.g. a command published from inside its
/// own `poll`) is skipped rather than re-entered.
pub(crate) fn subscribe_weak<M, F>(
    bus: &BusHandle,
    topic: &str,
    this: &Rc<RefCell<M>>,
    handler: F,
) -> Token
where
    M: 'static,
    F: Fn(&mut M, &Event) + 'static,
{
    let weak = Rc::downgrade(this);
    bus.subscribe(
        topic,
        Box::new(move |event| {
            if let Some(rc) = weak.upgrade() {
                if let Ok(mut manager) = rc.try_borrow_mut() {
                    handler(&mut manager, event);
                }
            }
        }),
    )
}

/// Topics every radio manager subscribes to for power-policy compliance.
pub const POWER_TOPICS: [&str; 6] = [
    "power/will_dim",
    "display/dim",
    "power/will_sleep",
    "display/wake",
    "power/active",
    "sys/wake",
];

/// Classify a power topic into the three reactions managers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEdge {
    Dim,
    Sleep,
    Wake,
}

impl PowerEdge {
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic {
            "power/will_dim" | "display/dim" => Some(Self::Dim),
            "power/will_sleep" => Some(Self::Sleep),
            "display/wake" | "power/active" | "sys/wake" => Some(Self::Wake),
            _ => None,
        }
    }
}
