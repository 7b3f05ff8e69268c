// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Radio hardware capability interface.
//!
//! Managers never talk to registers or GATT tables; they drive a
//! [`RadioLink`] and interpret [`LinkEvent`]s delivered through the
//! bounded interrupt queue. Concrete drivers (and the simulated links in
//! the app crate) implement only the capabilities their radio has; the
//! rest default to "not supported".

use std::fmt;

/// Error type returned by link operations.
#[derive(Debug, Clone)]
pub struct LinkError(pub String);

impl LinkError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn not_supported(what: &str) -> Self {
        Self(format!("{what} not supported"))
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LinkError {}

impl From<String> for LinkError {
    fn from(value: String) -> Self {
        LinkError(value)
    }
}

impl From<&str> for LinkError {
    fn from(value: &str) -> Self {
        LinkError(value.to_string())
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

/// Record pushed by the interrupt handler onto the handoff queue.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Peer attached (central connected, association complete, ...).
    Connected { peer: Option<String> },
    /// Peer detached or link dropped.
    Disconnected { peer: Option<String> },
    /// Inbound frame received on the data channel.
    DataReceived { data: Vec<u8> },
    /// Outbound transmission completed.
    TxDone,
}

/// Capability interface of one radio.
///
/// All calls must return promptly; anything slow is started here and
/// completed against a deadline on later `poll` ticks.
pub trait RadioLink {
    /// Power the radio on and initialize it. An error here means the
    /// hardware is absent or unusable for the process lifetime.
    fn power_on(&mut self) -> LinkResult<()>;

    /// Power the radio off. Must not fail; best effort.
    fn power_off(&mut self);

    /// Begin seeking a link: start association, advertising, or receive,
    /// whichever this radio does. Completion is observed via
    /// [`is_connected`](Self::is_connected) or a queued [`LinkEvent`].
    fn begin_connect(&mut self) -> LinkResult<()> {
        Err(LinkError::not_supported("begin_connect"))
    }

    /// Abort a pending [`begin_connect`](Self::begin_connect) (stop
    /// advertising, cancel association). Best effort.
    fn cancel_connect(&mut self) {}

    /// Drop the current peer/link. Best effort.
    fn disconnect(&mut self) {}

    /// Whether a link is currently established.
    fn is_connected(&self) -> bool {
        false
    }

    /// Local address once acquired (wide-area radio: IP after DHCP).
    fn local_addr(&self) -> Option<String> {
        None
    }

    /// Current signal quality (dBm or radio-specific), if measurable.
    fn signal_quality(&mut self) -> Option<i32> {
        None
    }

    /// Transmit one frame (or fragment).
    fn send(&mut self, _frame: &[u8]) -> LinkResult<()> {
        Err(LinkError::not_supported("send"))
    }

    /// Hand the driver the interrupt-queue producer. The driver's
    /// interrupt path may only `push` onto it.
    fn bind_irq(&mut self, _sender: super::queue::IrqSender) {}
}
