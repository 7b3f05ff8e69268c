// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Interrupt-to-poll handoff queue.
//!
//! Hardware interrupt handlers run in a restricted context: no bus work,
//! no allocation-heavy processing, no blocking. They may only push a small
//! tagged record onto this bounded queue and return. The manager drains a
//! few records per `poll` tick in safe bus context. Overflow is dropped
//! silently; lost notifications are acceptable because state is
//! reconciled against the hardware on the next poll.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::link::LinkEvent;

/// Producer half, handed to the hardware driver's interrupt path.
#[derive(Clone)]
pub struct IrqSender {
    tx: mpsc::Sender<LinkEvent>,
}

impl IrqSender {
    /// Non-blocking push; returns `false` when the queue is full (the
    /// record is dropped).
    pub fn push(&self, event: LinkEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Consumer half, owned by the radio manager.
pub struct IrqQueue {
    rx: mpsc::Receiver<LinkEvent>,
}

impl IrqQueue {
    /// Non-blocking pop.
    pub fn pop(&mut self) -> Option<LinkEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a bounded handoff queue.
pub fn irq_queue(capacity: usize) -> (IrqSender, IrqQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IrqSender { tx }, IrqQueue { rx })
}
