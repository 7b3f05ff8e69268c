// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Simulated hardware for host runs.
//!
//! weard normally drives real radio drivers; on a development host these
//! stand-ins exercise the full state machines instead. The simulated
//! peers live on tokio tasks and talk to the managers exclusively
//! through the interrupt queue, the same restricted path a real
//! interrupt handler uses.

use std::cell::Cell;
use std::time::Duration;

use tracing::debug;

use wear_core::power::PowerMonitor;
use wear_core::radio::link::{LinkError, LinkEvent, LinkResult, RadioLink};
use wear_core::radio::queue::IrqSender;

/// Station radio that associates a short while after `begin_connect`.
pub struct SimWifiLink {
    powered: bool,
    /// Remaining `is_connected` probes until association completes.
    countdown: Cell<Option<u32>>,
    connected: Cell<bool>,
    probes: Cell<u32>,
}

impl SimWifiLink {
    pub fn new() -> Self {
        Self {
            powered: false,
            countdown: Cell::new(None),
            connected: Cell::new(false),
            probes: Cell::new(0),
        }
    }
}

impl Default for SimWifiLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioLink for SimWifiLink {
    fn power_on(&mut self) -> LinkResult<()> {
        self.powered = true;
        Ok(())
    }

    fn power_off(&mut self) {
        self.powered = false;
        self.connected.set(false);
        self.countdown.set(None);
    }

    fn begin_connect(&mut self) -> LinkResult<()> {
        if !self.powered {
            return Err(LinkError::new("radio not powered"));
        }
        self.countdown.set(Some(20)); // ~1s of poll ticks
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected.set(false);
        self.countdown.set(None);
    }

    fn is_connected(&self) -> bool {
        if let Some(remaining) = self.countdown.get() {
            if remaining == 0 {
                self.countdown.set(None);
                self.connected.set(true);
            } else {
                self.countdown.set(Some(remaining - 1));
            }
        }
        self.connected.get()
    }

    fn local_addr(&self) -> Option<String> {
        self.connected.get().then(|| "192.168.4.2".to_string())
    }

    fn signal_quality(&mut self) -> Option<i32> {
        if !self.connected.get() {
            return None;
        }
        // Slow deterministic wander.
        let probes = self.probes.get();
        self.probes.set(probes + 1);
        Some(-55 - ((probes % 8) as i32) * 3)
    }
}

/// BLE peripheral with a simulated phone that connects a few seconds
/// after advertising starts and pings a notification now and then.
pub struct SimBleLink {
    irq: Option<IrqSender>,
    peer_spawned: bool,
}

impl SimBleLink {
    pub fn new() -> Self {
        Self {
            irq: None,
            peer_spawned: false,
        }
    }
}

impl Default for SimBleLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioLink for SimBleLink {
    fn power_on(&mut self) -> LinkResult<()> {
        Ok(())
    }

    fn power_off(&mut self) {}

    fn begin_connect(&mut self) -> LinkResult<()> {
        if self.peer_spawned {
            return Ok(());
        }
        let Some(irq) = self.irq.clone() else {
            return Ok(());
        };
        self.peer_spawned = true;
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                irq.push(LinkEvent::Connected {
                    peer: Some("AA:BB:CC:00:11:22".to_string()),
                });
                let mut count: u64 = 0;
                loop {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    count += 1;
                    let frame = format!(
                        r#"{{"topic":"notif/new","payload":{{"count":{count},"flag":1}}}}"#
                    );
                    irq.push(LinkEvent::DataReceived {
                        data: frame.into_bytes(),
                    });
                }
            });
        }
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> LinkResult<()> {
        debug!("ble sim: notify {} bytes", frame.len());
        Ok(())
    }

    fn bind_irq(&mut self, sender: IrqSender) {
        self.irq = Some(sender);
    }
}

/// Long-range radio with a beacon that is heard periodically.
pub struct SimLoraLink {
    irq: Option<IrqSender>,
    beacon_spawned: bool,
}

impl SimLoraLink {
    pub fn new() -> Self {
        Self {
            irq: None,
            beacon_spawned: false,
        }
    }
}

impl Default for SimLoraLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioLink for SimLoraLink {
    fn power_on(&mut self) -> LinkResult<()> {
        Ok(())
    }

    fn power_off(&mut self) {}

    fn begin_connect(&mut self) -> LinkResult<()> {
        if self.beacon_spawned {
            return Ok(());
        }
        let Some(irq) = self.irq.clone() else {
            return Ok(());
        };
        self.beacon_spawned = true;
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(45)).await;
                    irq.push(LinkEvent::DataReceived {
                        data: b"beacon".to_vec(),
                    });
                }
            });
        }
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> LinkResult<()> {
        debug!("lora sim: tx {} bytes", frame.len());
        Ok(())
    }

    fn bind_irq(&mut self, sender: IrqSender) {
        self.irq = Some(sender);
    }
}

/// Battery that drains slowly as it is read.
pub struct SimBattery {
    reads: u32,
}

impl SimBattery {
    pub fn new() -> Self {
        Self { reads: 0 }
    }
}

impl Default for SimBattery {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerMonitor for SimBattery {
    fn battery_percent(&mut self) -> Option<u8> {
        self.reads += 1;
        // One percent per ~50 reads, floored at 5%.
        Some((100u32.saturating_sub(self.reads / 50)).max(5) as u8)
    }

    fn is_charging(&mut self) -> Option<bool> {
        Some(false)
    }
}
