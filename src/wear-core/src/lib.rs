// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod bus;
pub mod clock;
pub mod config;
pub mod power;
pub mod radio;
pub mod status;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use bus::{payload, Bus, BusHandle, Event, EventBus, Payload, Token, Ttl};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BleConfig, LoraConfig, PowerConfig, SleepMode, WifiConfig};
pub use power::{PowerHardware, PowerManager, PowerState};
pub use radio::{
    BleManager, BleState, LoraManager, LoraState, RadioLink, RadioManager, WifiManager, WifiState,
};
pub use status::{StatusBus, StatusStore};
