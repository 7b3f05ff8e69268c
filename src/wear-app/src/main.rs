// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! weard - wearable runtime core daemon.
//!
//! Boot sequence: load configuration, build the bus, wrap it with the
//! status cache, and hand the resulting handle to every manager. A
//! fixed-period cooperative loop then calls `poll(now)` on each radio
//! manager and `service()` on the power manager until Ctrl-C.

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::signal;
use tokio::time;
use tracing::{debug, info, warn, Level};

mod config;
mod sim;

use wear_core::bus::{Bus, BusHandle, Payload, Ttl};
use wear_core::clock::{Clock, SystemClock};
use wear_core::power::{PowerHardware, PowerManager};
use wear_core::radio::{BleManager, LoraManager, RadioManager, WifiManager};
use wear_core::status::{StatusBus, StatusStore};
use wear_core::{DynResult, EventBus};

use crate::config::Config;
use crate::sim::{SimBattery, SimBleLink, SimLoraLink, SimWifiLink};

#[derive(Debug, Parser)]
#[command(author, version, about = "Wearable runtime core daemon")]
struct Cli {
    /// Path to a TOML config file (overrides the search paths)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Print an example configuration and exit
    #[arg(long = "print-config")]
    print_config: bool,
    /// Override the loop period in milliseconds
    #[arg(long = "tick-ms")]
    tick_ms: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> DynResult<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::example_toml());
        return Ok(());
    }

    let (cfg, cfg_path) = match &cli.config {
        Some(path) => (Config::load_from_file(path)?, Some(path.clone())),
        None => Config::load_from_default_paths()?,
    };

    init_tracing(cfg.general.log_level.as_deref());
    match &cfg_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
    let raw_bus = Rc::new(EventBus::new());
    let store = Rc::new(StatusStore::new(
        Rc::clone(&clock),
        cfg.status.prefixes.clone(),
    ));
    if let Some(ttl) = cfg.status.default_ttl_ms {
        store.set_default_ttl("*", Some(ttl));
    }
    let bus: BusHandle = Rc::new(StatusBus::new(raw_bus, Rc::clone(&store)));

    let mut power = PowerManager::new(
        bus.clone(),
        Rc::clone(&clock),
        cfg.power.clone(),
        PowerHardware {
            monitor: Some(Box::new(SimBattery::new())),
            ..PowerHardware::default()
        },
    );

    let wifi = WifiManager::new(
        bus.clone(),
        Rc::clone(&clock),
        cfg.wifi.clone(),
        Box::new(SimWifiLink::new()),
    );
    WifiManager::start(&wifi);

    let ble = BleManager::new(
        bus.clone(),
        Rc::clone(&clock),
        cfg.ble.clone(),
        Box::new(SimBleLink::new()),
    );
    BleManager::start(&ble);

    let lora = LoraManager::new(
        bus.clone(),
        Rc::clone(&clock),
        cfg.lora.clone(),
        Box::new(SimLoraLink::new()),
    );
    LoraManager::start(&lora);

    let tick_ms = cli.tick_ms.unwrap_or(cfg.behavior.tick_ms).max(1);
    info!("Main loop running at {}ms ticks", tick_ms);
    let mut interval = time::interval(Duration::from_millis(tick_ms));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    let mut last_battery_ms: u64 = 0;
    let mut last_snapshot_ms: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = clock.now_ms();
                wifi.borrow_mut().poll(now);
                ble.borrow_mut().poll(now);
                lora.borrow_mut().poll(now);
                power.service();

                if now.saturating_sub(last_battery_ms) >= cfg.power.battery_update_ms {
                    last_battery_ms = now;
                    publish_battery(bus.as_ref(), clock.as_ref(), &mut power, cfg.power.battery_update_ms);
                }

                if now.saturating_sub(last_snapshot_ms) >= 30_000 {
                    last_snapshot_ms = now;
                    match serde_json::to_string(&store.snapshot(false)) {
                        Ok(snap) => debug!("status snapshot: {}", snap),
                        Err(e) => warn!("snapshot serialization failed: {}", e),
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    wifi.borrow_mut().stop();
    ble.borrow_mut().stop();
    lora.borrow_mut().stop();

    Ok(())
}

/// Publish `status/battery {percent, charging, ts}`. The TTL spans a few
/// update intervals so a stalled loop shows up as a stale battery icon.
fn publish_battery(bus: &dyn Bus, clock: &dyn Clock, power: &mut PowerManager, interval_ms: u64) {
    let mut payload = Payload::new();
    if let Some(percent) = power.battery_percent() {
        payload.insert("percent".to_string(), Value::from(percent));
    }
    if let Some(charging) = power.is_charging() {
        payload.insert("charging".to_string(), Value::from(charging));
    }
    if payload.is_empty() {
        return;
    }
    payload.insert("ts".to_string(), Value::from(clock.unix_s()));
    bus.publish_ttl("status/battery", payload, Ttl::Ms(interval_ms * 3));
}

/// Initialize logging/tracing.
fn init_tracing(level: Option<&str>) {
    // Default formatting; config may lower or raise the level.
    let level = level
        .and_then(|l| l.parse::<Level>().ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .init();
}
