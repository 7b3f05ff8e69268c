// SPDX-FileCopyrightText: 2026 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Configuration types for the runtime core.
//!
//! All values are consumed at construction time and never re-read live.
//! Every field has a documented default; a missing value falls back to it
//! rather than failing.

use serde::{Deserialize, Serialize};

/// Automatic power-down behavior of the display/sleep state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepMode {
    /// No automatic transitions.
    Off,
    /// Saturate at DIM; never sleep.
    #[default]
    Dim,
    /// DIM, then light sleep (resumes in place on wake).
    LightSleep,
    /// DIM, then deep sleep (resets on wake).
    DeepSleep,
}

/// PowerManager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub sleep_mode: SleepMode,
    /// Idle milliseconds until the display dims.
    pub dim_timeout_ms: u64,
    /// Idle milliseconds until sleep (lightsleep/deepsleep modes only).
    pub sleep_timeout_ms: u64,
    /// Pre-dim notice window in milliseconds; 0 disables the notice.
    pub pre_dim_notice_ms: u64,
    /// Pre-sleep notice window in milliseconds; 0 disables the notice.
    pub pre_sleep_notice_ms: u64,
    /// Interval for `status/battery` publication by the main loop.
    pub battery_update_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            sleep_mode: SleepMode::Dim,
            dim_timeout_ms: 50_000,
            sleep_timeout_ms: 90_000,
            pre_dim_notice_ms: 2_000,
            pre_sleep_notice_ms: 5_000,
            battery_update_ms: 10_000,
        }
    }
}

/// Static address configuration for the wide-area radio when DHCP is off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticAddr {
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub dns: String,
}

/// Wide-area network manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub enabled: bool,
    pub ssid: Option<String>,
    pub psk: Option<String>,
    pub use_dhcp: bool,
    /// Association timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Additional address-acquisition budget when DHCP is in use.
    pub dhcp_timeout_ms: u64,
    /// Retry backoff floor/ceiling in milliseconds.
    pub backoff_floor_ms: u64,
    pub backoff_max_ms: u64,
    /// Minimum interval between signal-strength publications.
    pub rssi_interval_ms: u64,
    /// Minimum dBm movement before a new RSSI value is worth publishing.
    pub rssi_delta: i32,
    /// TTL for the stable `connected` status.
    pub connected_ttl_ms: u64,
    /// TTL for transient statuses (on/search/connecting/error).
    pub status_ttl_ms: u64,
    /// Minimum interval between `status/wifi` publications.
    pub rate_limit_ms: u64,
    /// Per-event-type minimum interval on `diag/wifi`.
    pub diag_rate_limit_ms: u64,
    /// Dim/sleep powers the radio off when set; otherwise the radio stays
    /// on with reconnects and telemetry suspended.
    pub sleep_radio: bool,
    /// Fall back to access-point mode after a failed connect attempt.
    pub ap_fallback: bool,
    /// Static address used when DHCP is off. Kept last so TOML
    /// serialization emits scalars before the sub-table.
    pub static_addr: Option<StaticAddr>,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ssid: None,
            psk: None,
            use_dhcp: true,
            connect_timeout_ms: 12_000,
            dhcp_timeout_ms: 8_000,
            backoff_floor_ms: 1_000,
            backoff_max_ms: 60_000,
            rssi_interval_ms: 15_000,
            rssi_delta: 5,
            connected_ttl_ms: 60_000,
            status_ttl_ms: 8_000,
            rate_limit_ms: 500,
            diag_rate_limit_ms: 250,
            sleep_radio: false,
            ap_fallback: false,
            static_addr: None,
        }
    }
}

/// Short-range bridge (BLE peripheral) manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub enabled: bool,
    pub device_name: String,
    /// TTL for transient statuses (on/pairing/error).
    pub status_ttl_ms: u64,
    /// Minimum interval between `status/bt` publications.
    pub rate_limit_ms: u64,
    /// Coalescing window for bursty state flapping; 0 disables.
    pub coalesce_ms: u64,
    /// `connected` publishes without TTL when set; else with the long TTL.
    pub connected_sticky: bool,
    pub connected_ttl_ms: u64,
    /// Pairing visibility window; expiry drops back to `on`.
    pub pairing_timeout_ms: u64,
    /// Enter pairing visibility immediately when the radio comes up.
    pub pairing_on_start: bool,
    /// Advertising retry backoff floor/ceiling in milliseconds.
    pub backoff_floor_ms: u64,
    pub backoff_max_ms: u64,
    /// Minimum gap between advertising restarts.
    pub adv_guard_ms: u64,
    /// Per-event-type minimum interval on `diag/bt`.
    pub diag_rate_limit_ms: u64,
    /// Dim/sleep powers the radio off when set.
    pub sleep_radio: bool,
    /// Link MTU; usable payload is `max(20, min(mtu - 3, 180))`.
    pub mtu: usize,
    pub bridge_enabled: bool,
    /// Inbound topic allow-list (`*`, `prefix/*`, or exact).
    pub allow_in: Vec<String>,
    /// Outbound topic allow-list.
    pub allow_out: Vec<String>,
    /// TTL for normalized `status/notifications` publications.
    pub notif_ttl_ms: u64,
    /// Interrupt queue capacity and per-tick drain quota.
    pub irq_queue_cap: usize,
    pub irq_drain_per_tick: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device_name: "wear".to_string(),
            status_ttl_ms: 8_000,
            rate_limit_ms: 500,
            coalesce_ms: 16,
            connected_sticky: true,
            connected_ttl_ms: 300_000,
            pairing_timeout_ms: 30_000,
            pairing_on_start: false,
            backoff_floor_ms: 800,
            backoff_max_ms: 60_000,
            adv_guard_ms: 1_000,
            diag_rate_limit_ms: 250,
            sleep_radio: false,
            mtu: 185,
            bridge_enabled: true,
            allow_in: vec!["notif/*".to_string(), "notifications/*".to_string()],
            allow_out: vec![
                "status/notifications".to_string(),
                "status/battery".to_string(),
            ],
            notif_ttl_ms: 15_000,
            irq_queue_cap: 8,
            irq_drain_per_tick: 2,
        }
    }
}

/// Long-range packet radio manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub enabled: bool,
    /// Block transmit while dimmed; receive stays live either way.
    pub pause_on_dim: bool,
    /// Full power-off on sleep when set; else receive-only.
    pub sleep_radio: bool,
    /// TTL for every `status/lora` publication.
    pub status_ttl_ms: u64,
    /// Minimum interval between `status/lora` publications.
    pub rate_limit_ms: u64,
    /// Per-event-type minimum interval on `diag/lora`.
    pub diag_rate_limit_ms: u64,
    /// Minimum gap between transmissions; 0 disables the cooldown.
    pub tx_cooldown_ms: u64,
    /// Error-retry backoff floor/ceiling in milliseconds.
    pub backoff_floor_ms: u64,
    pub backoff_max_ms: u64,
    /// Interval for refreshing the steady `rx` status.
    pub refresh_interval_ms: u64,
    /// Interrupt queue capacity and per-tick drain quota.
    pub irq_queue_cap: usize,
    pub irq_drain_per_tick: usize,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pause_on_dim: false,
            sleep_radio: true,
            status_ttl_ms: 8_000,
            rate_limit_ms: 500,
            diag_rate_limit_ms: 250,
            tx_cooldown_ms: 0,
            backoff_floor_ms: 1_000,
            backoff_max_ms: 60_000,
            refresh_interval_ms: 1_000,
            irq_queue_cap: 8,
            irq_drain_per_tick: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let power = PowerConfig::default();
        assert_eq!(power.sleep_mode, SleepMode::Dim);
        assert_eq!(power.dim_timeout_ms, 50_000);
        assert_eq!(power.sleep_timeout_ms, 90_000);

        let wifi = WifiConfig::default();
        assert!(!wifi.enabled);
        assert_eq!(wifi.backoff_floor_ms, 1_000);
        assert_eq!(wifi.connect_timeout_ms + wifi.dhcp_timeout_ms, 20_000);

        let ble = BleConfig::default();
        assert!(ble.connected_sticky);
        assert_eq!(ble.coalesce_ms, 16);
        assert_eq!(ble.irq_queue_cap, 8);

        let lora = LoraConfig::default();
        assert!(lora.sleep_radio);
        assert_eq!(lora.tx_cooldown_ms, 0);
    }

    #[test]
    fn test_sleep_mode_parses_lowercase() {
        let mode: SleepMode = serde_json::from_str("\"lightsleep\"").unwrap();
        assert_eq!(mode, SleepMode::LightSleep);
        let mode: SleepMode = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(mode, SleepMode::Off);
    }

    #[test]
    fn test_partial_deserialization_falls_back() {
        let wifi: WifiConfig = serde_json::from_str(r#"{ "enabled": true }"#).unwrap();
        assert!(wifi.enabled);
        assert_eq!(wifi.status_ttl_ms, 8_000);
        assert_eq!(wifi.rate_limit_ms, 500);
    }
}
