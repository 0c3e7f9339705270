//! Daemon configuration.

use std::path::PathBuf;

/// Runtime configuration with environment overrides.
pub struct Config {
    /// Adapter alias, also used as the advertised local name.
    pub alias: String,
    /// WiFi interface to provision and monitor.
    pub wifi_ifname: String,
    /// Log file path; stderr is used if it cannot be opened.
    pub log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alias: "PiDevelopDotcom".to_string(),
            wifi_ifname: "wlan0".to_string(),
            log_file: PathBuf::from("/var/log/provision/ble.log"),
        }
    }
}

impl Config {
    /// Defaults overridden by `PROVISION_BLE_ALIAS`,
    /// `PROVISION_WIFI_IFNAME`, and `PROVISION_LOG_FILE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(alias) = std::env::var("PROVISION_BLE_ALIAS") {
            if !alias.is_empty() {
                config.alias = alias;
            }
        }
        if let Ok(ifname) = std::env::var("PROVISION_WIFI_IFNAME") {
            if !ifname.is_empty() {
                config.wifi_ifname = ifname;
            }
        }
        if let Ok(path) = std::env::var("PROVISION_LOG_FILE") {
            if !path.is_empty() {
                config.log_file = PathBuf::from(path);
            }
        }

        config
    }
}
