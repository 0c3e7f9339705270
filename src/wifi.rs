//! WiFi management via NetworkManager (nmcli).
//!
//! Provides a trait-based abstraction for WiFi operations, with a real
//! implementation using nmcli and a mock for testing.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Result type for WiFi operations.
pub type WifiResult<T> = Result<T, WifiError>;

/// Errors from WiFi operations.
#[derive(Debug, Clone)]
pub enum WifiError {
    /// nmcli command failed.
    CommandFailed(String),
    /// The add-and-activate submission was rejected outright.
    ConnectRejected(String),
}

impl std::fmt::Display for WifiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WifiError::CommandFailed(msg) => write!(f, "nmcli command failed: {}", msg),
            WifiError::ConnectRejected(msg) => write!(f, "activation rejected: {}", msg),
        }
    }
}

impl std::error::Error for WifiError {}

/// What the WiFi interface is currently associated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveConnection {
    /// SSID of the active connection, `"unknown"` when unavailable.
    pub ssid: String,
    /// First IPv4 address on the interface, if any.
    pub ip: Option<String>,
}

/// Trait for WiFi operations.
///
/// This abstraction allows for testing with a mock implementation.
pub trait WifiManager: Send + Sync {
    /// Enumerate nearby SSIDs, strongest first, deduplicated.
    fn scan_ssids(&self) -> impl std::future::Future<Output = WifiResult<Vec<String>>> + Send;

    /// Submit a WPA-PSK profile for activation. Returns Ok once the request
    /// is accepted; association happens in the background and success is
    /// observed via the IPv4 monitor.
    fn connect(
        &self,
        ssid: &str,
        psk: &str,
    ) -> impl std::future::Future<Output = WifiResult<()>> + Send;

    /// Report the active connection name and first IPv4 address.
    fn active_connection(
        &self,
    ) -> impl std::future::Future<Output = WifiResult<ActiveConnection>> + Send;
}

/// Scan re-entry guard. One word, compare-and-swap; released on drop so
/// every exit path (including failures) releases it.
pub struct ScanBusy(AtomicBool);

impl ScanBusy {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Acquire the guard, or `None` if a scan is already running.
    pub fn try_acquire(&self) -> Option<ScanBusyGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ScanBusyGuard(&self.0))
    }
}

impl Default for ScanBusy {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScanBusyGuard<'a>(&'a AtomicBool);

impl Drop for ScanBusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Process-wide guard: at most one scan touches the WiFi layer at a time.
static SCAN_BUSY: ScanBusy = ScanBusy::new();

/// How long to let scan results populate after requesting a rescan.
const SCAN_SETTLE: Duration = Duration::from_millis(700);

/// Real WiFi manager using nmcli.
pub struct NmcliWifiManager {
    ifname: String,
}

impl NmcliWifiManager {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
        }
    }

    /// Run an nmcli command and return stdout.
    async fn run_nmcli(&self, args: &[&str]) -> WifiResult<String> {
        debug!("Running: nmcli {}", args.join(" "));

        let output = Command::new("nmcli")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| WifiError::CommandFailed(format!("Failed to execute nmcli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("nmcli failed: {}", stderr);
            return Err(WifiError::CommandFailed(stderr.into_owned()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WifiManager for NmcliWifiManager {
    async fn scan_ssids(&self) -> WifiResult<Vec<String>> {
        let _guard = match SCAN_BUSY.try_acquire() {
            Some(guard) => guard,
            None => {
                warn!("wifi_scan: ignored (busy)");
                return Ok(Vec::new());
            }
        };

        info!("wifi_scan: starting scan");

        // Trigger a fresh scan; fall back to whatever is cached on failure.
        if self
            .run_nmcli(&["device", "wifi", "rescan", "ifname", self.ifname.as_str()])
            .await
            .is_err()
        {
            warn!("wifi_scan: scan request failed, using cached results");
        }

        // Allow scan results to populate.
        tokio::time::sleep(SCAN_SETTLE).await;

        let output = self
            .run_nmcli(&[
                "-t",
                "-f",
                "SSID,SIGNAL",
                "device",
                "wifi",
                "list",
                "ifname",
                self.ifname.as_str(),
            ])
            .await?;

        Ok(parse_scan_output(&output))
    }

    async fn connect(&self, ssid: &str, psk: &str) -> WifiResult<()> {
        info!("wifi_connect: starting ssid={}", ssid);

        // Create the profile. A failure here is the synchronous-rejection
        // path; the caller reverts to UNCONFIGURED.
        self.run_nmcli(&[
            "connection",
            "add",
            "type",
            "wifi",
            "ifname",
            self.ifname.as_str(),
            "con-name",
            ssid,
            "autoconnect",
            "yes",
            "ssid",
            ssid,
            "802-11-wireless.mode",
            "infrastructure",
            "wifi-sec.key-mgmt",
            "wpa-psk",
            "wifi-sec.psk",
            psk,
            "ipv4.method",
            "auto",
        ])
        .await
        .map_err(|e| WifiError::ConnectRejected(e.to_string()))?;

        // Fire-and-forget activation; association success is observed later
        // through the IPv4 monitor, failure is only logged.
        let ssid = ssid.to_string();
        tokio::spawn(async move {
            let status = Command::new("nmcli")
                .args(["connection", "up", &ssid])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(s) if s.success() => info!("wifi_connect: activation finished for {}", ssid),
                Ok(s) => warn!("wifi_connect: activation exited with {} for {}", s, ssid),
                Err(e) => warn!("wifi_connect: activation spawn failed for {}: {}", ssid, e),
            }
        });

        Ok(())
    }

    async fn active_connection(&self) -> WifiResult<ActiveConnection> {
        let output = self
            .run_nmcli(&[
                "-t",
                "-f",
                "GENERAL.CONNECTION,IP4.ADDRESS",
                "device",
                "show",
                self.ifname.as_str(),
            ])
            .await?;

        Ok(parse_device_show(&output))
    }
}

/// Parse `nmcli -t -f SSID,SIGNAL device wifi list` output into a
/// deduplicated SSID list, strongest signal first.
///
/// Input format (terse mode): `SSID:SIGNAL`, one access point per line.
/// Duplicate SSIDs (several APs for one network) keep the strongest
/// observed signal; hidden networks (empty SSID) are dropped.
pub fn parse_scan_output(output: &str) -> Vec<String> {
    let mut best_strength = std::collections::BTreeMap::new();

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }

        // The signal column never contains ':', so split from the right;
        // the SSID itself may contain escaped colons.
        let Some((ssid_raw, signal_raw)) = line.rsplit_once(':') else {
            debug!("Skipping malformed line: {}", line);
            continue;
        };

        let ssid = unescape_terse(ssid_raw);
        if ssid.is_empty() {
            continue;
        }

        let Ok(signal) = signal_raw.parse::<i32>() else {
            debug!("Skipping line with invalid signal: {}", line);
            continue;
        };

        let entry = best_strength.entry(ssid).or_insert(signal);
        if signal > *entry {
            *entry = signal;
        }
    }

    let mut sorted: Vec<(String, i32)> = best_strength.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    info!("wifi_scan: found {} SSIDs", sorted.len());
    sorted.into_iter().map(|(ssid, _)| ssid).collect()
}

/// Undo nmcli's terse-mode escaping of `\` and `:`.
fn unescape_terse(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse `nmcli -t -f GENERAL.CONNECTION,IP4.ADDRESS device show <ifname>`.
///
/// Lines look like `GENERAL.CONNECTION:HomeNet` and
/// `IP4.ADDRESS[1]:192.168.1.20/24`. The first IPv4 address wins; the
/// prefix length is stripped. A connection of `--` (none) maps to the
/// `"unknown"` default.
pub fn parse_device_show(output: &str) -> ActiveConnection {
    let mut ssid = None;
    let mut ip = None;

    for line in output.lines() {
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };

        if field == "GENERAL.CONNECTION" {
            let value = unescape_terse(value);
            if !value.is_empty() && value != "--" {
                ssid = Some(value);
            }
        } else if field.starts_with("IP4.ADDRESS") && ip.is_none() {
            let addr = value.split('/').next().unwrap_or(value);
            if !addr.is_empty() {
                ip = Some(addr.to_string());
            }
        }
    }

    ActiveConnection {
        ssid: ssid.unwrap_or_else(|| "unknown".to_string()),
        ip,
    }
}

/// Mock WiFi manager for testing.
#[cfg(test)]
pub struct MockWifiManager {
    pub ssids: Vec<String>,
    pub connect_result: Result<(), String>,
    pub active: ActiveConnection,
}

#[cfg(test)]
impl Default for MockWifiManager {
    fn default() -> Self {
        Self {
            ssids: vec![],
            connect_result: Ok(()),
            active: ActiveConnection {
                ssid: "unknown".into(),
                ip: None,
            },
        }
    }
}

#[cfg(test)]
impl WifiManager for MockWifiManager {
    async fn scan_ssids(&self) -> WifiResult<Vec<String>> {
        Ok(self.ssids.clone())
    }

    async fn connect(&self, ssid: &str, _psk: &str) -> WifiResult<()> {
        match &self.connect_result {
            Ok(()) => Ok(()),
            Err(msg) => Err(WifiError::ConnectRejected(format!(
                "mock connect to {} failed: {}",
                ssid, msg
            ))),
        }
    }

    async fn active_connection(&self) -> WifiResult<ActiveConnection> {
        Ok(self.active.clone())
    }
}
