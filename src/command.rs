//! Command characteristic payload parsing.
//!
//! Centrals write small JSON objects to the Command characteristic:
//! `{"op":"wifi_scan"}` or `{"op":"wifi_connect","ssid":"...","psk":"..."}`.
//! Older clients send `{"cmd":"wifi.scan"}` / `{"cmd":"wifi.connect",...}`.

use serde::Deserialize;

/// Raw shape of a command write. All fields optional; validation happens
/// in [`parse`].
#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    ssid: Option<String>,
    #[serde(default)]
    psk: Option<String>,
}

/// A validated command from the central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enumerate nearby SSIDs and publish them on the State characteristic.
    WifiScan,
    /// Provision the given network with a WPA-PSK profile.
    WifiConnect { ssid: String, psk: String },
}

/// Errors from command parsing. All of them are logged and dropped by the
/// dispatcher; none change provisioning state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The write carried no bytes.
    Empty,
    /// The payload was not a JSON object.
    Malformed(String),
    /// Neither `op` nor a recognized legacy `cmd` was present.
    MissingOp,
    /// The op (or mapped legacy cmd) is not one we handle.
    UnknownOp(String),
    /// `wifi_connect` without a usable `ssid`.
    MissingSsid,
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty payload"),
            CommandError::Malformed(msg) => write!(f, "malformed payload: {}", msg),
            CommandError::MissingOp => write!(f, "no op/cmd field"),
            CommandError::UnknownOp(op) => write!(f, "unknown op: {}", op),
            CommandError::MissingSsid => write!(f, "wifi_connect missing ssid"),
        }
    }
}

impl std::error::Error for CommandError {}

/// Parse the raw bytes of a Command write.
///
/// The payload is decoded as UTF-8 best effort (invalid sequences become
/// replacement characters) before JSON parsing, so a central sending raw
/// SSID octets in an otherwise valid payload is still understood.
pub fn parse(data: &[u8]) -> Result<Command, CommandError> {
    if data.is_empty() {
        return Err(CommandError::Empty);
    }

    let text = String::from_utf8_lossy(data);
    let raw: RawCommand = serde_json::from_str(&text)
        .map_err(|e| CommandError::Malformed(e.to_string()))?;

    let op = match raw.op.filter(|op| !op.is_empty()) {
        Some(op) => op,
        None => match raw.cmd.as_deref() {
            Some("wifi.scan") => "wifi_scan".to_string(),
            Some("wifi.connect") => "wifi_connect".to_string(),
            Some(other) => return Err(CommandError::UnknownOp(other.to_string())),
            None => return Err(CommandError::MissingOp),
        },
    };

    match op.as_str() {
        "wifi_scan" => Ok(Command::WifiScan),
        "wifi_connect" => {
            let ssid = raw.ssid.unwrap_or_default();
            if ssid.is_empty() {
                return Err(CommandError::MissingSsid);
            }
            Ok(Command::WifiConnect {
                ssid,
                psk: raw.psk.unwrap_or_default(),
            })
        }
        other => Err(CommandError::UnknownOp(other.to_string())),
    }
}
