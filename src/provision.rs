//! Provisioning GATT protocol: UUIDs, states, and notification payloads.
//!
//! The byte sequences produced here are the wire format seen by the BLE
//! central; they are frozen and covered by exact-byte tests below.

use bluer::Uuid;

/// Provisioning service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x9a7d0000_7c2a_4f8e_9b32_9b3e6d4a0001);

/// Characteristic UUIDs.
pub mod characteristic {
    use bluer::Uuid;

    /// DeviceInfo characteristic - static device identity JSON (read).
    pub const DEVICE_INFO: Uuid = Uuid::from_u128(0x9a7d0000_7c2a_4f8e_9b32_9b3e6d4a0002);

    /// State characteristic - provisioning progress (read + notify).
    pub const STATE: Uuid = Uuid::from_u128(0x9a7d0000_7c2a_4f8e_9b32_9b3e6d4a0003);

    /// Command characteristic - receives commands from the central (write).
    pub const COMMAND: Uuid = Uuid::from_u128(0x9a7d0000_7c2a_4f8e_9b32_9b3e6d4a0004);
}

/// Static DeviceInfo payload. Returned verbatim on every read.
pub const DEVICE_INFO_JSON: &str =
    r#"{"Company":"PiDevelop.com","Developer":"james@pidevelop.com","project_name":"Provision BLE"}"#;

/// Conservative single-chunk payload limit for scan notifications.
///
/// SSID lists that would exceed this are truncated at an entry boundary,
/// never split across notifications.
pub const MAX_NOTIFY_BYTES: usize = 200;

/// Provisioning states surfaced to the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// No credentials configured; the daemon is waiting for commands.
    Unconfigured,
    /// A WiFi scan is in progress.
    Scanning,
    /// A scan finished and its SSID list has been published.
    ScanComplete,
    /// An activation request was submitted; association pending.
    Connecting,
    /// Associated with an IPv4 address on the WiFi interface.
    Connected,
}

impl ProvisionState {
    /// Wire name of the state, as embedded in notification payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionState::Unconfigured => "UNCONFIGURED",
            ProvisionState::Scanning => "SCANNING",
            ProvisionState::ScanComplete => "SCAN_COMPLETE",
            ProvisionState::Connecting => "CONNECTING",
            ProvisionState::Connected => "CONNECTED",
        }
    }
}

/// Escape a string for embedding in a notification payload.
///
/// Escapes `\`, `"`, `\n`, `\r`, `\t`; any other byte below 0x20 becomes
/// `?`. SSIDs are arbitrary octet strings, so this must hold for any 8-bit
/// input.
pub fn json_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push('?'),
            c => out.push(c),
        }
    }
    out
}

/// Build a plain state payload, e.g. `{"state":"SCANNING"}`.
pub fn state_payload(state: ProvisionState) -> Vec<u8> {
    format!("{{\"state\":\"{}\"}}", state.as_str()).into_bytes()
}

/// Build the scan-result payload: `{"op":"wifi_scan","ssids":[...]}`.
///
/// Entries are appended in order until the next whole entry (plus the
/// closing `]}`) would push the payload past [`MAX_NOTIFY_BYTES`]; the
/// remainder of the list is dropped.
pub fn scan_payload(ssids: &[String]) -> Vec<u8> {
    let mut payload = String::from("{\"op\":\"wifi_scan\",\"ssids\":[");
    let mut first = true;

    for ssid in ssids {
        let entry = format!(
            "{}\"{}\"",
            if first { "" } else { "," },
            json_escape(ssid)
        );

        // +2 for the closing "]}".
        if payload.len() + entry.len() + 2 > MAX_NOTIFY_BYTES {
            break;
        }

        payload.push_str(&entry);
        first = false;
    }

    payload.push_str("]}");
    payload.into_bytes()
}

/// Build the connected payload carrying the associated SSID and address.
pub fn connected_payload(ssid: &str, ip: &str) -> Vec<u8> {
    format!(
        "{{\"state\":\"CONNECTED\",\"ssid\":\"{}\",\"ip\":\"{}\"}}",
        json_escape(ssid),
        json_escape(ip)
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_uuid_is_frozen() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "9a7d0000-7c2a-4f8e-9b32-9b3e6d4a0001"
        );
    }

    #[test]
    fn characteristic_uuids_are_frozen() {
        assert_eq!(
            characteristic::DEVICE_INFO.to_string(),
            "9a7d0000-7c2a-4f8e-9b32-9b3e6d4a0002"
        );
        assert_eq!(
            characteristic::STATE.to_string(),
            "9a7d0000-7c2a-4f8e-9b32-9b3e6d4a0003"
        );
        assert_eq!(
            characteristic::COMMAND.to_string(),
            "9a7d0000-7c2a-4f8e-9b32-9b3e6d4a0004"
        );
    }

    #[test]
    fn device_info_exact_bytes() {
        assert_eq!(
            DEVICE_INFO_JSON.as_bytes(),
            br#"{"Company":"PiDevelop.com","Developer":"james@pidevelop.com","project_name":"Provision BLE"}"#
        );
    }

    #[test]
    fn state_payload_exact_bytes() {
        assert_eq!(
            state_payload(ProvisionState::Unconfigured),
            br#"{"state":"UNCONFIGURED"}"#
        );
        assert_eq!(
            state_payload(ProvisionState::Scanning),
            br#"{"state":"SCANNING"}"#
        );
        assert_eq!(
            state_payload(ProvisionState::ScanComplete),
            br#"{"state":"SCAN_COMPLETE"}"#
        );
        assert_eq!(
            state_payload(ProvisionState::Connecting),
            br#"{"state":"CONNECTING"}"#
        );
        assert_eq!(
            state_payload(ProvisionState::Connected),
            br#"{"state":"CONNECTED"}"#
        );
    }

    #[test]
    fn connected_payload_exact_bytes() {
        assert_eq!(
            connected_payload("HomeNet", "192.168.1.20"),
            br#"{"state":"CONNECTED","ssid":"HomeNet","ip":"192.168.1.20"}"#
        );
    }

    #[test]
    fn connected_payload_escapes_ssid() {
        assert_eq!(
            connected_payload("a\"b\\c", "10.0.0.1"),
            br#"{"state":"CONNECTED","ssid":"a\"b\\c","ip":"10.0.0.1"}"#
        );
        assert_eq!(
            connected_payload("tab\there", "10.0.0.1"),
            br#"{"state":"CONNECTED","ssid":"tab\there","ip":"10.0.0.1"}"#
        );
    }

    #[test]
    fn escape_replaces_control_chars() {
        assert_eq!(json_escape("a\x01b\x1fc"), "a?b?c");
        assert_eq!(json_escape("line\nbreak"), "line\\nbreak");
        assert_eq!(json_escape("cr\rtab\t"), "cr\\rtab\\t");
    }

    #[test]
    fn escape_passes_plain_text_through() {
        assert_eq!(json_escape("HomeNet 5GHz"), "HomeNet 5GHz");
        // Multi-byte UTF-8 is untouched.
        assert_eq!(json_escape("café"), "café");
    }

    #[test]
    fn scan_payload_lists_ssids_in_order() {
        let ssids = vec!["HomeNet".to_string(), "Cafe".to_string()];
        assert_eq!(
            scan_payload(&ssids),
            br#"{"op":"wifi_scan","ssids":["HomeNet","Cafe"]}"#
        );
    }

    #[test]
    fn scan_payload_empty_list() {
        assert_eq!(scan_payload(&[]), br#"{"op":"wifi_scan","ssids":[]}"#);
    }

    #[test]
    fn scan_payload_never_exceeds_cap() {
        let ssids: Vec<String> = (0..40).map(|i| format!("network-{i:02}")).collect();
        let payload = scan_payload(&ssids);
        assert!(payload.len() <= MAX_NOTIFY_BYTES);
    }

    #[test]
    fn scan_payload_drops_whole_entries() {
        // First entry fits; the second would overflow the cap and must be
        // dropped entirely rather than split.
        let long_a = "A".repeat(160);
        let long_b = "B".repeat(160);
        let payload = scan_payload(&[long_a.clone(), long_b]);

        let expected = format!("{{\"op\":\"wifi_scan\",\"ssids\":[\"{long_a}\"]}}");
        assert_eq!(payload, expected.into_bytes());
    }

    #[test]
    fn scan_payload_oversized_first_entry_yields_empty_list() {
        let huge = "X".repeat(300);
        assert_eq!(scan_payload(&[huge]), br#"{"op":"wifi_scan","ssids":[]}"#);
    }

    #[test]
    fn scan_payload_escaping_counts_toward_cap() {
        // 90 escaped quotes render as 180 bytes; with the fixed prefix the
        // entry cannot fit and the list stays empty.
        let quotes = "\"".repeat(90);
        let payload = scan_payload(&[quotes]);
        assert_eq!(payload, br#"{"op":"wifi_scan","ssids":[]}"#);
        assert!(payload.len() <= MAX_NOTIFY_BYTES);
    }
}
