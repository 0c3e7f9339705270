//! The provisioning event loop.
//!
//! Every state transition and every State-characteristic emission happens
//! here, on one task draining one channel. BLE callbacks, the netlink
//! monitor thread, and async WiFi completions all post [`Event`]s; nothing
//! else touches the provisioning state.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::provision::{connected_payload, scan_payload, state_payload, ProvisionState};
use crate::wifi::WifiManager;

/// Events serialized onto the dispatcher.
#[derive(Debug)]
pub enum Event {
    /// The central wrote the Command characteristic.
    CommandWrite(Vec<u8>),
    /// The central subscribed to State notifications. The sink is drained
    /// by the notify-session future owning the BlueZ notifier, so
    /// emission order on the bus is the dispatcher's send order.
    StateSubscribed {
        generation: u64,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    },
    /// The subscription of the given generation ended (StopNotify,
    /// disconnect, or notify failure). Stale generations, posted by an
    /// old session racing a re-subscribe, are ignored.
    StateUnsubscribed { generation: u64 },
    /// The netlink monitor saw an IPv4 address appear on the WiFi interface.
    Ipv4Ready,
    /// The netlink monitor saw an IPv4 address removed.
    Ipv4Removed,
}

struct Subscription {
    generation: u64,
    sink: mpsc::UnboundedSender<Vec<u8>>,
}

/// The event loop. Owns the provisioning state, the last-connected
/// `(ssid, ip)`, the State subscription, and the cached State value shared
/// with the BLE read path.
pub struct Dispatcher<W: WifiManager> {
    state: ProvisionState,
    last_connected: Option<(String, String)>,
    subscription: Option<Subscription>,
    state_value: Arc<RwLock<Vec<u8>>>,
    wifi: Arc<W>,
}

impl<W: WifiManager> Dispatcher<W> {
    pub fn new(wifi: Arc<W>, state_value: Arc<RwLock<Vec<u8>>>) -> Self {
        Self {
            state: ProvisionState::Unconfigured,
            last_connected: None,
            subscription: None,
            state_value,
            wifi,
        }
    }

    /// Current provisioning state.
    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Drain the event channel until every sender is gone. The daemon never
    /// drops its senders, so this runs for the process lifetime.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::CommandWrite(data) => self.handle_command(&data).await,
            Event::StateSubscribed { generation, sink } => {
                self.handle_subscribed(generation, sink).await
            }
            Event::StateUnsubscribed { generation } => self.handle_unsubscribed(generation),
            Event::Ipv4Ready => self.handle_ipv4_ready().await,
            Event::Ipv4Removed => info!("ip_monitor: wifi IPv4 address removed"),
        }
    }

    async fn handle_command(&mut self, data: &[u8]) {
        info!("Command WriteValue: {}", String::from_utf8_lossy(data));

        match command::parse(data) {
            Ok(Command::WifiScan) => {
                info!("Command dispatch: wifi_scan");
                self.handle_scan().await;
            }
            Ok(Command::WifiConnect { ssid, psk }) => {
                info!("Command dispatch: wifi_connect");
                self.handle_connect(&ssid, &psk).await;
            }
            Err(e) => warn!("Command dispatch: {}", e),
        }
    }

    /// Scan flow: SCANNING, then the SSID list, then SCAN_COMPLETE, in that
    /// order on the notification stream. A failed or busy scan still walks
    /// the full sequence around an empty list.
    async fn handle_scan(&mut self) {
        self.set_state(ProvisionState::Scanning).await;

        let ssids = match self.wifi.scan_ssids().await {
            Ok(list) => list,
            Err(e) => {
                warn!("wifi_scan: failed: {}", e);
                Vec::new()
            }
        };

        info!("wifi_scan: completed, ssid_count={}", ssids.len());
        self.notify_value(scan_payload(&ssids)).await;

        self.set_state(ProvisionState::ScanComplete).await;
    }

    /// Connect flow: CONNECTING is emitted before the activation request is
    /// submitted; a synchronous rejection reverts to UNCONFIGURED. An
    /// accepted request leaves the state at CONNECTING until the IPv4
    /// monitor reports an address.
    async fn handle_connect(&mut self, ssid: &str, psk: &str) {
        self.set_state(ProvisionState::Connecting).await;

        if let Err(e) = self.wifi.connect(ssid, psk).await {
            warn!("wifi_connect: {}", e);
            self.set_state(ProvisionState::Unconfigured).await;
        }
    }

    /// An IPv4 address appeared on the WiFi interface: query the active
    /// connection and publish CONNECTED. Duplicate events for an unchanged
    /// address re-emit the same payload.
    async fn handle_ipv4_ready(&mut self) {
        let active = match self.wifi.active_connection().await {
            Ok(active) => active,
            Err(e) => {
                warn!("ipv4_ready: active connection query failed: {}", e);
                return;
            }
        };

        let Some(ip) = active.ip else {
            debug!("ipv4_ready: no address on interface yet");
            return;
        };

        info!("wifi connected ssid={} ip={}", active.ssid, ip);

        self.state = ProvisionState::Connected;
        let payload = connected_payload(&active.ssid, &ip);
        self.last_connected = Some((active.ssid, ip));
        self.notify_value(payload).await;
    }

    async fn handle_subscribed(&mut self, generation: u64, sink: mpsc::UnboundedSender<Vec<u8>>) {
        info!("State notify ENABLED by client");
        self.subscription = Some(Subscription { generation, sink });

        // A central subscribing after provisioning already succeeded gets
        // the truth immediately without issuing any command.
        if self.state == ProvisionState::Connected {
            if let Some((ssid, ip)) = self.last_connected.clone() {
                self.notify_value(connected_payload(&ssid, &ip)).await;
            }
        }
    }

    fn handle_unsubscribed(&mut self, generation: u64) {
        match &self.subscription {
            Some(sub) if sub.generation == generation => {
                info!("State notify DISABLED by client");
                self.subscription = None;
            }
            _ => debug!("stale unsubscribe for generation {}", generation),
        }
    }

    /// Transition and emit the plain state payload.
    async fn set_state(&mut self, next: ProvisionState) {
        self.state = next;
        self.notify_value(state_payload(next)).await;
    }

    /// Replace the cached State value and, when a central is subscribed,
    /// hand the payload to the notification forwarder. A dead forwarder
    /// (central gone) clears the subscription.
    async fn notify_value(&mut self, payload: Vec<u8>) {
        *self.state_value.write().await = payload.clone();

        match &self.subscription {
            Some(sub) => {
                if sub.sink.send(payload).is_err() {
                    debug!("notify: subscriber gone, dropping subscription");
                    self.subscription = None;
                }
            }
            None => debug!("notify: skipped (not notifying)"),
        }
    }
}
