//! BLE GATT server for the provisioning service.
//!
//! Exports the provisioning application (one primary service, three
//! characteristics) and the advertisement using bluer, and bridges the
//! BlueZ callbacks into dispatcher events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use bluer::Session;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::dispatcher::Event;
use crate::provision::{characteristic, DEVICE_INFO_JSON, SERVICE_UUID};

/// Errors from BLE setup. All of them are fatal at startup.
#[derive(Debug)]
pub enum BleError {
    /// No usable Bluetooth adapter.
    AdapterNotFound,
    /// Exporting the GATT application or advertisement failed.
    Export(bluer::Error),
    /// A method call against the Bluetooth stack failed.
    Call(bluer::Error),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BleError::AdapterNotFound => write!(f, "no Bluetooth adapter available"),
            BleError::Export(e) => write!(f, "failed to export GATT objects: {}", e),
            BleError::Call(e) => write!(f, "Bluetooth stack call failed: {}", e),
        }
    }
}

impl std::error::Error for BleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BleError::AdapterNotFound => None,
            BleError::Export(e) | BleError::Call(e) => Some(e),
        }
    }
}

/// Registration handles. Dropping them unregisters the application and
/// advertisement (the session and adapter ride along so the bus
/// connection outlives registration), so the daemon holds them for its
/// lifetime.
pub struct BleHandles {
    _session: Session,
    _adapter: bluer::Adapter,
    _app: ApplicationHandle,
    _adv: bluer::adv::AdvertisementHandle,
}

impl Drop for BleHandles {
    fn drop(&mut self) {
        // bluer exposes no callback for BlueZ's Release on the
        // advertisement object; teardown is observable only here.
        info!("Advertisement and GATT application released");
    }
}

/// Posts the unsubscribe event on every exit path of a notify session,
/// including bluer cancelling the session future on StopNotify.
struct UnsubscribeGuard {
    event_tx: mpsc::Sender<Event>,
    generation: u64,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        // Drop cannot await; a full channel is recovered by the
        // dispatcher's dead-sink check on the next emission.
        let _ = self.event_tx.try_send(Event::StateUnsubscribed {
            generation: self.generation,
        });
    }
}

/// GATT server for the provisioning service.
pub struct GattServer {
    alias: String,
    event_tx: mpsc::Sender<Event>,
    state_value: Arc<RwLock<Vec<u8>>>,
}

impl GattServer {
    /// Create a new GATT server posting into the dispatcher channel.
    /// `state_value` is the cached State payload maintained by the
    /// dispatcher and served on reads.
    pub fn new(
        alias: String,
        event_tx: mpsc::Sender<Event>,
        state_value: Arc<RwLock<Vec<u8>>>,
    ) -> Self {
        Self {
            alias,
            event_tx,
            state_value,
        }
    }

    /// Bring up the adapter, export the GATT application, and start
    /// advertising. The returned handles must be kept alive.
    pub async fn start(&self) -> Result<BleHandles, BleError> {
        info!("Initializing BLE...");

        let session = Session::new().await.map_err(BleError::Call)?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BleError::AdapterNotFound)?;
        adapter.set_powered(true).await.map_err(BleError::Call)?;

        info!(
            "Using Bluetooth adapter {} ({})",
            adapter.name(),
            adapter.address().await.map_err(BleError::Call)?
        );

        // Set the pairing name before advertising. Not fatal: the stack
        // falls back to its configured name.
        match adapter.set_alias(self.alias.clone()).await {
            Ok(()) => info!("BLE adapter alias set to '{}'", self.alias),
            Err(e) => warn!("Failed to set BLE alias: {}", e),
        }

        let app = self.build_application();
        let app_handle = adapter
            .serve_gatt_application(app)
            .await
            .map_err(BleError::Export)?;
        info!("GATT application registered");

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.alias.clone()),
            ..Default::default()
        };
        let adv_handle = adapter.advertise(adv).await.map_err(BleError::Export)?;
        info!("Advertisement registered as '{}'", self.alias);

        Ok(BleHandles {
            _session: session,
            _adapter: adapter,
            _app: app_handle,
            _adv: adv_handle,
        })
    }

    /// Build the GATT application: DeviceInfo (read), State (read +
    /// notify), Command (write).
    fn build_application(&self) -> Application {
        // DeviceInfo: static identity payload.
        let device_info_read = CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                Box::pin(async move {
                    debug!("DeviceInfo ReadValue");
                    Ok(DEVICE_INFO_JSON.as_bytes().to_vec())
                })
            }),
            ..Default::default()
        };

        // State: reads serve the dispatcher-maintained cache.
        let state_value = Arc::clone(&self.state_value);
        let state_read = CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let state_value = Arc::clone(&state_value);
                Box::pin(async move {
                    debug!("State ReadValue");
                    Ok(state_value.read().await.clone())
                })
            }),
            ..Default::default()
        };

        // State notifications: each subscription gets a generation and an
        // unbounded channel. The dispatcher sends payloads in emission
        // order; the loop below owns the BlueZ notifier and pushes them
        // out for as long as the session lasts. BlueZ signals StopNotify
        // by cancelling this future, so the loop must run inside it, not
        // in a detached task.
        let event_tx = self.event_tx.clone();
        let generations = Arc::new(AtomicU64::new(0));
        let state_notify = CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let event_tx = event_tx.clone();
                let generation = generations.fetch_add(1, Ordering::Relaxed) + 1;
                Box::pin(async move {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
                    if event_tx
                        .send(Event::StateSubscribed {
                            generation,
                            sink: tx,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let _guard = UnsubscribeGuard {
                        event_tx,
                        generation,
                    };

                    while let Some(value) = rx.recv().await {
                        if notifier.notify(value).await.is_err() {
                            break;
                        }
                    }
                })
            })),
            ..Default::default()
        };

        // Command: writes are posted to the dispatcher, which parses and
        // executes them in arrival order.
        let event_tx = self.event_tx.clone();
        let command_write = CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |new_value, _req| {
                let event_tx = event_tx.clone();
                Box::pin(async move {
                    if event_tx.send(Event::CommandWrite(new_value)).await.is_err() {
                        warn!("Command write dropped: dispatcher gone");
                    }
                    Ok(())
                })
            })),
            ..Default::default()
        };

        Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: characteristic::DEVICE_INFO,
                        read: Some(device_info_read),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: characteristic::STATE,
                        read: Some(state_read),
                        notify: Some(state_notify),
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: characteristic::COMMAND,
                        write: Some(command_write),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}
