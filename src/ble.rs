use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RemoteError, Result},
    transport::{CharacteristicInfo, Transport, TransportEvent},
    types::DeviceHandle,
};

type PeripheralMap = Arc<Mutex<HashMap<String, Peripheral>>>;

/// btleplug-backed [`Transport`]
///
/// Uses the first Bluetooth adapter on the system. Outcomes of every request
/// are reported on the event channel returned by [`BleTransport::new`].
pub struct BleTransport {
    adapter: Adapter,
    peripherals: PeripheralMap,
    events: mpsc::UnboundedSender<TransportEvent>,
    central_pump: JoinHandle<()>,
    connection: Option<Connection>,
}

/// Peripheral currently targeted and the tasks working on it
struct Connection {
    peripheral: Peripheral,
    address: String,
    tasks: Vec<JoinHandle<()>>,
    writers: HashMap<Uuid, Writer>,
}

/// Latest-value write slot
///
/// A frame replaced before the writer task picks it up is dropped.
struct Writer {
    slot: watch::Sender<Option<Bytes>>,
    task: JoinHandle<()>,
}

impl Connection {
    fn new(peripheral: Peripheral, address: String) -> Self {
        Self {
            peripheral,
            address,
            tasks: Vec::new(),
            writers: HashMap::new(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for writer in self.writers.values() {
            writer.task.abort();
        }
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.central_pump.abort();
    }
}

impl BleTransport {
    /// Open the first Bluetooth adapter and start listening for its events
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::AdapterUnavailable`] if no adapter is present,
    /// or [`RemoteError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RemoteError::AdapterUnavailable)?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let peripherals = PeripheralMap::default();

        let central_events = adapter.events().await?;
        let central_pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            peripherals.clone(),
            events.clone(),
        ));

        Ok((
            Self {
                adapter,
                peripherals,
                events,
                central_pump,
                connection: None,
            },
            events_rx,
        ))
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| RemoteError::Disconnected("no device selected".to_string()))
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.connection()?
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(RemoteError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn start_discovery(&mut self) -> Result<()> {
        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_discovery(&mut self) -> Result<()> {
        debug!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceHandle) -> Result<()> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device.address.to_uppercase())
            .cloned()
            .ok_or_else(|| RemoteError::DeviceNotFound(device.address.clone()))?;

        info!("Connecting to {}", device);
        let mut connection = Connection::new(peripheral.clone(), device.address.clone());
        let events = self.events.clone();
        let address = device.address.clone();
        connection.tasks.push(tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected { address },
                Err(e) => {
                    let reason = e.to_string();
                    TransportEvent::ConnectFailed {
                        address,
                        pairing_removed: is_pairing_removed(&reason),
                        reason,
                    }
                }
            };
            let _ = events.send(event);
        }));

        self.connection = Some(connection);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };

        info!("Disconnecting from {}", connection.address);
        let peripheral = connection.peripheral.clone();
        drop(connection);
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        });
        Ok(())
    }

    async fn discover_services(&mut self) -> Result<()> {
        let peripheral = self.connection()?.peripheral.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let characteristics = peripheral
                        .characteristics()
                        .iter()
                        .map(characteristic_info)
                        .collect();
                    TransportEvent::ServicesResolved(characteristics)
                }
                Err(e) => gatt_failure(&e),
            };
            let _ = events.send(event);
        });

        if let Some(connection) = self.connection.as_mut() {
            connection.tasks.push(task);
        }
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.connection()?.peripheral.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(gatt_failure(&e));
                    return;
                }
            };
            if let Err(e) = peripheral.subscribe(&target).await {
                let _ = events.send(gatt_failure(&e));
                return;
            }

            debug!("Subscribed to {}", target.uuid);
            while let Some(notification) = notifications.next().await {
                if notification.uuid != target.uuid {
                    continue;
                }
                if events
                    .send(TransportEvent::DataReceived(Bytes::from(notification.value)))
                    .is_err()
                {
                    break;
                }
            }
            debug!("Notification stream for {} ended", target.uuid);
        });

        if let Some(connection) = self.connection.as_mut() {
            connection.tasks.push(task);
        }
        Ok(())
    }

    async fn write(&mut self, characteristic: Uuid, data: Bytes) -> Result<()> {
        if let Some(writer) = self
            .connection
            .as_ref()
            .and_then(|connection| connection.writers.get(&characteristic))
        {
            writer.slot.send_replace(Some(data));
            return Ok(());
        }

        let target = self.characteristic(characteristic)?;
        let peripheral = self.connection()?.peripheral.clone();
        let (slot, latest) = watch::channel(Some(data));
        let task = tokio::spawn(write_latest(peripheral, target, latest));

        if let Some(connection) = self.connection.as_mut() {
            connection
                .writers
                .insert(characteristic, Writer { slot, task });
        }
        Ok(())
    }
}

/// Forward adapter events as [`TransportEvent`]s until the adapter goes away
async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    peripherals: PeripheralMap,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = central_events.next().await {
        let event = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                discovered(&adapter, &id, &peripherals).await
            }
            CentralEvent::DeviceDisconnected(id) => match adapter.peripheral(&id).await {
                Ok(peripheral) => Some(TransportEvent::Disconnected {
                    address: peripheral.address().to_string(),
                    reason: "link lost".to_string(),
                }),
                Err(e) => {
                    debug!("Disconnect from unknown peripheral: {}", e);
                    None
                }
            },
            _ => None,
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                return;
            }
        }
    }

    warn!("Adapter event stream ended");
    let _ = events.send(TransportEvent::AdapterUnavailable(
        "adapter event stream ended".to_string(),
    ));
}

async fn discovered(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &PeripheralMap,
) -> Option<TransportEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok().flatten()?;

    let address = properties.address.to_string();
    let name = properties
        .local_name
        .unwrap_or_else(|| "Unknown".to_string());

    peripherals
        .lock()
        .await
        .insert(address.to_uppercase(), peripheral);
    Some(TransportEvent::Discovered(DeviceHandle::new(address, name)))
}

/// Write whatever frame is current, skipping any that were replaced meanwhile
async fn write_latest(
    peripheral: Peripheral,
    target: Characteristic,
    mut latest: watch::Receiver<Option<Bytes>>,
) {
    loop {
        let frame = latest.borrow_and_update().clone();
        if let Some(frame) = frame {
            debug!("Writing {:02X?}", &frame[..]);
            if let Err(e) = peripheral
                .write(&target, &frame, WriteType::WithoutResponse)
                .await
            {
                warn!("Write to {} failed: {}", target.uuid, e);
            }
        }

        if latest.changed().await.is_err() {
            return;
        }
    }
}

fn characteristic_info(characteristic: &Characteristic) -> CharacteristicInfo {
    let flags = characteristic.properties;
    CharacteristicInfo {
        uuid: characteristic.uuid,
        can_write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        can_notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

fn gatt_failure(error: &btleplug::Error) -> TransportEvent {
    let reason = error.to_string();
    if is_insufficient_authentication(&reason) {
        TransportEvent::AuthenticationRequired
    } else {
        TransportEvent::ServiceDiscoveryFailed(reason)
    }
}

/// Whether a connect failure says the peer dropped its bond with us
fn is_pairing_removed(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("peer removed pairing")
        || reason.contains("pairing information")
        || reason.contains("authentication canceled")
        || (reason.contains("bond") && reason.contains("removed"))
}

/// Whether a GATT failure is the remote asking for an encrypted link
fn is_insufficient_authentication(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("insufficient authentication")
        || reason.contains("insufficient encryption")
        || reason.contains("authentication is insufficient")
        || reason.contains("not paired")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_removed_detection() {
        assert!(is_pairing_removed("Peer removed pairing information"));
        assert!(is_pairing_removed("Bond information was removed by the remote"));
        assert!(!is_pairing_removed("Connection timed out"));
        assert!(!is_pairing_removed("Device not found"));
    }

    #[test]
    fn test_insufficient_authentication_detection() {
        assert!(is_insufficient_authentication(
            "Authentication is insufficient."
        ));
        assert!(is_insufficient_authentication(
            "org.bluez.Error.Failed: Insufficient Authentication"
        ));
        assert!(!is_insufficient_authentication("Operation timed out"));
    }

    #[test]
    fn test_characteristic_roles() {
        let write = Characteristic {
            uuid: crate::WRITE_CHAR_UUID,
            service_uuid: Uuid::nil(),
            properties: CharPropFlags::WRITE_WITHOUT_RESPONSE,
            descriptors: std::collections::BTreeSet::new(),
        };
        let notify = Characteristic {
            uuid: crate::NOTIFY_CHAR_UUID,
            service_uuid: Uuid::nil(),
            properties: CharPropFlags::NOTIFY | CharPropFlags::READ,
            descriptors: std::collections::BTreeSet::new(),
        };

        let write = characteristic_info(&write);
        assert!(write.can_write && !write.can_notify);
        let notify = characteristic_info(&notify);
        assert!(notify.can_notify && !notify.can_write);
    }

    #[test]
    fn test_gatt_failure_classification() {
        let auth = btleplug::Error::Other("Insufficient Authentication".into());
        assert_eq!(gatt_failure(&auth), TransportEvent::AuthenticationRequired);

        let other = btleplug::Error::NotConnected;
        assert!(matches!(
            gatt_failure(&other),
            TransportEvent::ServiceDiscoveryFailed(_)
        ));
    }
}
