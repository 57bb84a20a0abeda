//! Transport contract between the link state machine and a radio stack.
//!
//! Calls on [`Transport`] only *request* work. Outcomes come back later as
//! [`TransportEvent`]s on the channel the transport was built with, so every
//! result is serialised through the session actor like any other event.

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::{error::Result, types::DeviceHandle};

/// Characteristic exposed by the connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Accepts writes (with or without response)
    pub can_write: bool,
    /// Supports notifications or indications
    pub can_notify: bool,
}

/// Asynchronous outcome reported by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device advertised during discovery
    Discovered(DeviceHandle),
    /// Connection to `address` established
    Connected {
        /// Address of the connected device
        address: String,
    },
    /// Connection to `address` failed
    ConnectFailed {
        /// Address of the device
        address: String,
        /// The peer reported that it removed the pairing information
        pairing_removed: bool,
        /// Human readable reason
        reason: String,
    },
    /// Link to `address` dropped
    Disconnected {
        /// Address of the device
        address: String,
        /// Human readable reason
        reason: String,
    },
    /// Service discovery finished
    ServicesResolved(Vec<CharacteristicInfo>),
    /// Service discovery failed
    ServiceDiscoveryFailed(String),
    /// A read or notify request hit an insufficient-authentication error
    AuthenticationRequired,
    /// Notification payload from the notify characteristic
    DataReceived(Bytes),
    /// The local adapter went away or was switched off
    AdapterUnavailable(String),
}

/// Radio operations the link state machine depends on
#[async_trait]
pub trait Transport: Send {
    /// Begin device discovery
    async fn start_discovery(&mut self) -> Result<()>;

    /// End device discovery
    async fn stop_discovery(&mut self) -> Result<()>;

    /// Start connecting to `device`, replacing any attempt in flight
    async fn connect(&mut self, device: &DeviceHandle) -> Result<()>;

    /// Tear down the current link or abandon the current attempt
    async fn disconnect(&mut self) -> Result<()>;

    /// Request service and characteristic discovery on the connected device
    async fn discover_services(&mut self) -> Result<()>;

    /// Subscribe to notifications from `characteristic`
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<()>;

    /// Fire-and-forget write to `characteristic`
    async fn write(&mut self, characteristic: Uuid, data: Bytes) -> Result<()>;
}
