#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # rvremote
//!
//! A Rust library for driving caravan movers (RVM) and self-leveling jack
//! systems (SAL) over Bluetooth Low Energy.
//!
//! Both device families expose one write characteristic (`0xABF1`) and one
//! notify characteristic (`0xABF2`). Commands are short fixed-size ASCII
//! frames, telemetry is either `;`-separated ASCII (`VOL:12.6;F0092;L-0015`)
//! or a 5-byte binary status frame.
//!
//! The crate is split into three layers:
//!
//! - **Wire codec** ([`protocol`]): frame encoders and telemetry decoders
//! - **Link state machine** ([`link`]): scanning, connecting, the pairing
//!   gate, characteristic resolution and timed reconnects
//! - **Command scheduler** ([`scheduler`]): a 200 ms tick that keeps
//!   re-sending the held command and repeats a stop command a fixed number of
//!   times after the last input (dead-man's switch)
//!
//! [`device::RemoteSession`] runs all three inside a single task and hands
//! out a cloneable [`device::SessionHandle`].
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library moves a vehicle and its jacks. The remote
//! unit must stop on its own when frames stop arriving; this crate only makes
//! sure a stop command is repeated, it cannot guarantee delivery.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rvremote::{
//!     ble::BleTransport,
//!     config::RemoteConfig,
//!     device::RemoteSession,
//!     link::LinkNotification,
//!     protocol::MotionCommand,
//!     types::{ActuatorState, LinkState},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RemoteConfig::default();
//!     let (transport, events) = BleTransport::new().await?;
//!     let (session, mut notifications) = RemoteSession::spawn(transport, events, &config);
//!
//!     session.start_scan()?;
//!     while let Some(notification) = notifications.recv().await {
//!         match notification {
//!             LinkNotification::DeviceDiscovered(device) => session.select_device(device)?,
//!             LinkNotification::StateChanged(LinkState::Ready) => break,
//!             _ => {}
//!         }
//!     }
//!
//!     // Drive forward while held, then release
//!     session.set_command(MotionCommand::new(3, 3, ActuatorState::Hold))?;
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     session.set_command(MotionCommand::stop())?;
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport backed by btleplug
pub mod ble;
/// Persisted configuration and link tunables
pub mod config;
/// Mover and leveler command derivation
pub mod controls;
/// Session actor and caller handle
pub mod device;
/// Error types and handling
pub mod error;
/// Connection lifecycle state machine
pub mod link;
/// Wire codec
pub mod protocol;
/// Dead-man's-switch command scheduler
pub mod scheduler;
/// Transport contract
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::{RemoteSession, SessionHandle};
pub use error::{EncodeError, ProtocolError, RemoteError, Result};
pub use link::{LinkEvent, LinkMachine, LinkNotification};
pub use protocol::{CommandFrame, LevelingCommand, ModeFrame, MotionCommand, TelemetryFrame};
pub use scheduler::{CommandScheduler, RetransmitCounter, SendPolicy};
pub use types::{
    ActuatorState, DeviceHandle, FailureReason, Leg, LinkState, StatusCode, StatusReport,
    TelemetrySnapshot,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 16-bit UUID of the command (write) characteristic
pub const WRITE_CHAR_SHORT_UUID: u16 = 0xABF1;

/// 16-bit UUID of the telemetry (notify) characteristic
pub const NOTIFY_CHAR_SHORT_UUID: u16 = 0xABF2;

/// Command characteristic, expanded onto the Bluetooth base UUID
pub const WRITE_CHAR_UUID: Uuid = expand_short_uuid(WRITE_CHAR_SHORT_UUID);

/// Telemetry characteristic, expanded onto the Bluetooth base UUID
pub const NOTIFY_CHAR_UUID: Uuid = expand_short_uuid(NOTIFY_CHAR_SHORT_UUID);

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

const fn expand_short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
