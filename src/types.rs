use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

use crate::{controls::LevelerModel, protocol::TelemetryFrame};

/// A remote peer found during discovery
///
/// Handles are unique per address. The name is whatever the peer advertised
/// and may change between advertisements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Transport address, used as the identity of the peer
    pub address: String,
    /// Advertised display name
    pub name: String,
}

impl DeviceHandle {
    /// Create a new device handle
    #[must_use]
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Check whether this handle refers to the given address
    #[must_use]
    pub fn matches(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Why the link gave up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The peer removed its pairing information; the user must re-pair
    PairingRevoked,
    /// The transport itself is unusable (adapter off, discovery refused)
    Transport(String),
}

impl FailureReason {
    /// Whether recovery needs a trip to the system Bluetooth settings
    #[must_use]
    pub const fn requires_repairing(&self) -> bool {
        matches!(self, Self::PairingRevoked)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairingRevoked => write!(f, "Pairing Revoked"),
            Self::Transport(reason) => write!(f, "Transport Failure: {reason}"),
        }
    }
}

/// Link lifecycle state as observed by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Nothing happening
    Idle,
    /// Device discovery in progress
    Scanning,
    /// Connection attempt in flight or waiting to retry
    Connecting,
    /// Link is up but the bonding gate has not been passed yet
    AwaitingAuthentication,
    /// Connected, resolving the write/notify characteristics
    ResolvingServices,
    /// Commands can be sent
    Ready,
    /// Link closed, no retry scheduled
    Disconnected,
    /// Terminal failure
    Failed(FailureReason),
}

impl LinkState {
    /// Whether commands can be written in this state
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::AwaitingAuthentication => write!(f, "Awaiting Authentication"),
            Self::ResolvingServices => write!(f, "Resolving Services"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

/// Mover actuator (jockey wheel / stabiliser) command
///
/// Step variants move only while held; auto variants ask the unit to run the
/// full travel on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActuatorState {
    /// Actuator stopped
    #[default]
    Hold,
    /// Lower while held
    LowerStep,
    /// Lower to the end stop
    LowerAuto,
    /// Raise while held
    RaiseStep,
    /// Raise to the end stop
    RaiseAuto,
}

impl ActuatorState {
    /// Offset from the neutral digit on the 1..9 wire scale
    #[must_use]
    pub const fn offset(self) -> i8 {
        match self {
            Self::Hold => 0,
            Self::LowerStep => 3,
            Self::LowerAuto => 4,
            Self::RaiseStep => -3,
            Self::RaiseAuto => -4,
        }
    }

    /// Inverse of [`ActuatorState::offset`]
    #[must_use]
    pub const fn from_offset(offset: i8) -> Option<Self> {
        match offset {
            0 => Some(Self::Hold),
            3 => Some(Self::LowerStep),
            4 => Some(Self::LowerAuto),
            -3 => Some(Self::RaiseStep),
            -4 => Some(Self::RaiseAuto),
            _ => None,
        }
    }

    /// Whether the unit keeps travelling on its own after this command
    #[must_use]
    pub const fn is_auto(self) -> bool {
        matches!(self, Self::LowerAuto | Self::RaiseAuto)
    }

    /// Reverse step that halts a self-running travel
    ///
    /// A neutral actuator digit does not stop an auto travel; the unit only
    /// halts on a short step in the opposite direction.
    #[must_use]
    pub const fn cancel(self) -> Option<Self> {
        match self {
            Self::LowerAuto => Some(Self::RaiseStep),
            Self::RaiseAuto => Some(Self::LowerStep),
            _ => None,
        }
    }
}

impl fmt::Display for ActuatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hold => write!(f, "Hold"),
            Self::LowerStep => write!(f, "Lower"),
            Self::LowerAuto => write!(f, "Lower (auto)"),
            Self::RaiseStep => write!(f, "Raise"),
            Self::RaiseAuto => write!(f, "Raise (auto)"),
        }
    }
}

/// Leveler status reported in the binary status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Automatic leveling in progress
    AutoRunning,
    /// Automatic leveling aborted
    AutoFailed,
    /// Automatic leveling finished
    AutoComplete,
    /// Controller fault
    Fault,
    /// A leg reached its travel limit
    LimitHit,
    /// Legs moving under manual control
    Moving,
    /// Flag not recognised
    Unknown,
}

impl From<u8> for StatusCode {
    fn from(value: u8) -> Self {
        match value {
            b'A' => Self::AutoRunning,
            b'F' => Self::AutoFailed,
            b'C' => Self::AutoComplete,
            b'E' => Self::Fault,
            b'L' => Self::LimitHit,
            b'M' => Self::Moving,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoRunning => write!(f, "Auto Running"),
            Self::AutoFailed => write!(f, "Auto Failed"),
            Self::AutoComplete => write!(f, "Auto Complete"),
            Self::Fault => write!(f, "Fault"),
            Self::LimitHit => write!(f, "Limit Hit"),
            Self::Moving => write!(f, "Moving"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Leveler leg, in action-mask bit order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    /// Middle left
    MiddleLeft = 0,
    /// Middle right
    MiddleRight = 1,
    /// Front left
    FrontLeft = 2,
    /// Front right
    FrontRight = 3,
    /// Rear left
    RearLeft = 4,
    /// Rear right
    RearRight = 5,
}

impl Leg {
    /// All legs in bit order
    pub const ALL: [Self; 6] = [
        Self::MiddleLeft,
        Self::MiddleRight,
        Self::FrontLeft,
        Self::FrontRight,
        Self::RearLeft,
        Self::RearRight,
    ];

    /// Position in the action mask and in the single-leg select codes
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }
}

/// Decoded binary status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Raw status flag byte as received
    pub flag: u8,
    /// Semantic meaning of `flag`
    pub code: StatusCode,
    /// Raw per-leg action bitmask
    pub action_mask: u8,
}

impl StatusReport {
    /// Build a report from the raw frame fields
    #[must_use]
    pub fn new(flag: u8, action_mask: u8) -> Self {
        Self {
            flag,
            code: StatusCode::from(flag),
            action_mask,
        }
    }

    /// Whether the device reports `leg` as currently driven
    ///
    /// Reads the mask as sent, which is correct for rigs that address every
    /// pair directly. Use [`StatusReport::is_leg_active_for`] when the model
    /// is known.
    #[must_use]
    pub const fn is_leg_active(&self, leg: Leg) -> bool {
        self.action_mask & (1 << leg.index()) != 0
    }

    /// Whether `leg` is driven on a rig of the given model
    ///
    /// Middle-to-rear models report rear activity on the middle bits, so the
    /// low pair is folded onto the rear slots before testing.
    #[must_use]
    pub const fn is_leg_active_for(&self, leg: Leg, model: LevelerModel) -> bool {
        let mut mask = self.action_mask;
        if model.middle_to_rear() {
            mask |= mask << 4;
        }
        mask & (1 << leg.index()) != 0
    }
}

/// Last known telemetry values
///
/// Each decoded frame only overwrites the fields it carries; everything else
/// keeps its previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Supply voltage
    pub voltage: Option<f64>,
    /// Front/back inclination in degrees
    pub front_back: Option<f32>,
    /// Left/right inclination in degrees
    pub left_right: Option<f32>,
    /// Latest leveler status
    pub status: Option<StatusReport>,
    /// Time of the last applied update
    pub updated_at: Option<SystemTime>,
}

impl TelemetrySnapshot {
    /// Upsert a decoded frame into the snapshot
    pub fn apply(&mut self, frame: &TelemetryFrame) {
        match *frame {
            TelemetryFrame::Voltage(volts) => self.voltage = Some(volts),
            TelemetryFrame::Angles {
                front_back,
                left_right,
            } => {
                if front_back.is_some() {
                    self.front_back = front_back;
                }
                if left_right.is_some() {
                    self.left_right = left_right;
                }
            }
            TelemetryFrame::StatusBinary { flag, action_mask } => {
                self.status = Some(StatusReport::new(flag, action_mask));
            }
        }
        self.updated_at = Some(SystemTime::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_from_u8() {
        assert_eq!(StatusCode::from(b'A'), StatusCode::AutoRunning);
        assert_eq!(StatusCode::from(b'F'), StatusCode::AutoFailed);
        assert_eq!(StatusCode::from(b'C'), StatusCode::AutoComplete);
        assert_eq!(StatusCode::from(b'E'), StatusCode::Fault);
        assert_eq!(StatusCode::from(b'L'), StatusCode::LimitHit);
        assert_eq!(StatusCode::from(b'M'), StatusCode::Moving);
        assert_eq!(StatusCode::from(b'z'), StatusCode::Unknown);
    }

    #[test]
    fn test_actuator_offsets() {
        for state in [
            ActuatorState::Hold,
            ActuatorState::LowerStep,
            ActuatorState::LowerAuto,
            ActuatorState::RaiseStep,
            ActuatorState::RaiseAuto,
        ] {
            assert_eq!(ActuatorState::from_offset(state.offset()), Some(state));
        }
        assert_eq!(ActuatorState::from_offset(1), None);
    }

    #[test]
    fn test_leg_mask() {
        let report = StatusReport::new(b'M', 0b0001_0100);
        assert_eq!(report.code, StatusCode::Moving);
        assert!(report.is_leg_active(Leg::FrontLeft));
        assert!(report.is_leg_active(Leg::RearLeft));
        assert!(!report.is_leg_active(Leg::MiddleLeft));
        assert!(!report.is_leg_active(Leg::RearRight));
    }

    #[test]
    fn test_middle_to_rear_mask_folds_onto_rear() {
        let report = StatusReport::new(b'M', 0b0000_0001);
        assert!(!report.is_leg_active(Leg::RearLeft));
        assert!(!report.is_leg_active_for(Leg::RearLeft, LevelerModel::Standard));

        for model in [LevelerModel::Car, LevelerModel::Simple] {
            assert!(report.is_leg_active_for(Leg::RearLeft, model));
            assert!(!report.is_leg_active_for(Leg::RearRight, model));
        }

        let report = StatusReport::new(b'M', 0b0000_1110);
        assert!(report.is_leg_active_for(Leg::RearRight, LevelerModel::Car));
        assert!(report.is_leg_active_for(Leg::FrontLeft, LevelerModel::Car));
        assert!(!report.is_leg_active_for(Leg::RearLeft, LevelerModel::Car));
    }

    #[test]
    fn test_auto_actuator_cancel() {
        assert_eq!(ActuatorState::LowerAuto.cancel(), Some(ActuatorState::RaiseStep));
        assert_eq!(ActuatorState::RaiseAuto.cancel(), Some(ActuatorState::LowerStep));
        assert_eq!(ActuatorState::LowerStep.cancel(), None);
        assert_eq!(ActuatorState::Hold.cancel(), None);
        assert!(ActuatorState::RaiseAuto.is_auto());
        assert!(!ActuatorState::RaiseStep.is_auto());
    }

    #[test]
    fn test_snapshot_upsert_keeps_absent_fields() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.apply(&TelemetryFrame::Voltage(12.1));
        snapshot.apply(&TelemetryFrame::Angles {
            front_back: Some(1.0),
            left_right: None,
        });
        snapshot.apply(&TelemetryFrame::Angles {
            front_back: None,
            left_right: Some(-0.5),
        });

        assert_eq!(snapshot.voltage, Some(12.1));
        assert_eq!(snapshot.front_back, Some(1.0));
        assert_eq!(snapshot.left_right, Some(-0.5));
        assert!(snapshot.status.is_none());
        assert!(snapshot.updated_at.is_some());
    }

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Ready.to_string(), "Ready");
        assert!(LinkState::Ready.is_ready());
        assert!(!LinkState::AwaitingAuthentication.is_ready());
        assert_eq!(
            LinkState::Failed(FailureReason::PairingRevoked).to_string(),
            "Failed: Pairing Revoked"
        );
        assert!(FailureReason::PairingRevoked.requires_repairing());
        assert!(!FailureReason::Transport("off".into()).requires_repairing());
    }

    #[test]
    fn test_device_handle_matches() {
        let handle = DeviceHandle::new("aa:bb:cc:dd:ee:ff", "SAL-1");
        assert!(handle.matches("AA:BB:CC:DD:EE:FF"));
        assert!(!handle.matches("11:22:33:44:55:66"));
    }
}
