use thiserror::Error;

/// Errors that can occur when driving a remote rig
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No usable Bluetooth adapter
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// Device not known to the transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// Required characteristic missing from the device's service table
    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    /// Wire protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Command encoding error
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The session task has shut down
    #[error("Remote session closed")]
    SessionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame-level decode failures
///
/// These never escape the link layer as failures. The offending frame is
/// dropped and, at most, logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is too short or a structural marker is wrong
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Structural markers are valid but the checksum does not match
    #[error("Checksum mismatch: expected {expected:02X}, got {actual:02X}")]
    ChecksumMismatch {
        /// Checksum computed from the frame contents
        expected: u8,
        /// Checksum carried by the frame
        actual: u8,
    },
}

/// Caller supplied a command value the wire format cannot represent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Numeric field outside its representable range
    #[error("{field} value {value} is out of range")]
    OutOfRange {
        /// Name of the offending field
        field: &'static str,
        /// Value supplied by the caller
        value: i16,
    },

    /// Byte field that is not one of the accepted ASCII codes
    #[error("{field} code {value:#04X} is not valid")]
    InvalidCode {
        /// Name of the offending field
        field: &'static str,
        /// Byte supplied by the caller
        value: u8,
    },
}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

impl RemoteError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::AdapterUnavailable
                | Self::ConnectionFailed(_)
                | Self::Disconnected(_)
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if this error is recoverable by the link's timed retry
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Disconnected(_) | Self::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = RemoteError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());

        let missing = RemoteError::DeviceNotFound("AA:BB:CC:DD:EE:FF".to_string());
        assert!(missing.is_connection_error());
        assert!(!missing.is_recoverable());

        let encode = RemoteError::from(EncodeError::OutOfRange {
            field: "left_deflection",
            value: 7,
        });
        assert!(!encode.is_connection_error());
        assert!(!encode.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = RemoteError::from(ProtocolError::ChecksumMismatch {
            expected: 0x44,
            actual: 0x45,
        });
        let error_string = format!("{error}");
        assert!(error_string.contains("Checksum mismatch"));
        assert!(error_string.contains("44"));

        let error = EncodeError::InvalidCode {
            field: "motion",
            value: b'X',
        };
        assert_eq!(format!("{error}"), "motion code 0x58 is not valid");
    }
}
