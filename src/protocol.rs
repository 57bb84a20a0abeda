use crate::{
    error::{EncodeError, ProtocolError},
    types::ActuatorState,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Digit sent for a centred deflection or a stopped actuator
pub const NEUTRAL_DIGIT: u8 = b'5';

/// Largest deflection magnitude the motion frame can carry
pub const MAX_DEFLECTION: i8 = 4;

/// Motion frame size in bytes (`L<d>R<d>A<a>\r\n`)
pub const MOTION_FRAME_SIZE: usize = 8;

/// Leveling frame size in bytes
pub const LEVELING_FRAME_SIZE: usize = 8;

/// Binary status frame size in bytes
pub const STATUS_FRAME_SIZE: usize = 5;

/// Start marker of the binary status frame and of the mode frame
pub const FRAME_START: u8 = b'$';

/// End marker of the binary status frame
pub const STATUS_FRAME_END: u8 = b'\n';

/// Mode frame payload when expert mode is enabled
pub const MODE_EXPERT: u8 = 0x34;

/// Mode frame payload when expert mode is disabled
pub const MODE_NORMAL: u8 = 0x30;

/// Leveling select code meaning "no leg selected"
pub const SELECT_NONE: u8 = b'0';

/// Leveling motion: raise
pub const MOTION_UP: u8 = b'U';

/// Leveling motion: lower
pub const MOTION_DOWN: u8 = b'D';

/// Leveling motion: stop and hold position
pub const MOTION_PAUSE: u8 = b'P';

/// Degrees per raw inclinometer count
pub const ANGLE_SCALE: f32 = 0.0054;

const VOLTAGE_PREFIX: &str = "VOL:";
const FRONT_BACK_PREFIX: char = 'F';
const LEFT_RIGHT_PREFIX: char = 'L';

/// Single-byte wrapping sum used by the leveling and status frames
///
/// Overflow is part of the format.
#[must_use]
pub const fn checksum(a: u8, b: u8) -> u8 {
    a.wrapping_add(b)
}

/// Mover drive command
///
/// Deflections run from -4 (full reverse) to 4 (full forward) about the
/// neutral midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MotionCommand {
    /// Left drive deflection
    pub left_deflection: i8,
    /// Right drive deflection
    pub right_deflection: i8,
    /// Actuator command
    pub actuator: ActuatorState,
}

impl MotionCommand {
    /// Create a motion command
    #[must_use]
    pub const fn new(left_deflection: i8, right_deflection: i8, actuator: ActuatorState) -> Self {
        Self {
            left_deflection,
            right_deflection,
            actuator,
        }
    }

    /// Both drives centred, actuator stopped
    #[must_use]
    pub const fn stop() -> Self {
        Self::new(0, 0, ActuatorState::Hold)
    }

    /// Whether every field holds its idle value
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        self.left_deflection == 0
            && self.right_deflection == 0
            && self.actuator == ActuatorState::Hold
    }

    /// Whether the command only has effect while it keeps arriving
    ///
    /// Drive deflections and actuator steps stop on silence. An auto
    /// actuator travel runs on its own once started, so it is sent as a
    /// bounded burst like a stop.
    #[must_use]
    pub const fn needs_hold(&self) -> bool {
        self.left_deflection != 0
            || self.right_deflection != 0
            || matches!(self.actuator, ActuatorState::LowerStep | ActuatorState::RaiseStep)
    }

    /// Same command with an auto actuator travel dropped back to hold
    #[must_use]
    pub const fn settled(self) -> Self {
        if self.actuator.is_auto() {
            Self::new(self.left_deflection, self.right_deflection, ActuatorState::Hold)
        } else {
            self
        }
    }

    /// Encode to `L<d>R<d>A<a>\r\n`
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfRange`] if a deflection lies outside `-4..=4`.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let left = deflection_digit("left_deflection", self.left_deflection)?;
        let right = deflection_digit("right_deflection", self.right_deflection)?;
        let actuator = deflection_digit("actuator", self.actuator.offset())?;

        let mut buf = BytesMut::with_capacity(MOTION_FRAME_SIZE);
        buf.put_u8(b'L');
        buf.put_u8(left);
        buf.put_u8(b'R');
        buf.put_u8(right);
        buf.put_u8(b'A');
        buf.put_u8(actuator);
        buf.put_slice(b"\r\n");
        Ok(buf.freeze())
    }

    /// Parse a motion frame
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the frame does not follow the
    /// `L<d>R<d>A<a>\r\n` layout or carries an unknown actuator digit.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != MOTION_FRAME_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "motion frame is {} bytes, expected {MOTION_FRAME_SIZE}",
                data.len()
            )));
        }
        if data[0] != b'L' || data[2] != b'R' || data[4] != b'A' || &data[6..] != b"\r\n" {
            return Err(ProtocolError::Malformed(format!(
                "motion frame markers invalid: {data:02X?}"
            )));
        }

        let actuator_offset = digit_offset(data[5])?;
        let actuator = ActuatorState::from_offset(actuator_offset).ok_or_else(|| {
            ProtocolError::Malformed(format!("unknown actuator digit {}", data[5] as char))
        })?;

        Ok(Self {
            left_deflection: digit_offset(data[1])?,
            right_deflection: digit_offset(data[3])?,
            actuator,
        })
    }
}

fn deflection_digit(field: &'static str, value: i8) -> Result<u8, EncodeError> {
    if !(-MAX_DEFLECTION..=MAX_DEFLECTION).contains(&value) {
        return Err(EncodeError::OutOfRange {
            field,
            value: i16::from(value),
        });
    }
    Ok(NEUTRAL_DIGIT.wrapping_add_signed(value))
}

fn digit_offset(digit: u8) -> Result<i8, ProtocolError> {
    if !(b'1'..=b'9').contains(&digit) {
        return Err(ProtocolError::Malformed(format!(
            "digit {digit:#04X} outside 1..9"
        )));
    }
    #[allow(clippy::cast_possible_wrap)]
    Ok(digit as i8 - NEUTRAL_DIGIT as i8)
}

/// Leveler jog command
///
/// `select` picks the leg or leg pair (`'0'`..=`'9'`), `motion` picks the
/// direction (`'U'`, `'D'` or `'P'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelingCommand {
    /// Leg select code
    pub select: u8,
    /// Motion code
    pub motion: u8,
}

impl Default for LevelingCommand {
    fn default() -> Self {
        Self::idle()
    }
}

impl LevelingCommand {
    /// Create a leveling command
    #[must_use]
    pub const fn new(select: u8, motion: u8) -> Self {
        Self { select, motion }
    }

    /// Nothing selected, paused
    #[must_use]
    pub const fn idle() -> Self {
        Self::new(SELECT_NONE, MOTION_PAUSE)
    }

    /// Whether every field holds its idle value
    #[must_use]
    pub const fn is_neutral(&self) -> bool {
        self.select == SELECT_NONE && self.motion == MOTION_PAUSE
    }

    /// Encode to the 8-byte `S?C?M<sum>\r\n` frame
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidCode`] if `select` is not an ASCII digit
    /// or `motion` is not one of `U`, `D`, `P`.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        self.validate()?;

        let mut buf = BytesMut::with_capacity(LEVELING_FRAME_SIZE);
        buf.put_u8(b'S');
        buf.put_u8(self.select);
        buf.put_u8(b'C');
        buf.put_u8(self.motion);
        buf.put_u8(b'M');
        buf.put_u8(checksum(self.select, self.motion));
        buf.put_u8(0x0D);
        buf.put_u8(0x0A);
        Ok(buf.freeze())
    }

    /// Parse and verify a leveling frame
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] on a length, marker or code error
    /// and [`ProtocolError::ChecksumMismatch`] if byte 5 does not match.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != LEVELING_FRAME_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "leveling frame is {} bytes, expected {LEVELING_FRAME_SIZE}",
                data.len()
            )));
        }
        if data[0] != b'S'
            || data[2] != b'C'
            || data[4] != b'M'
            || data[6] != 0x0D
            || data[7] != 0x0A
        {
            return Err(ProtocolError::Malformed(format!(
                "leveling frame markers invalid: {data:02X?}"
            )));
        }

        let expected = checksum(data[1], data[3]);
        if data[5] != expected {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: data[5],
            });
        }

        let command = Self::new(data[1], data[3]);
        command
            .validate()
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Ok(command)
    }

    fn validate(&self) -> Result<(), EncodeError> {
        if !self.select.is_ascii_digit() {
            return Err(EncodeError::InvalidCode {
                field: "select",
                value: self.select,
            });
        }
        if !matches!(self.motion, MOTION_UP | MOTION_DOWN | MOTION_PAUSE) {
            return Err(EncodeError::InvalidCode {
                field: "motion",
                value: self.motion,
            });
        }
        Ok(())
    }
}

/// Expert-mode toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFrame {
    /// Whether expert mode should be enabled
    pub expert_mode: bool,
}

impl ModeFrame {
    /// Encode to the 2-byte `$<mode>` frame
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mode = if self.expert_mode {
            MODE_EXPERT
        } else {
            MODE_NORMAL
        };
        Bytes::copy_from_slice(&[FRAME_START, mode])
    }
}

/// Any command the device accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFrame {
    /// Mover drive command
    Motion(MotionCommand),
    /// Leveler jog command
    Leveling(LevelingCommand),
    /// Expert-mode toggle
    Mode(ModeFrame),
}

impl CommandFrame {
    /// Encode to wire bytes
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if a field is outside its representable range.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        match self {
            Self::Motion(command) => command.encode(),
            Self::Leveling(command) => command.encode(),
            Self::Mode(frame) => Ok(frame.encode()),
        }
    }

    /// Whether the frame asks the device to do nothing
    ///
    /// Mode frames carry no motion and count as neutral.
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        match self {
            Self::Motion(command) => command.is_neutral(),
            Self::Leveling(command) => command.is_neutral(),
            Self::Mode(_) => true,
        }
    }

    /// Whether the frame must be repeated for as long as it is held
    #[must_use]
    pub fn needs_hold(&self) -> bool {
        match self {
            Self::Motion(command) => command.needs_hold(),
            Self::Leveling(command) => !command.is_neutral(),
            Self::Mode(_) => false,
        }
    }
}

impl From<MotionCommand> for CommandFrame {
    fn from(command: MotionCommand) -> Self {
        Self::Motion(command)
    }
}

impl From<LevelingCommand> for CommandFrame {
    fn from(command: LevelingCommand) -> Self {
        Self::Leveling(command)
    }
}

impl From<ModeFrame> for CommandFrame {
    fn from(frame: ModeFrame) -> Self {
        Self::Mode(frame)
    }
}

/// A single decoded telemetry item
///
/// ASCII telemetry may carry only one of the two angles, so each is optional.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryFrame {
    /// Supply voltage
    Voltage(f64),
    /// Inclination in degrees
    Angles {
        /// Front/back angle, if present in the frame
        front_back: Option<f32>,
        /// Left/right angle, if present in the frame
        left_right: Option<f32>,
    },
    /// Validated binary status frame
    StatusBinary {
        /// Status flag letter
        flag: u8,
        /// Per-leg action bitmask
        action_mask: u8,
    },
}

/// Decode a notification payload
///
/// Payloads starting with `$` that do not contain `VOL:` are binary status
/// frames; everything else is `;`-separated ASCII.
///
/// # Errors
///
/// Returns a [`ProtocolError`] if a binary status frame fails validation.
/// ASCII payloads never fail; unparseable segments are skipped.
pub fn decode_telemetry(data: &[u8]) -> Result<Vec<TelemetryFrame>, ProtocolError> {
    if is_binary_status(data) {
        decode_status(data).map(|frame| vec![frame])
    } else {
        Ok(decode_ascii(data))
    }
}

fn is_binary_status(data: &[u8]) -> bool {
    data.first() == Some(&FRAME_START)
        && !data
            .windows(VOLTAGE_PREFIX.len())
            .any(|window| window == VOLTAGE_PREFIX.as_bytes())
}

/// Decode `VOL:<v>;F<raw>;L<raw>` telemetry
///
/// Any subset of fields may be present, in any order. A field that fails to
/// parse is omitted.
#[must_use]
pub fn decode_ascii(data: &[u8]) -> Vec<TelemetryFrame> {
    let text = String::from_utf8_lossy(data);
    let mut voltage = None;
    let mut front_back = None;
    let mut left_right = None;

    for segment in text.split(';') {
        let segment = segment.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        if let Some(value) = segment.strip_prefix(VOLTAGE_PREFIX) {
            if let Ok(volts) = value.trim().parse::<f64>() {
                voltage = Some(volts);
            }
        } else if let Some(value) = segment.strip_prefix(FRONT_BACK_PREFIX) {
            if let Some(angle) = parse_angle(value) {
                front_back = Some(angle);
            }
        } else if let Some(value) = segment.strip_prefix(LEFT_RIGHT_PREFIX) {
            if let Some(angle) = parse_angle(value) {
                left_right = Some(angle);
            }
        }
    }

    let mut frames = Vec::with_capacity(2);
    if let Some(volts) = voltage {
        frames.push(TelemetryFrame::Voltage(volts));
    }
    if front_back.is_some() || left_right.is_some() {
        frames.push(TelemetryFrame::Angles {
            front_back,
            left_right,
        });
    }
    frames
}

#[allow(clippy::cast_precision_loss)]
fn parse_angle(raw: &str) -> Option<f32> {
    raw.trim()
        .parse::<i32>()
        .ok()
        .map(|counts| counts as f32 * ANGLE_SCALE)
}

/// Decode and verify the 5-byte binary status frame
///
/// Layout: `$`, flag, action mask, checksum, `\n`, where
/// checksum = flag + mask (wrapping).
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the frame is short or a marker is
/// wrong, and [`ProtocolError::ChecksumMismatch`] if the checksum fails.
pub fn decode_status(data: &[u8]) -> Result<TelemetryFrame, ProtocolError> {
    if data.len() < STATUS_FRAME_SIZE {
        return Err(ProtocolError::Malformed(format!(
            "status frame too short: {} bytes, expected {STATUS_FRAME_SIZE}",
            data.len()
        )));
    }
    if data[0] != FRAME_START || data[4] != STATUS_FRAME_END {
        return Err(ProtocolError::Malformed(format!(
            "status frame markers invalid: start {:02X}, end {:02X}",
            data[0], data[4]
        )));
    }

    let flag = data[1];
    let action_mask = data[2];
    let expected = checksum(flag, action_mask);
    if data[3] != expected {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            actual: data[3],
        });
    }

    Ok(TelemetryFrame::StatusBinary { flag, action_mask })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_encoding() {
        let bytes = MotionCommand::stop().encode().unwrap();
        assert_eq!(&bytes[..], b"L5R5A5\r\n");

        let bytes = MotionCommand::new(4, -4, ActuatorState::LowerAuto)
            .encode()
            .unwrap();
        assert_eq!(&bytes[..], b"L9R1A9\r\n");

        let bytes = MotionCommand::new(-2, 3, ActuatorState::RaiseStep)
            .encode()
            .unwrap();
        assert_eq!(&bytes[..], b"L3R8A2\r\n");
    }

    #[test]
    fn test_motion_out_of_range() {
        let err = MotionCommand::new(5, 0, ActuatorState::Hold)
            .encode()
            .unwrap_err();
        assert_eq!(
            err,
            EncodeError::OutOfRange {
                field: "left_deflection",
                value: 5
            }
        );

        let err = MotionCommand::new(0, -5, ActuatorState::Hold)
            .encode()
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::OutOfRange {
                field: "right_deflection",
                ..
            }
        ));
    }

    #[test]
    fn test_motion_round_trip_in_range() {
        let actuators = [
            ActuatorState::Hold,
            ActuatorState::LowerStep,
            ActuatorState::LowerAuto,
            ActuatorState::RaiseStep,
            ActuatorState::RaiseAuto,
        ];
        for left in -MAX_DEFLECTION..=MAX_DEFLECTION {
            for right in -MAX_DEFLECTION..=MAX_DEFLECTION {
                for actuator in actuators {
                    let command = MotionCommand::new(left, right, actuator);
                    let bytes = command.encode().unwrap();
                    assert_eq!(MotionCommand::decode(&bytes).unwrap(), command);
                }
            }
        }
    }

    #[test]
    fn test_motion_decode_rejects_garbage() {
        assert!(MotionCommand::decode(b"L5R5A5\r").is_err());
        assert!(MotionCommand::decode(b"X5R5A5\r\n").is_err());
        assert!(MotionCommand::decode(b"L0R5A5\r\n").is_err());
        // '6' is not a defined actuator offset
        assert!(MotionCommand::decode(b"L5R5A6\r\n").is_err());
    }

    #[test]
    fn test_leveling_frame_layout() {
        let bytes = LevelingCommand::new(b'8', MOTION_UP).encode().unwrap();
        assert_eq!(bytes.len(), LEVELING_FRAME_SIZE);
        assert_eq!(&bytes[..5], b"S8CUM");
        assert_eq!(bytes[5], b'8'.wrapping_add(b'U'));
        assert_eq!(&bytes[6..], &[0x0D, 0x0A]);
    }

    #[test]
    fn test_leveling_checksum_and_corruption() {
        for select in b'0'..=b'9' {
            for motion in [MOTION_UP, MOTION_DOWN, MOTION_PAUSE] {
                let command = LevelingCommand::new(select, motion);
                let bytes = command.encode().unwrap();
                assert_eq!(bytes[5], select.wrapping_add(motion));
                assert_eq!(LevelingCommand::decode(&bytes).unwrap(), command);

                for index in 0..6 {
                    let mut corrupted = bytes.to_vec();
                    corrupted[index] ^= 0x01;
                    assert!(
                        LevelingCommand::decode(&corrupted).is_err(),
                        "corruption at byte {index} accepted for {:?}",
                        bytes
                    );
                }
            }
        }
    }

    #[test]
    fn test_leveling_checksum_mismatch_classified() {
        let mut bytes = LevelingCommand::new(b'3', MOTION_DOWN)
            .encode()
            .unwrap()
            .to_vec();
        bytes[5] = bytes[5].wrapping_add(1);
        assert!(matches!(
            LevelingCommand::decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_leveling_invalid_codes() {
        assert_eq!(
            LevelingCommand::new(b'A', MOTION_UP).encode().unwrap_err(),
            EncodeError::InvalidCode {
                field: "select",
                value: b'A'
            }
        );
        assert_eq!(
            LevelingCommand::new(b'1', b'X').encode().unwrap_err(),
            EncodeError::InvalidCode {
                field: "motion",
                value: b'X'
            }
        );
    }

    #[test]
    fn test_mode_frame() {
        assert_eq!(
            &ModeFrame { expert_mode: true }.encode()[..],
            &[b'$', 0x34]
        );
        assert_eq!(
            &ModeFrame { expert_mode: false }.encode()[..],
            &[b'$', 0x30]
        );
    }

    #[test]
    fn test_neutrality() {
        assert!(CommandFrame::from(MotionCommand::stop()).is_neutral());
        assert!(!CommandFrame::from(MotionCommand::new(1, 0, ActuatorState::Hold)).is_neutral());
        assert!(
            !CommandFrame::from(MotionCommand::new(0, 0, ActuatorState::LowerStep)).is_neutral()
        );
        assert!(CommandFrame::from(LevelingCommand::idle()).is_neutral());

        let auto = MotionCommand::new(0, 0, ActuatorState::LowerAuto);
        assert!(!auto.is_neutral());
        assert!(!auto.needs_hold());
        assert_eq!(auto.settled(), MotionCommand::stop());
        assert!(MotionCommand::new(0, 0, ActuatorState::RaiseStep).needs_hold());
        let driving = MotionCommand::new(0, 2, ActuatorState::RaiseAuto);
        assert!(CommandFrame::from(driving).needs_hold());
        assert!(!CommandFrame::from(LevelingCommand::new(b'0', MOTION_UP)).is_neutral());
        assert!(!CommandFrame::from(LevelingCommand::new(b'4', MOTION_PAUSE)).is_neutral());
        assert!(CommandFrame::from(ModeFrame { expert_mode: true }).is_neutral());
    }

    #[test]
    fn test_ascii_telemetry_scenario() {
        let frames = decode_telemetry(b"VOL:11.5;F0092;L-0015").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], TelemetryFrame::Voltage(11.5));
        match frames[1] {
            TelemetryFrame::Angles {
                front_back: Some(fb),
                left_right: Some(lr),
            } => {
                assert!((fb - 0.4968).abs() < 1e-4);
                assert!((lr + 0.081).abs() < 1e-4);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_ascii_telemetry_partial_and_garbage() {
        let frames = decode_ascii(b"F-100\r\n");
        assert_eq!(
            frames,
            vec![TelemetryFrame::Angles {
                front_back: Some(-100.0 * ANGLE_SCALE),
                left_right: None,
            }]
        );

        // bad voltage is omitted, unknown segment ignored
        let frames = decode_ascii(b"VOL:abc;XYZ;L10");
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            TelemetryFrame::Angles {
                front_back: None,
                left_right: Some(_)
            }
        ));

        assert!(decode_ascii(b"").is_empty());
    }

    #[test]
    fn test_status_scenario() {
        let frame = decode_telemetry(&[0x24, 0x41, 0x03, 0x44, 0x0A]).unwrap();
        assert_eq!(
            frame,
            vec![TelemetryFrame::StatusBinary {
                flag: b'A',
                action_mask: 0x03
            }]
        );
    }

    #[test]
    fn test_status_checksum_wraps() {
        let flag = b'M';
        let mask = 0xF0;
        let sum = flag.wrapping_add(mask);
        assert!(decode_status(&[b'$', flag, mask, sum, b'\n']).is_ok());
    }

    #[test]
    fn test_status_rejections() {
        assert!(matches!(
            decode_status(&[0x24, 0x41, 0x03, 0x44]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_status(&[0x23, 0x41, 0x03, 0x44, 0x0A]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode_status(&[0x24, 0x41, 0x03, 0x44, 0x0D]),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            decode_status(&[0x24, 0x41, 0x03, 0x45, 0x0A]),
            Err(ProtocolError::ChecksumMismatch {
                expected: 0x44,
                actual: 0x45
            })
        );
        assert!(decode_telemetry(&[0x24, 0x41]).is_err());
    }
}
