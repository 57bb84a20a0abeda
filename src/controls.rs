//! Turns control-surface state into device commands.
//!
//! The UI owns the buttons; these helpers only map "what is held" onto the
//! command values the wire codec understands.

use serde::Deserialize;

use crate::{
    error::EncodeError,
    protocol::{LevelingCommand, MotionCommand, SELECT_NONE},
    types::{ActuatorState, Leg},
};

/// Fastest mover speed step
pub const MAX_SPEED: u8 = 4;

/// Mover hardware variant
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MoverModel {
    /// Drive only
    #[default]
    Standard,
    /// Drive plus motorised actuator
    Actuator,
}

impl MoverModel {
    /// Whether actuator commands are meaningful for this model
    #[must_use]
    pub const fn has_actuator(self) -> bool {
        matches!(self, Self::Actuator)
    }
}

/// Leveler hardware variant
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LevelerModel {
    /// Front, middle and rear pairs
    #[default]
    Standard,
    /// Rear pair only, addressed through the middle codes
    Simple,
    /// Front and rear pairs, rear addressed through the middle codes
    Car,
    /// Front and rear pairs
    Basic,
}

impl LevelerModel {
    /// Whether the rear pair is addressed with the middle-pair codes
    #[must_use]
    pub const fn middle_to_rear(self) -> bool {
        matches!(self, Self::Simple | Self::Car)
    }

    /// Whether this model has `leg` fitted
    #[must_use]
    pub const fn has_leg(self, leg: Leg) -> bool {
        match leg {
            Leg::MiddleLeft | Leg::MiddleRight => matches!(self, Self::Standard),
            Leg::FrontLeft | Leg::FrontRight => !matches!(self, Self::Simple),
            Leg::RearLeft | Leg::RearRight => true,
        }
    }
}

/// Main drive button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Drive {
    /// No main button held
    #[default]
    None,
    /// Both wheels forward
    Forward,
    /// Both wheels back
    Back,
    /// Rotate clockwise on the spot
    TurnClockwise,
    /// Rotate counter-clockwise on the spot
    TurnCounterClockwise,
}

/// Per-side jog button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideJog {
    /// Released
    #[default]
    Idle,
    /// Forward button held
    Forward,
    /// Back button held
    Back,
}

/// Snapshot of the mover controls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoverInput {
    /// Main drive button
    pub drive: Drive,
    /// Left side jog
    pub left: SideJog,
    /// Right side jog
    pub right: SideJog,
    /// Speed step, 1..=4
    pub speed: u8,
    /// Actuator command
    pub actuator: ActuatorState,
}

impl Default for MoverInput {
    fn default() -> Self {
        Self {
            drive: Drive::None,
            left: SideJog::Idle,
            right: SideJog::Idle,
            speed: MAX_SPEED,
            actuator: ActuatorState::Hold,
        }
    }
}

impl MoverInput {
    /// Derive the motion command for the held buttons
    ///
    /// While driving forward or back, holding one side's matching jog button
    /// pins the other side to neutral so the rig pivots around it.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::OutOfRange`] if `speed` is not in `1..=4`.
    pub fn to_command(&self, model: MoverModel) -> Result<MotionCommand, EncodeError> {
        if !(1..=MAX_SPEED).contains(&self.speed) {
            return Err(EncodeError::OutOfRange {
                field: "speed",
                value: i16::from(self.speed),
            });
        }
        #[allow(clippy::cast_possible_wrap)]
        let s = self.speed as i8;

        let (left, right) = match self.drive {
            Drive::TurnClockwise => (s, -s),
            Drive::TurnCounterClockwise => (-s, s),
            Drive::Forward => (
                if self.right == SideJog::Forward { 0 } else { s },
                if self.left == SideJog::Forward { 0 } else { s },
            ),
            Drive::Back => (
                if self.right == SideJog::Back { 0 } else { -s },
                if self.left == SideJog::Back { 0 } else { -s },
            ),
            Drive::None => (jog(self.left, s), jog(self.right, s)),
        };

        let actuator = if model.has_actuator() {
            self.actuator
        } else {
            ActuatorState::Hold
        };

        Ok(MotionCommand::new(left, right, actuator))
    }
}

const fn jog(side: SideJog, speed: i8) -> i8 {
    match side {
        SideJog::Idle => 0,
        SideJog::Forward => speed,
        SideJog::Back => -speed,
    }
}

/// Actuator command for a button press
#[must_use]
pub const fn actuator_for_press(lower: bool, auto: bool) -> ActuatorState {
    match (lower, auto) {
        (true, false) => ActuatorState::LowerStep,
        (true, true) => ActuatorState::LowerAuto,
        (false, false) => ActuatorState::RaiseStep,
        (false, true) => ActuatorState::RaiseAuto,
    }
}

/// Frames to send when the stop button is pressed
///
/// `running` is the actuator command last sent. An auto travel is halted by
/// a reverse step first, so that frame leads; the neutral stop is always
/// last.
#[must_use]
pub fn stop_sequence(running: ActuatorState) -> Vec<MotionCommand> {
    running
        .cancel()
        .map(|cancel| MotionCommand::new(0, 0, cancel))
        .into_iter()
        .chain([MotionCommand::stop()])
        .collect()
}

/// Leveler legs currently selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegSelection {
    mask: u8,
}

impl LegSelection {
    /// Nothing selected
    #[must_use]
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    /// Whether `leg` is selected
    #[must_use]
    pub const fn contains(&self, leg: Leg) -> bool {
        self.mask & (1 << leg.index()) != 0
    }

    /// Whether no leg is selected
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Clear the selection
    pub fn clear(&mut self) {
        self.mask = 0;
    }

    /// Handle a tap on `leg`
    ///
    /// Selecting a leg drops every selection outside its pair. Inside the pair
    /// a tap deselects only when both legs are already selected; otherwise it
    /// adds the leg, so tapping both legs of a pair selects the pair.
    pub fn toggle(&mut self, leg: Leg, model: LevelerModel) {
        if !model.has_leg(leg) {
            return;
        }
        let partner = pair_partner(leg);
        let keep = (1 << leg.index()) | (1 << partner.index());
        self.mask &= keep;

        if self.contains(partner) && self.contains(leg) {
            self.mask &= !(1 << leg.index());
        } else {
            self.mask |= 1 << leg.index();
        }
    }

    /// Select code for the current selection
    #[must_use]
    pub fn select_code(&self, model: LevelerModel) -> u8 {
        let pair = |a: Leg, b: Leg| self.contains(a) && self.contains(b);

        if pair(Leg::FrontLeft, Leg::FrontRight) {
            return b'8';
        }
        if pair(Leg::MiddleLeft, Leg::MiddleRight) {
            return b'7';
        }
        if pair(Leg::RearLeft, Leg::RearRight) {
            return if model.middle_to_rear() { b'7' } else { b'9' };
        }

        Leg::ALL
            .iter()
            .find(|leg| self.contains(**leg))
            .map_or(SELECT_NONE, |leg| {
                let index = leg.index();
                if model.middle_to_rear() && index > 3 {
                    b'1' + index % 2
                } else {
                    b'1' + index
                }
            })
    }

    /// Leveling command for this selection and a motion code
    #[must_use]
    pub fn command(&self, model: LevelerModel, motion: u8) -> LevelingCommand {
        LevelingCommand::new(self.select_code(model), motion)
    }
}

const fn pair_partner(leg: Leg) -> Leg {
    match leg {
        Leg::MiddleLeft => Leg::MiddleRight,
        Leg::MiddleRight => Leg::MiddleLeft,
        Leg::FrontLeft => Leg::FrontRight,
        Leg::FrontRight => Leg::FrontLeft,
        Leg::RearLeft => Leg::RearRight,
        Leg::RearRight => Leg::RearLeft,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MOTION_PAUSE, MOTION_UP};

    fn input(drive: Drive, left: SideJog, right: SideJog, speed: u8) -> MoverInput {
        MoverInput {
            drive,
            left,
            right,
            speed,
            actuator: ActuatorState::Hold,
        }
    }

    #[test]
    fn test_drive_directions() {
        let cmd = |i: MoverInput| {
            let c = i.to_command(MoverModel::Standard).unwrap();
            (c.left_deflection, c.right_deflection)
        };

        assert_eq!(cmd(input(Drive::None, SideJog::Idle, SideJog::Idle, 4)), (0, 0));
        assert_eq!(cmd(input(Drive::TurnClockwise, SideJog::Idle, SideJog::Idle, 4)), (4, -4));
        assert_eq!(
            cmd(input(Drive::TurnCounterClockwise, SideJog::Idle, SideJog::Idle, 2)),
            (-2, 2)
        );
        assert_eq!(cmd(input(Drive::Forward, SideJog::Idle, SideJog::Idle, 3)), (3, 3));
        assert_eq!(cmd(input(Drive::Back, SideJog::Idle, SideJog::Idle, 1)), (-1, -1));
        assert_eq!(cmd(input(Drive::None, SideJog::Forward, SideJog::Back, 2)), (2, -2));
    }

    #[test]
    fn test_forward_pivot() {
        let c = input(Drive::Forward, SideJog::Forward, SideJog::Idle, 4)
            .to_command(MoverModel::Standard)
            .unwrap();
        assert_eq!((c.left_deflection, c.right_deflection), (4, 0));

        let c = input(Drive::Back, SideJog::Idle, SideJog::Back, 4)
            .to_command(MoverModel::Standard)
            .unwrap();
        assert_eq!((c.left_deflection, c.right_deflection), (0, -4));
    }

    #[test]
    fn test_speed_out_of_range() {
        let err = input(Drive::Forward, SideJog::Idle, SideJog::Idle, 5)
            .to_command(MoverModel::Standard)
            .unwrap_err();
        assert!(matches!(err, EncodeError::OutOfRange { field: "speed", .. }));
        assert!(input(Drive::None, SideJog::Idle, SideJog::Idle, 0)
            .to_command(MoverModel::Standard)
            .is_err());
    }

    #[test]
    fn test_actuator_requires_model() {
        let mut mover = MoverInput::default();
        mover.actuator = actuator_for_press(true, true);

        let c = mover.to_command(MoverModel::Actuator).unwrap();
        assert_eq!(c.actuator, ActuatorState::LowerAuto);
        assert_eq!(&c.encode().unwrap()[..], b"L5R5A9\r\n");

        let c = mover.to_command(MoverModel::Standard).unwrap();
        assert_eq!(c.actuator, ActuatorState::Hold);
    }

    #[test]
    fn test_stop_sequence_cancels_auto_travel() {
        let frames = |running| -> Vec<Vec<u8>> {
            stop_sequence(running)
                .iter()
                .map(|c| c.encode().unwrap().to_vec())
                .collect()
        };

        assert_eq!(
            frames(ActuatorState::LowerAuto),
            vec![b"L5R5A2\r\n".to_vec(), b"L5R5A5\r\n".to_vec()]
        );
        assert_eq!(
            frames(ActuatorState::RaiseAuto),
            vec![b"L5R5A8\r\n".to_vec(), b"L5R5A5\r\n".to_vec()]
        );
        assert_eq!(frames(ActuatorState::LowerStep), vec![b"L5R5A5\r\n".to_vec()]);
        assert_eq!(stop_sequence(ActuatorState::Hold), vec![MotionCommand::stop()]);
    }

    #[test]
    fn test_select_codes_standard() {
        let model = LevelerModel::Standard;
        let mut selection = LegSelection::empty();
        assert_eq!(selection.select_code(model), b'0');

        selection.toggle(Leg::FrontLeft, model);
        assert_eq!(selection.select_code(model), b'3');
        selection.toggle(Leg::FrontRight, model);
        assert_eq!(selection.select_code(model), b'8');

        selection.toggle(Leg::RearRight, model);
        assert!(!selection.contains(Leg::FrontLeft));
        assert_eq!(selection.select_code(model), b'6');
        selection.toggle(Leg::RearLeft, model);
        assert_eq!(selection.select_code(model), b'9');

        selection.toggle(Leg::MiddleRight, model);
        assert_eq!(selection.select_code(model), b'2');
        selection.toggle(Leg::MiddleLeft, model);
        assert_eq!(selection.select_code(model), b'7');
    }

    #[test]
    fn test_toggle_deselects_only_from_pair() {
        let model = LevelerModel::Standard;
        let mut selection = LegSelection::empty();

        selection.toggle(Leg::RearLeft, model);
        // a single selected leg stays selected on a repeated tap
        selection.toggle(Leg::RearLeft, model);
        assert!(selection.contains(Leg::RearLeft));

        selection.toggle(Leg::RearRight, model);
        selection.toggle(Leg::RearLeft, model);
        assert!(!selection.contains(Leg::RearLeft));
        assert!(selection.contains(Leg::RearRight));
    }

    #[test]
    fn test_select_codes_middle_to_rear() {
        let model = LevelerModel::Car;
        let mut selection = LegSelection::empty();

        selection.toggle(Leg::MiddleLeft, model);
        assert!(selection.is_empty());

        selection.toggle(Leg::RearLeft, model);
        assert_eq!(selection.select_code(model), b'1');
        selection.toggle(Leg::RearRight, model);
        assert_eq!(selection.select_code(model), b'7');

        let command = selection.command(model, MOTION_UP);
        assert_eq!(command, LevelingCommand::new(b'7', MOTION_UP));

        selection.clear();
        selection.toggle(Leg::RearRight, model);
        assert_eq!(selection.command(model, MOTION_PAUSE).select, b'2');
    }

    #[test]
    fn test_simple_model_has_rear_only() {
        let model = LevelerModel::Simple;
        let mut selection = LegSelection::empty();
        selection.toggle(Leg::FrontLeft, model);
        assert!(selection.is_empty());
        assert!(model.has_leg(Leg::RearLeft));
    }
}
