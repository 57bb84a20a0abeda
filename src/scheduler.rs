//! Dead-man's-switch command scheduler.
//!
//! The scheduler holds the most recent command and decides, once per tick,
//! whether it goes on the air. A neutral (stop) command is repeated for a
//! bounded number of ticks after the last input edge so that a single lost
//! packet cannot leave the rig moving, then the scheduler falls silent until
//! the next edge. Commands that only act while they keep arriving (drive
//! deflections, actuator steps) are repeated for as long as they are held.
//! An auto actuator travel runs on its own once started, so it goes out as a
//! counted burst and is remembered until a stop cancels it.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::{
    config::LinkConfig,
    controls::stop_sequence,
    error::EncodeError,
    protocol::CommandFrame,
    types::ActuatorState,
};

/// Default number of neutral repeats after an input edge
pub const STOP_RESEND_COUNT: u8 = 10;

/// Remaining neutral repeats, bounded by `[0, limit]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitCounter {
    remaining: u8,
    limit: u8,
}

impl RetransmitCounter {
    /// Create an exhausted counter with the given limit
    #[must_use]
    pub const fn new(limit: u8) -> Self {
        Self {
            remaining: 0,
            limit,
        }
    }

    /// Refill to the limit
    pub fn reset(&mut self) {
        self.remaining = self.limit;
    }

    /// Consume one repeat, saturating at zero
    pub fn decrement(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    /// Repeats left
    #[must_use]
    pub const fn remaining(&self) -> u8 {
        self.remaining
    }

    /// Whether any repeats are left
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

impl Default for RetransmitCounter {
    fn default() -> Self {
        Self::new(STOP_RESEND_COUNT)
    }
}

/// How a held command is gated on each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Repeat while held, then for the counter's worth of ticks
    Counted,
    /// Transmit on every tick; the device is expected to stop on silence
    Always,
}

#[derive(Debug, Clone)]
struct HeldCommand {
    frame: CommandFrame,
    wire: Bytes,
    policy: SendPolicy,
}

/// Tick-driven holder of the current desired command
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    held: Option<HeldCommand>,
    one_shot: VecDeque<Bytes>,
    running_auto: Option<ActuatorState>,
    counter: RetransmitCounter,
    leveling_always_send: bool,
}

impl Default for CommandScheduler {
    fn default() -> Self {
        Self::new(&LinkConfig::default())
    }
}

impl CommandScheduler {
    /// Create a scheduler with nothing held
    #[must_use]
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            held: None,
            one_shot: VecDeque::new(),
            running_auto: None,
            counter: RetransmitCounter::new(config.stop_resend_count),
            leveling_always_send: config.leveling_always_send,
        }
    }

    /// Policy applied to `frame` when it is taken as input
    #[must_use]
    pub const fn policy_for(&self, frame: &CommandFrame) -> SendPolicy {
        match frame {
            CommandFrame::Leveling(_) if self.leveling_always_send => SendPolicy::Always,
            _ => SendPolicy::Counted,
        }
    }

    /// Record a user input edge (press, release, mode toggle)
    ///
    /// Replaces the held command and refills the resend counter. This is the
    /// only way the counter is raised.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if `frame` cannot be encoded. The previously
    /// held command and the counter are left untouched in that case.
    pub fn input_edge(&mut self, frame: CommandFrame) -> Result<(), EncodeError> {
        let wire = frame.encode()?;
        let policy = self.policy_for(&frame);
        debug!("Input edge: {:?} ({:?})", frame, policy);

        if let CommandFrame::Motion(command) = &frame {
            if command.actuator.is_auto() {
                self.running_auto = Some(command.actuator);
            }
        }
        self.held = Some(HeldCommand {
            frame,
            wire,
            policy,
        });
        self.counter.reset();
        Ok(())
    }

    /// Stop button: cancel a running auto travel, then hold a neutral stop
    ///
    /// The cancel frame, if any, goes out once on the next tick. The neutral
    /// stop then follows as an ordinary input edge with its full burst.
    ///
    /// # Errors
    ///
    /// Returns an [`EncodeError`] if a frame of the sequence cannot be
    /// encoded.
    pub fn stop(&mut self) -> Result<(), EncodeError> {
        let running = self.running_auto.take().unwrap_or_default();
        for command in stop_sequence(running) {
            if command.is_neutral() {
                self.input_edge(command.into())?;
            } else {
                debug!("Cancelling auto travel with {:?}", command);
                self.one_shot.push_back(command.encode()?);
            }
        }
        Ok(())
    }

    /// Decide what goes on the air for this tick
    ///
    /// Returns the encoded frame to transmit, or `None` when quiescent. A
    /// queued one-shot frame takes the tick without touching the counter.
    pub fn tick(&mut self) -> Option<Bytes> {
        if let Some(wire) = self.one_shot.pop_front() {
            return Some(wire);
        }

        let held = self.held.as_ref()?;

        if held.policy == SendPolicy::Always {
            return Some(held.wire.clone());
        }

        if held.frame.needs_hold() {
            return Some(held.wire.clone());
        }

        if self.counter.is_exhausted() {
            self.settle();
            return None;
        }

        self.counter.decrement();
        trace!("Counted repeat, {} left", self.counter.remaining());
        Some(held.wire.clone())
    }

    /// Once a burst is spent, an auto travel is no longer cancellable
    fn settle(&mut self) {
        let Some(held) = self.held.as_mut() else {
            return;
        };
        let CommandFrame::Motion(command) = held.frame else {
            return;
        };
        if !command.actuator.is_auto() {
            return;
        }

        let settled = command.settled();
        if let Ok(wire) = settled.encode() {
            debug!("Auto travel burst done, holding {:?}", settled);
            held.frame = settled.into();
            held.wire = wire;
            self.running_auto = None;
        }
    }

    /// Currently held command
    #[must_use]
    pub fn current(&self) -> Option<&CommandFrame> {
        self.held.as_ref().map(|held| &held.frame)
    }

    /// Resend counter state
    #[must_use]
    pub const fn counter(&self) -> RetransmitCounter {
        self.counter
    }

    /// Command a stop would cancel, if an auto travel is running
    #[must_use]
    pub const fn running_auto(&self) -> Option<ActuatorState> {
        self.running_auto
    }

    /// Drop the held command and go silent
    pub fn clear(&mut self) {
        self.held = None;
        self.one_shot.clear();
        self.running_auto = None;
        self.counter = RetransmitCounter::new(self.counter.limit);
    }
}
