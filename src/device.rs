use tokio::{
    sync::{mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use std::time::Duration;

use crate::{
    config::RemoteConfig,
    error::{RemoteError, Result},
    link::{LinkEvent, LinkMachine, LinkNotification},
    protocol::CommandFrame,
    scheduler::CommandScheduler,
    transport::{Transport, TransportEvent},
    types::DeviceHandle,
};

enum Request {
    Link(LinkEvent),
    Command(CommandFrame),
    Stop,
    ClearCommand,
    Shutdown(oneshot::Sender<()>),
}

/// Session actor owning the link state machine and the command scheduler
///
/// `RemoteSession` runs on its own task and is the only place link state and
/// the resend counter are mutated. Transport events, expired timers, caller
/// requests and the scheduler tick are all taken from one `select!` loop, so
/// a tick-driven write can never run against a link that is halfway through
/// being torn down.
///
/// Callers talk to the session through a [`SessionHandle`] and observe it
/// through the [`LinkNotification`] receiver returned by
/// [`RemoteSession::spawn`].
///
/// # Examples
///
/// ```no_run
/// use rvremote::{
///     ble::BleTransport,
///     config::RemoteConfig,
///     device::RemoteSession,
///     protocol::LevelingCommand,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = RemoteConfig::load("rvremote.toml")?;
///     let (transport, events) = BleTransport::new().await?;
///     let (session, _notifications) = RemoteSession::spawn(transport, events, &config);
///
///     session.start_scan()?;
///     // ... select a device once it shows up ...
///     session.set_command(LevelingCommand::new(b'8', b'U'))?;
///     Ok(())
/// }
/// ```
pub struct RemoteSession<T> {
    link: LinkMachine<T>,
    scheduler: CommandScheduler,
    tick_interval: Duration,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    timer_events: mpsc::UnboundedReceiver<LinkEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl<T: Transport + 'static> RemoteSession<T> {
    /// Start a session on the current runtime
    ///
    /// `events` must be the receiver the transport reports its outcomes on.
    /// If auto-connect is enabled in `config`, the remembered device is
    /// connected to as soon as a scan discovers it.
    ///
    /// Returns the caller handle and the notification stream. The session
    /// runs until [`SessionHandle::shutdown`] is called or every handle is
    /// dropped.
    pub fn spawn(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: &RemoteConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<LinkNotification>) {
        let (notify_tx, notifications) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();

        let (link, timer_events) = LinkMachine::new(
            transport,
            &config.link,
            config.auto_connect().map(str::to_string),
            notify_tx,
        );

        let session = Self {
            link,
            scheduler: CommandScheduler::new(&config.link),
            tick_interval: config.link.tick_interval(),
            transport_events: events,
            timer_events,
            requests,
        };
        tokio::spawn(session.run());

        (
            SessionHandle {
                requests: requests_tx,
            },
            notifications,
        )
    }

    async fn run(mut self) {
        info!("Session started, tick every {:?}", self.tick_interval);

        let mut tick = interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let ack = loop {
            tokio::select! {
                Some(event) = self.transport_events.recv() => {
                    self.link.handle(event.into()).await;
                }
                Some(event) = self.timer_events.recv() => {
                    self.link.handle(event).await;
                }
                request = self.requests.recv() => match request {
                    Some(Request::Link(event)) => self.link.handle(event).await,
                    Some(Request::Command(frame)) => {
                        if let Err(e) = self.scheduler.input_edge(frame) {
                            warn!("Rejected command: {}", e);
                        }
                    }
                    Some(Request::Stop) => {
                        if let Err(e) = self.scheduler.stop() {
                            warn!("Stop sequence failed: {}", e);
                        }
                    }
                    Some(Request::ClearCommand) => self.scheduler.clear(),
                    Some(Request::Shutdown(ack)) => break Some(ack),
                    None => break None,
                },
                _ = tick.tick() => {
                    if let Some(frame) = self.scheduler.tick() {
                        self.link.send(frame).await;
                    }
                }
            }
        };

        debug!("Session stopping");
        self.link.handle(LinkEvent::Disconnect).await;
        drop(self);
        info!("Session stopped");

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

/// Cloneable caller-side handle to a [`RemoteSession`]
///
/// Every method only queues a request; outcomes arrive as
/// [`LinkNotification`]s.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Link(event) => f.debug_tuple("Link").field(event).finish(),
            Self::Command(frame) => f.debug_tuple("Command").field(frame).finish(),
            Self::Stop => f.write_str("Stop"),
            Self::ClearCommand => f.write_str("ClearCommand"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl SessionHandle {
    /// Begin scanning for devices
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn start_scan(&self) -> Result<()> {
        self.request(Request::Link(LinkEvent::StartScan))
    }

    /// Connect to `device`, replacing any current target
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn select_device(&self, device: DeviceHandle) -> Result<()> {
        self.request(Request::Link(LinkEvent::SelectDevice(device)))
    }

    /// Close the link and cancel any pending reconnect
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn disconnect(&self) -> Result<()> {
        self.request(Request::Link(LinkEvent::Disconnect))
    }

    /// Replace the held command (an input edge)
    ///
    /// The frame is encoded here first, so an out-of-range value is reported
    /// to the caller and never reaches the scheduler. Every call refills the
    /// stop resend counter, including a call with the same frame.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Encode`] if the frame cannot be encoded, or
    /// [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn set_command(&self, frame: impl Into<CommandFrame>) -> Result<()> {
        let frame = frame.into();
        frame.encode()?;
        self.request(Request::Command(frame))
    }

    /// Press the stop button
    ///
    /// Halts a running auto actuator travel with a reverse step, then holds
    /// a neutral stop with its full resend burst.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn stop(&self) -> Result<()> {
        self.request(Request::Stop)
    }

    /// Drop the held command without sending a stop burst
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::SessionClosed`] if the session has stopped.
    pub fn clear_command(&self) -> Result<()> {
        self.request(Request::ClearCommand)
    }

    /// Whether the session task has stopped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Disconnect and stop the session, waiting for it to finish
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.request(Request::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| RemoteError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{LevelingCommand, MotionCommand},
        transport::{
            mocks::{MockTransport, TransportCall},
            CharacteristicInfo,
        },
        types::{ActuatorState, LinkState},
        NOTIFY_CHAR_UUID, WRITE_CHAR_UUID,
    };
    use bytes::Bytes;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    const ADDRESS: &str = "C8:2E:18:00:11:22";

    struct Harness {
        session: SessionHandle,
        transport: MockTransport,
        events: mpsc::UnboundedSender<TransportEvent>,
        notifications: mpsc::UnboundedReceiver<LinkNotification>,
    }

    impl Harness {
        fn new() -> Self {
            let transport = MockTransport::new();
            let (events, events_rx) = mpsc::unbounded_channel();
            let (session, notifications) =
                RemoteSession::spawn(transport.clone(), events_rx, &RemoteConfig::default());
            Self {
                session,
                transport,
                events,
                notifications,
            }
        }

        async fn wait_for(&mut self, state: LinkState) {
            while let Some(notification) = self.notifications.recv().await {
                if notification == LinkNotification::StateChanged(state.clone()) {
                    return;
                }
            }
            panic!("session closed before reaching {state}");
        }

        async fn connect(&mut self) {
            self.session
                .select_device(DeviceHandle::new(ADDRESS, "RVM-2000"))
                .unwrap();
            self.wait_for(LinkState::Connecting).await;

            self.events
                .send(TransportEvent::Connected {
                    address: ADDRESS.to_string(),
                })
                .unwrap();
            self.wait_for(LinkState::ResolvingServices).await;

            self.events
                .send(TransportEvent::ServicesResolved(vec![
                    CharacteristicInfo {
                        uuid: WRITE_CHAR_UUID,
                        can_write: true,
                        can_notify: false,
                    },
                    CharacteristicInfo {
                        uuid: NOTIFY_CHAR_UUID,
                        can_write: false,
                        can_notify: true,
                    },
                ]))
                .unwrap();
            self.wait_for(LinkState::Ready).await;
            self.transport.clear();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_sent_exactly_ten_times() {
        let mut h = Harness::new();
        h.connect().await;

        h.session.set_command(MotionCommand::stop()).unwrap();
        sleep(Duration::from_secs(5)).await;

        let writes = h.transport.writes();
        assert_eq!(writes.len(), 10);
        assert!(writes
            .iter()
            .all(|frame| frame == &Bytes::from_static(b"L5R5A5\r\n")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_drive_repeats_until_released() {
        let mut h = Harness::new();
        h.connect().await;

        h.session
            .set_command(MotionCommand::new(4, 4, ActuatorState::Hold))
            .unwrap();
        sleep(Duration::from_secs(4)).await;
        let held = h.transport.writes().len();
        assert!((19..=21).contains(&held), "{held} writes while held");

        h.session.set_command(MotionCommand::stop()).unwrap();
        sleep(Duration::from_secs(4)).await;
        let stops = h
            .transport
            .writes()
            .iter()
            .filter(|frame| frame.as_ref() == b"L5R5A5\r\n")
            .count();
        assert_eq!(stops, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_auto_lower() {
        let mut h = Harness::new();
        h.connect().await;

        h.session
            .set_command(MotionCommand::new(0, 0, ActuatorState::LowerAuto))
            .unwrap();
        sleep(Duration::from_millis(900)).await;
        h.session.stop().unwrap();
        sleep(Duration::from_secs(4)).await;

        let writes = h.transport.writes();
        let cancel = writes
            .iter()
            .position(|frame| frame.as_ref() == b"L5R5A2\r\n")
            .expect("cancel frame sent");
        assert!(writes[..cancel]
            .iter()
            .all(|frame| frame.as_ref() == b"L5R5A9\r\n"));
        assert_eq!(writes.len() - cancel - 1, 10);
        assert!(writes[cancel + 1..]
            .iter()
            .all(|frame| frame.as_ref() == b"L5R5A5\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leveling_sends_every_tick() {
        let mut h = Harness::new();
        h.connect().await;

        h.session.set_command(LevelingCommand::idle()).unwrap();
        sleep(Duration::from_secs(4)).await;
        let sent = h.transport.writes().len();
        assert!((19..=21).contains(&sent), "{sent} leveling writes");

        h.session.clear_command().unwrap();
        sleep(Duration::from_millis(100)).await;
        h.transport.clear();
        sleep(Duration::from_secs(2)).await;
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_runs_down_while_not_ready() {
        let mut h = Harness::new();
        h.session.set_command(MotionCommand::stop()).unwrap();
        sleep(Duration::from_secs(3)).await;

        h.connect().await;
        sleep(Duration::from_secs(3)).await;
        assert!(h.transport.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_command_is_rejected() {
        let h = Harness::new();
        let err = assert_err!(h
            .session
            .set_command(MotionCommand::new(0, -7, ActuatorState::Hold)));
        assert!(matches!(err, RemoteError::Encode(_)));
        assert_ok!(h.session.set_command(MotionCommand::new(0, -4, ActuatorState::Hold)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_writes() {
        let mut h = Harness::new();
        h.connect().await;

        h.session
            .set_command(MotionCommand::new(2, 2, ActuatorState::Hold))
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        h.session.disconnect().unwrap();
        h.wait_for(LinkState::Disconnected).await;
        h.transport.clear();

        sleep(Duration::from_secs(5)).await;
        assert!(h.transport.writes().is_empty());
        assert_eq!(h.transport.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_session() {
        let mut h = Harness::new();
        h.connect().await;

        h.session.shutdown().await;
        assert!(h.session.is_closed());
        assert!(h.transport.calls().contains(&TransportCall::Disconnect));
        let err = assert_err!(h.session.start_scan());
        assert!(matches!(err, RemoteError::SessionClosed));
    }
}
