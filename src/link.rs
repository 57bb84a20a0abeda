//! Link state machine.
//!
//! [`LinkMachine`] owns the connection lifecycle to a single remote device.
//! Every input, whether a caller request, a transport outcome or an expired
//! timer, enters through [`LinkMachine::handle`]. State changes, discoveries,
//! telemetry and terminal failures leave through a [`LinkNotification`]
//! channel.
//!
//! Timers (reconnect backoff, bonding re-check, scan timeout) run as spawned tasks that post a
//! [`LinkEvent`] back to the machine's timer channel. Each timer is owned by
//! the phase that armed it, so leaving that phase aborts the task, and every
//! timer event carries an id so a late delivery is recognised and ignored.

use bytes::Bytes;
use std::{fmt, mem, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::LinkConfig,
    protocol::decode_telemetry,
    transport::{CharacteristicInfo, Transport, TransportEvent},
    types::{DeviceHandle, FailureReason, LinkState, TelemetrySnapshot},
    NOTIFY_CHAR_UUID, WRITE_CHAR_UUID,
};

/// Identifies one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// Input to the link state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Caller asked to start device discovery
    StartScan,
    /// Caller picked a device to connect to
    SelectDevice(DeviceHandle),
    /// Caller asked to close the link
    Disconnect,
    /// Outcome reported by the transport
    Transport(TransportEvent),
    /// Reconnect backoff or bonding re-check expired
    RetryElapsed(TimerId),
    /// Scan session expired
    ScanElapsed(TimerId),
}

impl From<TransportEvent> for LinkEvent {
    fn from(event: TransportEvent) -> Self {
        Self::Transport(event)
    }
}

/// Output of the link state machine
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotification {
    /// The observable link state changed
    StateChanged(LinkState),
    /// A device address was seen for the first time in this scan session
    DeviceDiscovered(DeviceHandle),
    /// Telemetry snapshot after applying newly decoded frames
    Telemetry(TelemetrySnapshot),
    /// The link entered a terminal failure
    Failure {
        /// Device involved, if any
        device: Option<DeviceHandle>,
        /// Why the link gave up
        reason: FailureReason,
        /// The remembered auto-connect address was dropped
        auto_connect_cleared: bool,
    },
}

/// Armed timer; aborts its task when dropped
#[derive(Debug)]
struct TimerGuard {
    id: TimerId,
    task: JoinHandle<()>,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
enum Attempt {
    /// Transport is working on a connect request
    InFlight,
    /// Waiting out the reconnect delay
    Backoff(TimerGuard),
}

#[derive(Debug)]
enum Phase {
    Idle,
    Scanning {
        timer: TimerGuard,
    },
    Connecting {
        target: DeviceHandle,
        attempt: Attempt,
    },
    AwaitingAuthentication {
        target: DeviceHandle,
        recheck: TimerGuard,
    },
    ResolvingServices {
        target: DeviceHandle,
    },
    Ready {
        target: DeviceHandle,
        write: Uuid,
    },
    Disconnected,
    Failed(FailureReason),
}

impl Phase {
    fn state(&self) -> LinkState {
        match self {
            Self::Idle => LinkState::Idle,
            Self::Scanning { .. } => LinkState::Scanning,
            Self::Connecting { .. } => LinkState::Connecting,
            Self::AwaitingAuthentication { .. } => LinkState::AwaitingAuthentication,
            Self::ResolvingServices { .. } => LinkState::ResolvingServices,
            Self::Ready { .. } => LinkState::Ready,
            Self::Disconnected => LinkState::Disconnected,
            Self::Failed(reason) => LinkState::Failed(reason.clone()),
        }
    }

    fn target(&self) -> Option<&DeviceHandle> {
        match self {
            Self::Connecting { target, .. }
            | Self::AwaitingAuthentication { target, .. }
            | Self::ResolvingServices { target }
            | Self::Ready { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Whether the transport holds a link or an attempt that must be torn down
    const fn has_transport_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting {
                attempt: Attempt::InFlight,
                ..
            } | Self::AwaitingAuthentication { .. }
                | Self::ResolvingServices { .. }
                | Self::Ready { .. }
        )
    }
}

/// Connection lifecycle for one remote device
pub struct LinkMachine<T> {
    transport: T,
    phase: Phase,
    reconnect_delay: Duration,
    scan_timeout: Duration,
    auto_connect: Option<String>,
    discovered: Vec<DeviceHandle>,
    telemetry: TelemetrySnapshot,
    next_timer: u64,
    timers: mpsc::UnboundedSender<LinkEvent>,
    notifications: mpsc::UnboundedSender<LinkNotification>,
}

impl<T> fmt::Debug for LinkMachine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkMachine")
            .field("phase", &self.phase)
            .field("auto_connect", &self.auto_connect)
            .field("discovered", &self.discovered.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> LinkMachine<T> {
    /// Create an idle machine
    ///
    /// Returns the machine together with the receiver its timers post to.
    /// Every event read from that receiver must be fed back into
    /// [`LinkMachine::handle`].
    ///
    /// `auto_connect` is the remembered device address to connect to as soon
    /// as it is discovered, if auto-connect is enabled.
    pub fn new(
        transport: T,
        config: &LinkConfig,
        auto_connect: Option<String>,
        notifications: mpsc::UnboundedSender<LinkNotification>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (timers, timer_events) = mpsc::unbounded_channel();
        let machine = Self {
            transport,
            phase: Phase::Idle,
            reconnect_delay: config.reconnect_delay(),
            scan_timeout: config.scan_timeout(),
            auto_connect,
            discovered: Vec::new(),
            telemetry: TelemetrySnapshot::default(),
            next_timer: 0,
            timers,
            notifications,
        };
        (machine, timer_events)
    }

    /// Current observable state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.phase.state()
    }

    /// Device currently targeted, if any
    #[must_use]
    pub fn target(&self) -> Option<&DeviceHandle> {
        self.phase.target()
    }

    /// Devices seen in the current scan session
    #[must_use]
    pub fn discovered(&self) -> &[DeviceHandle] {
        &self.discovered
    }

    /// Last known telemetry
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetrySnapshot {
        &self.telemetry
    }

    /// Address that will be connected to automatically when discovered
    #[must_use]
    pub fn auto_connect(&self) -> Option<&str> {
        self.auto_connect.as_deref()
    }

    /// Feed one event through the transition function
    pub async fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StartScan => self.start_scan().await,
            LinkEvent::SelectDevice(device) => self.select(device).await,
            LinkEvent::Disconnect => self.disconnect().await,
            LinkEvent::RetryElapsed(id) => self.retry_elapsed(id).await,
            LinkEvent::ScanElapsed(id) => self.scan_elapsed(id).await,
            LinkEvent::Transport(event) => self.transport_event(event).await,
        }
    }

    /// Write an encoded frame to the device
    ///
    /// Does nothing unless the link is [`LinkState::Ready`]. Returns whether
    /// the frame was handed to the transport.
    pub async fn send(&mut self, data: Bytes) -> bool {
        let Phase::Ready { write, .. } = self.phase else {
            return false;
        };

        if let Err(e) = self.transport.write(write, data).await {
            warn!("Write failed: {}", e);
            return false;
        }
        true
    }

    async fn start_scan(&mut self) {
        if !matches!(
            self.phase,
            Phase::Idle | Phase::Disconnected | Phase::Failed(_)
        ) {
            debug!("Ignoring scan request while {}", self.state());
            return;
        }

        if let Err(e) = self.transport.start_discovery().await {
            error!("Failed to start discovery: {}", e);
            self.fail(None, FailureReason::Transport(e.to_string()));
            return;
        }

        info!("Scanning for devices...");
        self.discovered.clear();
        let timer = self.arm(self.scan_timeout, LinkEvent::ScanElapsed);
        self.enter(Phase::Scanning { timer });
    }

    async fn scan_elapsed(&mut self, id: TimerId) {
        match &self.phase {
            Phase::Scanning { timer } if timer.id == id => {}
            _ => {
                debug!("Ignoring stale scan timer {:?}", id);
                return;
            }
        }

        info!("Scan timed out, {} device(s) seen", self.discovered.len());
        self.stop_discovery().await;
        self.discovered.clear();
        self.enter(Phase::Idle);
    }

    async fn select(&mut self, device: DeviceHandle) {
        info!("Selected device {}", device);

        if matches!(self.phase, Phase::Scanning { .. }) {
            self.stop_discovery().await;
        } else if self.phase.has_transport_link()
            && !matches!(
                self.phase,
                Phase::Connecting {
                    attempt: Attempt::InFlight,
                    ..
                }
            )
        {
            self.teardown().await;
        }

        self.connect(device).await;
    }

    async fn disconnect(&mut self) {
        info!("Disconnect requested while {}", self.state());

        if matches!(self.phase, Phase::Scanning { .. }) {
            self.stop_discovery().await;
        } else if self.phase.has_transport_link() {
            self.teardown().await;
        }

        self.enter(Phase::Disconnected);
    }

    async fn retry_elapsed(&mut self, id: TimerId) {
        match &self.phase {
            Phase::Connecting {
                target,
                attempt: Attempt::Backoff(timer),
            } if timer.id == id => {
                let target = target.clone();
                info!("Retrying connection to {}", target);
                self.connect(target).await;
            }
            Phase::AwaitingAuthentication { target, recheck } if recheck.id == id => {
                let target = target.clone();
                info!("Re-checking bonding with {}", target);
                self.resolve(target).await;
            }
            _ => debug!("Ignoring stale retry timer {:?}", id),
        }
    }

    async fn transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Discovered(device) => self.device_found(device).await,
            TransportEvent::Connected { address } => self.connected(&address).await,
            TransportEvent::ConnectFailed {
                address,
                pairing_removed,
                reason,
            } => self.connect_failed(&address, pairing_removed, &reason),
            TransportEvent::Disconnected { address, reason } => {
                self.link_lost(&address, &reason);
            }
            TransportEvent::ServicesResolved(characteristics) => {
                self.services_resolved(&characteristics).await;
            }
            TransportEvent::ServiceDiscoveryFailed(reason) => {
                self.services_unavailable(&reason).await;
            }
            TransportEvent::AuthenticationRequired => self.authentication_required(),
            TransportEvent::DataReceived(data) => self.data_received(&data).await,
            TransportEvent::AdapterUnavailable(reason) => {
                if matches!(self.phase, Phase::Failed(_)) {
                    return;
                }
                error!("Bluetooth adapter unavailable: {}", reason);
                let device = self.phase.target().cloned();
                self.fail(device, FailureReason::Transport(reason));
            }
        }
    }

    async fn device_found(&mut self, device: DeviceHandle) {
        if !matches!(self.phase, Phase::Scanning { .. }) {
            return;
        }

        if let Some(known) = self
            .discovered
            .iter_mut()
            .find(|known| known.matches(&device.address))
        {
            known.name.clone_from(&device.name);
            return;
        }

        debug!("Discovered {}", device);
        self.discovered.push(device.clone());
        self.notify(LinkNotification::DeviceDiscovered(device.clone()));

        if self
            .auto_connect
            .as_deref()
            .is_some_and(|address| device.matches(address))
        {
            info!("Auto-connecting to remembered device {}", device);
            self.select(device).await;
        }
    }

    async fn connected(&mut self, address: &str) {
        let target = match &self.phase {
            Phase::Connecting {
                target,
                attempt: Attempt::InFlight,
            } if target.matches(address) => target.clone(),
            _ => {
                debug!("Ignoring connect from {} while {}", address, self.state());
                return;
            }
        };

        info!("Connected to {}, resolving services", target);
        self.resolve(target).await;
    }

    fn connect_failed(&mut self, address: &str, pairing_removed: bool, reason: &str) {
        let target = match &self.phase {
            Phase::Connecting {
                target,
                attempt: Attempt::InFlight,
            } if target.matches(address) => target.clone(),
            _ => {
                debug!("Ignoring connect failure from {}: {}", address, reason);
                return;
            }
        };

        if pairing_removed {
            error!("{} removed its pairing information: {}", target, reason);
            let cleared = self
                .auto_connect
                .as_deref()
                .is_some_and(|remembered| target.matches(remembered));
            if cleared {
                self.auto_connect = None;
            }
            self.enter(Phase::Failed(FailureReason::PairingRevoked));
            self.notify(LinkNotification::Failure {
                device: Some(target),
                reason: FailureReason::PairingRevoked,
                auto_connect_cleared: cleared,
            });
            return;
        }

        warn!(
            "Connection to {} failed: {}, retrying in {:?}",
            target, reason, self.reconnect_delay
        );
        self.back_off(target);
    }

    fn link_lost(&mut self, address: &str, reason: &str) {
        let Some(target) = self
            .phase
            .target()
            .filter(|target| target.matches(address))
            .cloned()
        else {
            debug!("Ignoring disconnect from {}: {}", address, reason);
            return;
        };

        if matches!(
            self.phase,
            Phase::Connecting {
                attempt: Attempt::Backoff(_),
                ..
            }
        ) {
            return;
        }

        warn!(
            "Lost link to {}: {}, reconnecting in {:?}",
            target, reason, self.reconnect_delay
        );
        self.back_off(target);
    }

    async fn services_resolved(&mut self, characteristics: &[CharacteristicInfo]) {
        let target = match &self.phase {
            Phase::ResolvingServices { target } => target.clone(),
            Phase::AwaitingAuthentication { .. } => {
                debug!("Authentication pending, ignoring resolved characteristics");
                return;
            }
            _ => return,
        };

        let write = characteristics
            .iter()
            .find(|c| c.uuid == WRITE_CHAR_UUID && c.can_write);
        let notify = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_CHAR_UUID && c.can_notify);

        let (Some(write), Some(notify)) = (write, notify) else {
            self.services_unavailable("required characteristics not found")
                .await;
            return;
        };

        if let Err(e) = self.transport.subscribe(notify.uuid).await {
            self.services_unavailable(&e.to_string()).await;
            return;
        }

        info!("Link to {} ready", target);
        self.enter(Phase::Ready {
            target,
            write: write.uuid,
        });
    }

    async fn services_unavailable(&mut self, reason: &str) {
        if !matches!(
            self.phase,
            Phase::ResolvingServices { .. } | Phase::AwaitingAuthentication { .. }
        ) {
            return;
        }

        warn!("Service resolution failed: {}", reason);
        self.teardown().await;
        self.enter(Phase::Disconnected);
    }

    fn authentication_required(&mut self) {
        let target = match &self.phase {
            Phase::ResolvingServices { target } | Phase::Ready { target, .. } => target.clone(),
            _ => return,
        };

        warn!(
            "{} requires authentication, waiting for bonding (re-check in {:?})",
            target, self.reconnect_delay
        );
        let recheck = self.arm(self.reconnect_delay, LinkEvent::RetryElapsed);
        self.enter(Phase::AwaitingAuthentication { target, recheck });
    }

    async fn data_received(&mut self, data: &[u8]) {
        if !matches!(
            self.phase,
            Phase::Ready { .. }
                | Phase::ResolvingServices { .. }
                | Phase::AwaitingAuthentication { .. }
        ) {
            return;
        }

        match decode_telemetry(data) {
            Ok(frames) if !frames.is_empty() => {
                for frame in &frames {
                    self.telemetry.apply(frame);
                }
                self.notify(LinkNotification::Telemetry(self.telemetry.clone()));
            }
            Ok(_) => debug!("No telemetry in {} byte payload", data.len()),
            Err(e) => debug!("Dropping frame: {}", e),
        }

        if let Phase::AwaitingAuthentication { target, .. } = &self.phase {
            let target = target.clone();
            info!("{} authenticated, resolving services", target);
            self.resolve(target).await;
        }
    }

    /// Enter service resolution and ask the transport for the table
    ///
    /// Resolution ends in a re-subscribe, which is also how a finished bond
    /// is noticed.
    async fn resolve(&mut self, target: DeviceHandle) {
        self.enter(Phase::ResolvingServices { target });
        if let Err(e) = self.transport.discover_services().await {
            self.services_unavailable(&e.to_string()).await;
        }
    }

    async fn connect(&mut self, target: DeviceHandle) {
        debug!("Connecting to {}", target);
        self.enter(Phase::Connecting {
            target: target.clone(),
            attempt: Attempt::InFlight,
        });

        if let Err(e) = self.transport.connect(&target).await {
            warn!(
                "Connect request to {} failed: {}, retrying in {:?}",
                target, e, self.reconnect_delay
            );
            self.back_off(target);
        }
    }

    fn back_off(&mut self, target: DeviceHandle) {
        let timer = self.arm(self.reconnect_delay, LinkEvent::RetryElapsed);
        self.enter(Phase::Connecting {
            target,
            attempt: Attempt::Backoff(timer),
        });
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {}", e);
        }
    }

    async fn stop_discovery(&mut self) {
        if let Err(e) = self.transport.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
    }

    fn fail(&mut self, device: Option<DeviceHandle>, reason: FailureReason) {
        self.enter(Phase::Failed(reason.clone()));
        self.notify(LinkNotification::Failure {
            device,
            reason,
            auto_connect_cleared: false,
        });
    }

    fn arm(&mut self, delay: Duration, event: fn(TimerId) -> LinkEvent) -> TimerGuard {
        self.next_timer += 1;
        let id = TimerId(self.next_timer);
        let timers = self.timers.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(event(id));
        });
        TimerGuard { id, task }
    }

    /// Replace the phase, dropping any timer the old phase owned
    fn enter(&mut self, phase: Phase) {
        let previous = mem::replace(&mut self.phase, phase);
        let state = self.phase.state();
        if previous.state() != state {
            info!("Link state: {} -> {}", previous.state(), state);
            self.notify(LinkNotification::StateChanged(state));
        }
    }

    fn notify(&self, notification: LinkNotification) {
        let _ = self.notifications.send(notification);
    }
}
