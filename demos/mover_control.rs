use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rvremote::{
    ble::BleTransport,
    config::RemoteConfig,
    controls::{actuator_for_press, Drive, MoverInput},
    device::RemoteSession,
    link::LinkNotification,
    MotionCommand, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("🚐 rvremote mover control example");

    let config = match std::env::args().nth(1) {
        Some(path) => RemoteConfig::load(path)?,
        None => RemoteConfig::default(),
    };

    let (transport, events) = BleTransport::new().await?;
    let (session, mut notifications) = RemoteSession::spawn(transport, events, &config);

    session.start_scan()?;
    info!("Scanning, connecting to the first device found...");

    while let Some(notification) = notifications.recv().await {
        match notification {
            LinkNotification::DeviceDiscovered(device) => {
                if config.auto_connect().is_none() {
                    info!("Found {}", device);
                    session.select_device(device)?;
                }
            }
            LinkNotification::StateChanged(state) if state.is_ready() => break,
            LinkNotification::StateChanged(state) => info!("Link: {}", state),
            LinkNotification::Failure { reason, .. } => {
                error!("❌ {}", reason);
                return Ok(());
            }
            LinkNotification::Telemetry(_) => {}
        }
    }

    info!("✅ Connected");
    let model = config.control.mover_model;

    // Creep forward for two seconds
    let forward = MoverInput {
        drive: Drive::Forward,
        speed: 2,
        ..MoverInput::default()
    };
    session.set_command(forward.to_command(model)?)?;
    sleep(Duration::from_secs(2)).await;

    // Release: the stop frame is repeated on the next ticks
    session.set_command(MotionCommand::stop())?;
    sleep(Duration::from_secs(1)).await;

    // Turn on the spot
    let turn = MoverInput {
        drive: Drive::TurnClockwise,
        speed: 1,
        ..MoverInput::default()
    };
    session.set_command(turn.to_command(model)?)?;
    sleep(Duration::from_secs(1)).await;
    session.set_command(MotionCommand::stop())?;

    if model.has_actuator() {
        // Start an auto lower, then halt it with the stop button
        let lower = MoverInput {
            actuator: actuator_for_press(true, true),
            ..MoverInput::default()
        };
        session.set_command(lower.to_command(model)?)?;
        sleep(Duration::from_millis(1500)).await;
        session.stop()?;
    }

    // Let the stop burst go out before closing the link
    sleep(Duration::from_secs(3)).await;
    session.shutdown().await;
    info!("👋 Done");
    Ok(())
}
