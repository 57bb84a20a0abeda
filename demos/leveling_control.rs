use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rvremote::{
    ble::BleTransport,
    config::RemoteConfig,
    controls::LegSelection,
    device::RemoteSession,
    link::LinkNotification,
    protocol::{ModeFrame, MOTION_DOWN, MOTION_PAUSE, MOTION_UP},
    types::Leg,
    LevelingCommand, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("🛠️ rvremote leveling control example");

    let config = match std::env::args().nth(1) {
        Some(path) => RemoteConfig::load(path)?,
        None => RemoteConfig::default(),
    };
    let model = config.control.leveler_model;

    let (transport, events) = BleTransport::new().await?;
    let (session, mut notifications) = RemoteSession::spawn(transport, events, &config);
    session.start_scan()?;

    while let Some(notification) = notifications.recv().await {
        match notification {
            LinkNotification::DeviceDiscovered(device) if config.auto_connect().is_none() => {
                session.select_device(device)?;
            }
            LinkNotification::StateChanged(state) if state.is_ready() => break,
            LinkNotification::Failure { reason, .. } => {
                error!("❌ {}", reason);
                return Ok(());
            }
            _ => {}
        }
    }

    info!("✅ Connected");
    if config.control.expert_mode {
        session.set_command(ModeFrame { expert_mode: true })?;
        sleep(Duration::from_secs(1)).await;
    }

    // Raise both front legs
    let mut legs = LegSelection::empty();
    legs.toggle(Leg::FrontLeft, model);
    legs.toggle(Leg::FrontRight, model);
    info!("Raising front legs (select '{}')", char::from(legs.select_code(model)));
    session.set_command(legs.command(model, MOTION_UP))?;
    sleep(Duration::from_secs(3)).await;
    session.set_command(legs.command(model, MOTION_PAUSE))?;
    sleep(Duration::from_secs(1)).await;

    // Lower the rear right leg on its own
    legs.clear();
    legs.toggle(Leg::RearRight, model);
    info!("Lowering rear right leg (select '{}')", char::from(legs.select_code(model)));
    session.set_command(legs.command(model, MOTION_DOWN))?;
    sleep(Duration::from_secs(2)).await;

    session.set_command(LevelingCommand::idle())?;
    sleep(Duration::from_secs(1)).await;
    session.shutdown().await;
    info!("👋 Done");
    Ok(())
}
