use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rvremote::{
    ble::BleTransport,
    config::RemoteConfig,
    device::RemoteSession,
    link::LinkNotification,
    types::{Leg, LinkState},
    Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("📊 rvremote telemetry monitor");
    info!("Press Ctrl+C to stop monitoring");

    let config = match std::env::args().nth(1) {
        Some(path) => RemoteConfig::load(path)?,
        None => RemoteConfig::default(),
    };

    let (transport, events) = BleTransport::new().await?;
    let (session, mut notifications) = RemoteSession::spawn(transport, events, &config);
    session.start_scan()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                match notification {
                    LinkNotification::DeviceDiscovered(device) => {
                        println!("🔍 {device}");
                        if config.auto_connect().is_none() {
                            session.select_device(device)?;
                        }
                    }
                    LinkNotification::StateChanged(state) => {
                        println!("🔗 {state}");
                        if state == LinkState::Idle {
                            session.start_scan()?;
                        }
                    }
                    LinkNotification::Telemetry(snapshot) => {
                        println!("\n📊 Telemetry");
                        if let Some(volts) = snapshot.voltage {
                            println!("  Battery:    {volts:5.1} V");
                        }
                        if let Some(angle) = snapshot.front_back {
                            println!("  Front/back: {angle:+6.2}°");
                        }
                        if let Some(angle) = snapshot.left_right {
                            println!("  Left/right: {angle:+6.2}°");
                        }
                        if let Some(status) = snapshot.status {
                            let model = config.control.leveler_model;
                            let active: Vec<String> = Leg::ALL
                                .iter()
                                .filter(|leg| model.has_leg(**leg))
                                .filter(|leg| status.is_leg_active_for(**leg, model))
                                .map(|leg| format!("{leg:?}"))
                                .collect();
                            println!("  Status:     {} [{}]", status.code, active.join(", "));
                        }
                    }
                    LinkNotification::Failure { reason, auto_connect_cleared, .. } => {
                        warn!("❌ {}", reason);
                        if reason.requires_repairing() {
                            warn!("Remove the device in the system Bluetooth settings and pair again");
                        }
                        if auto_connect_cleared {
                            warn!("Auto-connect disabled for this device");
                        }
                        break;
                    }
                }
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
