use cadencers::{CadenceSensor, Result, ScanMode, SessionConfig, SessionEvent, TimeoutConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Cadencers Cadence Monitor Example");

    // Optional target address as the first argument
    let target_address = std::env::args().nth(1);
    let config = SessionConfig {
        scan_mode: if target_address.is_some() {
            ScanMode::AutoConnect
        } else {
            ScanMode::Interactive
        },
        target_address,
        ..Default::default()
    };

    let (sensor, mut events) = match CadenceSensor::start(config, TimeoutConfig::default()).await {
        Ok(started) => started,
        Err(e) => {
            error!("❌ Failed to start session: {}", e);
            return Err(e);
        }
    };

    info!("🔍 Searching for cadence sensors...");
    sensor.request_start_scan_or_connect()?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::StateChanged(state) => info!("🔗 Connection state: {}", state),
                    SessionEvent::CadenceUpdated(rpm) => info!("⚙️ Cadence: {:.0} RPM", rpm),
                    SessionEvent::CadenceStale => warn!("⏸️ No pedalling detected, cadence 0 RPM"),
                    SessionEvent::DiscoveryComplete(devices) => {
                        for device in &devices {
                            info!("  📡 {}", device.label());
                        }
                        if let Some(device) = devices.first() {
                            info!("Selecting {}", device.display_name());
                            sensor.select_device(device.handle.address())?;
                        }
                    }
                    SessionEvent::Error(failure) => {
                        error!("❌ {:?}: {}", failure.kind, failure.message);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
        }
    }

    let status = sensor.status().await;
    info!("📊 Final state: {} at {:.0} RPM", status.state, status.cadence_rpm);

    sensor.shutdown().await?;
    info!("✅ Cadence monitor finished");
    Ok(())
}
