mod demo;

use anyhow::Context;
use gatt_coordinator::domain::settings::SettingsService;
use gatt_coordinator::infrastructure::bluetooth::{SimulatedTransport, Transport};
use gatt_coordinator::infrastructure::logging::init_logger;
use gatt_coordinator::{ConnectionState, CoordinatorConfig, Descriptor, GattCoordinator, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Settings loaded from {}", settings_service.path().display());

    let descriptor = match Descriptor::new(demo::services()) {
        Ok(descriptor) => descriptor.into_shared(),
        Err(e) => {
            error!("Invalid device descriptor: {}", e);
            return Err(e.into());
        }
    };
    let (transport, simulated) = select_transport(settings.device.address, &descriptor);

    let coordinator =
        GattCoordinator::new(descriptor, transport, CoordinatorConfig::from(&settings));
    coordinator.subscribe(|event| match &event.previous {
        Some(previous) => info!("{}: {} -> {}", event.key, previous, event.value),
        None => info!("{}: {}", event.key, event.value),
    });
    coordinator.start();

    if let Some(simulated) = simulated {
        tokio::spawn(demo::animate(simulated));

        let mut state = coordinator.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .context("Coordinator stopped before connecting")?;
        coordinator
            .write_all([
                ("password", Value::from("123456")),
                ("relay", Value::Bool(true)),
            ])
            .await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let snapshot = coordinator.snapshot();
    let diagnostics = coordinator.diagnostics();
    coordinator.shutdown().await;

    info!("Final values: {}", serde_json::to_string(&snapshot)?);
    info!("Diagnostics: {}", serde_json::to_string(&diagnostics)?);
    Ok(())
}

/// Native backend when a device address is configured, the simulated panel
/// otherwise.
#[cfg(windows)]
fn select_transport(
    address: Option<u64>,
    descriptor: &Arc<Descriptor>,
) -> (Arc<dyn Transport>, Option<SimulatedTransport>) {
    use gatt_coordinator::infrastructure::bluetooth::WinRtTransport;

    match address {
        Some(address) => (
            Arc::new(WinRtTransport::new(address, descriptor.clone())),
            None,
        ),
        None => {
            warn!("No device address configured, using the simulated panel");
            simulated_transport()
        }
    }
}

#[cfg(not(windows))]
fn select_transport(
    address: Option<u64>,
    _descriptor: &Arc<Descriptor>,
) -> (Arc<dyn Transport>, Option<SimulatedTransport>) {
    if let Some(address) = address {
        warn!(
            "No native Bluetooth backend on this platform, ignoring {:#X}",
            address
        );
    }
    simulated_transport()
}

fn simulated_transport() -> (Arc<dyn Transport>, Option<SimulatedTransport>) {
    let transport = SimulatedTransport::new();
    demo::seed(&transport);
    (Arc::new(transport.clone()), Some(transport))
}
