use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use device_telemetry::config::PipelineConfig;
use device_telemetry::logging::init_logging;
use device_telemetry::registry::{self, DeviceRegistry, InMemoryDeviceRegistry};
use device_telemetry::service::MeasurementService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = PipelineConfig::from_env().context("invalid configuration")?;

    let (logging, _guard) = init_logging(config.log_dir.as_deref())?;
    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = if config.broker.is_memory() { "memory" } else { "amqp" },
        filter = %logging.get_filter(),
        log_dir = ?logging.log_dir(),
        "device-telemetry starting"
    );

    let registry = Arc::new(InMemoryDeviceRegistry::new());
    if let Some(path) = config.devices_file.as_deref() {
        let payloads = registry::load_payloads(path)
            .await
            .with_context(|| format!("failed to load devices from {}", path.display()))?;
        let count = registry::seed(registry.as_ref(), payloads).await?;
        info!(count, "Devices registered");
    } else {
        warn!("DEVICES_FILE not set, starting with an empty registry");
    }

    let devices = registry.all_devices().await?;
    for device in &devices {
        info!(id = %device.id, name = %device.name, interval_ms = device.interval_ms, "Device");
    }

    let service = MeasurementService::new(config, registry);
    service
        .start_measurement_service()
        .await
        .context("failed to start measurement service")?;

    let failed = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            false
        }
        _ = service.wait_for_failure() => {
            error!("Pipeline failed, shutting down");
            true
        }
    };

    service.shutdown().await?;
    background.cancel();

    if failed {
        anyhow::bail!("measurement pipeline failed");
    }
    info!("device-telemetry stopped");
    Ok(())
}
