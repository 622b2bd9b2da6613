//! Measurement service: wires the registry, broker, emitters, consumer, and
//! writer together and owns their lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::broker::{self, BrokerChannel};
use crate::config::PipelineConfig;
use crate::consumer::{ConsumerExit, ConsumerReport, MeasurementConsumer};
use crate::emitter::{EmitterReport, TickerCoordinator};
use crate::registry::DeviceRegistry;
use crate::writer::{BatchWriter, InfluxStore, TimeSeriesStore, WriterReport};

/// Capacity of the consumer to writer hand-off.
const HANDOFF_CAPACITY: usize = 1;

/// How long a cancelled writer gets to close the store after the shutdown
/// timeout has elapsed.
const WRITER_CANCEL_GRACE: Duration = Duration::from_secs(2);

/// What each component reported on shutdown. `None` means the component
/// never ran or did not finish within the shutdown timeout.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub emitters: Vec<EmitterReport>,
    pub consumer: Option<ConsumerReport>,
    pub writer: Option<WriterReport>,
}

#[derive(Default)]
struct Tasks {
    broker: Option<Arc<dyn BrokerChannel>>,
    store: Option<Arc<dyn TimeSeriesStore>>,
    consumer: Option<JoinHandle<Result<ConsumerReport>>>,
    writer: Option<JoinHandle<Result<WriterReport>>>,
}

/// Controller for the measurement pipeline.
///
/// Starting is one-shot: the first successful call brings the pipeline up
/// and later calls are no-ops.
pub struct MeasurementService {
    config: PipelineConfig,
    registry: Arc<dyn DeviceRegistry>,
    store: Mutex<Option<Arc<dyn TimeSeriesStore>>>,
    coordinator: TickerCoordinator,
    started: AtomicBool,
    tasks: Mutex<Tasks>,
    /// Stops the consumer.
    consumer_token: CancellationToken,
    /// Stops the writer without waiting for its input to close.
    writer_token: CancellationToken,
    /// Fired when a running component fails.
    fatal: CancellationToken,
}

impl MeasurementService {
    /// Create a service that writes to the InfluxDB store from `config`.
    pub fn new(config: PipelineConfig, registry: Arc<dyn DeviceRegistry>) -> Self {
        Self::build(config, registry, None)
    }

    /// Create a service writing to a caller-supplied store.
    pub fn with_store(
        config: PipelineConfig,
        registry: Arc<dyn DeviceRegistry>,
        store: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        Self::build(config, registry, Some(store))
    }

    fn build(
        config: PipelineConfig,
        registry: Arc<dyn DeviceRegistry>,
        store: Option<Arc<dyn TimeSeriesStore>>,
    ) -> Self {
        let coordinator = TickerCoordinator::new(config.emit_failure_policy);
        Self {
            config,
            registry,
            store: Mutex::new(store),
            coordinator,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
            consumer_token: CancellationToken::new(),
            writer_token: CancellationToken::new(),
            fatal: CancellationToken::new(),
        }
    }

    /// Bring the pipeline up.
    ///
    /// The broker is connected and its topology declared before anything
    /// else starts, so a broker failure leaves no emitter running. On such a
    /// failure the start gate is released and the call may be retried.
    pub async fn start_measurement_service(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Measurement service already started");
            return Ok(());
        }

        match self.start_components().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Measurement service failed to start");
                self.release_after_failed_start().await;
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> Result<()> {
        let devices = self.registry.all_devices().await?;
        for device in &devices {
            device.ensure_emittable()?;
        }

        let channel = broker::connect(&self.config.broker).await?;
        self.tasks.lock().broker = Some(channel.clone());

        let deliveries = channel.register_consumer().await?;
        let store = self.open_store()?;

        let (sender, receiver) = mpsc::channel(HANDOFF_CAPACITY);
        let writer = BatchWriter::new(store.clone(), self.config.writer.clone())
            .start(receiver, self.writer_token.clone());

        let consumer = MeasurementConsumer::new(deliveries, self.config.decode_failure_policy);
        let consumer = tokio::spawn(watch_consumer(
            consumer.run(sender, self.consumer_token.clone()),
            self.consumer_token.clone(),
            self.fatal.clone(),
        ));

        {
            let mut tasks = self.tasks.lock();
            tasks.store = Some(store);
            tasks.writer = Some(writer);
            tasks.consumer = Some(consumer);
        }

        let device_count = devices.len();
        self.coordinator.start(devices, channel)?;

        info!(
            devices = device_count,
            exchange = %self.config.broker.topology.exchange,
            queue = %self.config.broker.topology.queue,
            "Measurement service started"
        );
        Ok(())
    }

    fn open_store(&self) -> Result<Arc<dyn TimeSeriesStore>> {
        if let Some(store) = self.store.lock().take() {
            return Ok(store);
        }
        Ok(Arc::new(InfluxStore::new(&self.config.store)?))
    }

    async fn release_after_failed_start(&self) {
        let channel = {
            let mut tasks = self.tasks.lock();
            if tasks.consumer.is_some() {
                // Components are running; shutdown tears them down.
                return;
            }
            tasks.broker.take()
        };
        if let Some(channel) = channel
            && let Err(e) = channel.close().await
        {
            warn!(error = %e, "Failed to close broker after failed start");
        }
        self.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Resolves once an emitter or the consumer has failed at runtime.
    pub async fn wait_for_failure(&self) {
        tokio::select! {
            _ = self.coordinator.failed() => {}
            _ = self.fatal.cancelled() => {}
        }
    }

    /// Shut down with the configured timeout.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown_with_timeout(self.config.shutdown_timeout).await
    }

    /// Stop emitters, drain the consumer and writer, and close the broker.
    ///
    /// Component failures seen here are logged, never returned.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<ShutdownReport> {
        info!("Shutting down measurement service (timeout: {:?})", timeout);

        let Tasks {
            broker,
            store,
            mut consumer,
            mut writer,
        } = std::mem::take(&mut *self.tasks.lock());
        let mut report = ShutdownReport::default();

        self.coordinator.stop();
        self.consumer_token.cancel();

        // Handles stay outside the timed future so a timeout cannot drop them.
        let drained = tokio::time::timeout(timeout, async {
            match self.coordinator.join().await {
                Ok(emitters) => report.emitters = emitters,
                Err(e) => warn!(error = %e, "Emitters ended with an error"),
            }
            if let Some(handle) = consumer.as_mut() {
                report.consumer = flatten("consumer", handle.await);
                consumer = None;
            }
            // The consumer has dropped its sender, so the writer drains and stops.
            if let Some(handle) = writer.as_mut() {
                report.writer = flatten("writer", handle.await);
                writer = None;
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, forcing writer to stop");
            if let Some(handle) = consumer.take() {
                handle.abort();
            }
            self.writer_token.cancel();
            if let Some(mut handle) = writer.take() {
                match tokio::time::timeout(WRITER_CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => report.writer = flatten("writer", joined),
                    Err(_) => {
                        warn!("Writer did not stop, closing the store directly");
                        handle.abort();
                        if let Some(store) = &store
                            && let Err(e) = store.close().await
                        {
                            warn!(error = %e, "Failed to close time-series store");
                        }
                    }
                }
            }
        }

        if let Some(channel) = broker
            && let Err(e) = channel.close().await
        {
            warn!(error = %e, "Failed to close broker channel");
        }

        info!(
            emitters = report.emitters.len(),
            written = report.writer.map(|w| w.points_written).unwrap_or_default(),
            "Measurement service shut down"
        );
        Ok(report)
    }
}

/// Run the consume loop and flag an unexpected end as a pipeline failure.
async fn watch_consumer<F>(
    consume: F,
    consumer_token: CancellationToken,
    fatal: CancellationToken,
) -> Result<ConsumerReport>
where
    F: Future<Output = Result<ConsumerReport>>,
{
    let result = consume.await;
    match &result {
        Err(e) => {
            error!(error = %e, "Measurement consumer failed");
            fatal.cancel();
        }
        Ok(report) if report.exit != ConsumerExit::Cancelled && !consumer_token.is_cancelled() => {
            error!(exit = ?report.exit, "Measurement consumer ended unexpectedly");
            fatal.cancel();
        }
        Ok(_) => {}
    }
    result
}

fn flatten<T>(
    component: &str,
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Option<T> {
    match joined {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(component, error = %e, "Component ended with an error");
            None
        }
        Err(e) => {
            warn!(component, error = %e, "Component task failed");
            None
        }
    }
}
