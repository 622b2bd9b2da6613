//! Per-device emitter task.

use std::sync::Arc;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Result;
use crate::broker::Publisher;
use crate::config::EmitFailurePolicy;
use crate::domain::{Device, DeviceId, Measurement, RoutingKey};

/// Summary returned by an emitter that stopped cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterReport {
    pub device_id: DeviceId,
    /// Measurements accepted by the publisher.
    pub emitted: u64,
    /// Publish calls that failed and were skipped.
    pub failed: u64,
}

/// Emits one measurement per interval for a single device.
pub struct DeviceEmitter<P: ?Sized> {
    device: Device,
    publisher: Arc<P>,
    stop: CancellationToken,
    policy: EmitFailurePolicy,
}

impl<P> DeviceEmitter<P>
where
    P: Publisher + ?Sized,
{
    /// The device interval must be positive; the coordinator checks this
    /// before spawning.
    pub fn new(
        device: Device,
        publisher: Arc<P>,
        stop: CancellationToken,
        policy: EmitFailurePolicy,
    ) -> Self {
        Self {
            device,
            publisher,
            stop,
            policy,
        }
    }

    /// Tick until the stop token fires.
    ///
    /// The first measurement goes out one full interval after start. A
    /// publish still in flight when stop fires is abandoned.
    pub async fn run(self) -> Result<EmitterReport> {
        let period = self.device.interval();
        let routing_key = RoutingKey::for_device(&self.device.id);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut report = EmitterReport {
            device_id: self.device.id.clone(),
            emitted: 0,
            failed: 0,
        };

        debug!(
            device_id = %self.device.id,
            name = %self.device.name,
            interval_ms = self.device.interval_ms,
            "Emitter started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let measurement = Measurement::from_device(&self.device);
            let outcome = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                outcome = self.publisher.publish_measurement(&measurement, &routing_key) => outcome,
            };

            match outcome {
                Ok(()) => report.emitted += 1,
                Err(e) => match self.policy {
                    EmitFailurePolicy::FailFast => {
                        error!(
                            device_id = %self.device.id,
                            error = %e,
                            "Publish failed, stopping emitter"
                        );
                        return Err(e);
                    }
                    EmitFailurePolicy::LogAndContinue => {
                        report.failed += 1;
                        warn!(
                            device_id = %self.device.id,
                            error = %e,
                            "Publish failed, measurement dropped"
                        );
                    }
                },
            }
        }

        debug!(
            device_id = %self.device.id,
            emitted = report.emitted,
            failed = report.failed,
            "Emitter stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::testing::{FailingPublisher, RecordingPublisher};
    use crate::Error;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_emits_device_measurement_with_routing_key() {
        let (publisher, mut rx) = RecordingPublisher::new();
        let stop = CancellationToken::new();
        let device = Device::new("d1", "sensor", 24.34, 1);

        let emitter = DeviceEmitter::new(
            device,
            Arc::new(publisher),
            stop.clone(),
            EmitFailurePolicy::FailFast,
        );
        let handle = tokio::spawn(emitter.run());

        let (measurement, routing_key) = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("measurement");
        assert_eq!(measurement, Measurement::new("d1", 24.34));
        assert_eq!(routing_key.as_str(), "d1");

        stop.cancel();
        let report = timeout(Duration::from_secs(1), handle)
            .await
            .expect("emitter did not stop")
            .unwrap()
            .unwrap();
        assert!(report.emitted >= 1);

        // Drain whatever was emitted before the stop, then expect silence.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_waits_one_interval_before_first_emit() {
        let (publisher, mut rx) = RecordingPublisher::new();
        let stop = CancellationToken::new();
        let device = Device::new("slow", "sensor", 1.0, 10_000);

        let emitter = DeviceEmitter::new(
            device,
            Arc::new(publisher),
            stop.clone(),
            EmitFailurePolicy::FailFast,
        );
        let handle = tokio::spawn(emitter.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        stop.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.emitted, 0);
    }

    #[tokio::test]
    async fn test_fail_fast_returns_publish_error() {
        let publisher = Arc::new(FailingPublisher::default());
        let device = Device::new("d1", "sensor", 1.0, 1);

        let emitter = DeviceEmitter::new(
            device,
            publisher.clone(),
            CancellationToken::new(),
            EmitFailurePolicy::FailFast,
        );
        let result = timeout(Duration::from_secs(1), emitter.run())
            .await
            .expect("emitter should end on its own");

        assert!(matches!(result, Err(Error::Publish { .. })));
        assert_eq!(publisher.attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_log_and_continue_keeps_ticking() {
        let publisher = Arc::new(FailingPublisher::default());
        let stop = CancellationToken::new();
        let device = Device::new("d1", "sensor", 1.0, 2);

        let emitter = DeviceEmitter::new(
            device,
            publisher.clone(),
            stop.clone(),
            EmitFailurePolicy::LogAndContinue,
        );
        let handle = tokio::spawn(emitter.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.emitted, 0);
        assert!(report.failed >= 2);
    }
}
