//! Ticker coordinator: one emitter per device, one stop token for all.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::device::{DeviceEmitter, EmitterReport};
use crate::broker::Publisher;
use crate::config::EmitFailurePolicy;
use crate::domain::Device;
use crate::{Error, Result};

type Supervisor = JoinHandle<Result<Vec<EmitterReport>>>;

/// Starts and stops the per-device emitters.
///
/// The coordinator is one-shot: once started it cannot be started again,
/// and once stopped its emitters are gone for good.
pub struct TickerCoordinator {
    stop: CancellationToken,
    fatal: CancellationToken,
    policy: EmitFailurePolicy,
    started: AtomicBool,
    supervisor: Mutex<Option<Supervisor>>,
}

impl TickerCoordinator {
    pub fn new(policy: EmitFailurePolicy) -> Self {
        Self::with_token(policy, CancellationToken::new())
    }

    /// Use `stop` as the broadcast stop signal, typically a child of a
    /// service-wide shutdown token.
    pub fn with_token(policy: EmitFailurePolicy, stop: CancellationToken) -> Self {
        Self {
            stop,
            fatal: CancellationToken::new(),
            policy,
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// Spawn one emitter per device and return immediately.
    ///
    /// Devices with a zero interval are rejected before anything is spawned.
    pub fn start<P>(&self, devices: Vec<Device>, publisher: Arc<P>) -> Result<()>
    where
        P: Publisher + ?Sized + 'static,
    {
        for device in &devices {
            device.ensure_emittable()?;
        }

        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted("ticker coordinator"));
        }

        let mut emitters = JoinSet::new();
        for device in devices {
            let emitter = DeviceEmitter::new(
                device,
                publisher.clone(),
                self.stop.clone(),
                self.policy,
            );
            emitters.spawn(emitter.run());
        }

        info!(emitters = emitters.len(), policy = ?self.policy, "Ticker coordinator started");

        let handle = tokio::spawn(supervise(emitters, self.stop.clone(), self.fatal.clone()));
        *self.supervisor.lock() = Some(handle);
        Ok(())
    }

    /// Broadcast the stop signal to every emitter.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!("Stopping device emitters");
        }
        self.stop.cancel();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Clone of the stop token, for callers that want to observe the stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Resolves once an emitter has failed fatally.
    pub async fn failed(&self) {
        self.fatal.cancelled().await
    }

    /// Wait for every emitter to finish.
    ///
    /// Returns the first fatal emitter error if there was one. Calling this
    /// before `start`, or a second time, yields an empty report list.
    pub async fn join(&self) -> Result<Vec<EmitterReport>> {
        let handle = self.supervisor.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Other(format!("emitter supervisor failed: {}", e)))?,
            None => Ok(Vec::new()),
        }
    }
}

/// Drain the emitter set, turning the first failure into a global stop.
async fn supervise(
    mut emitters: JoinSet<Result<EmitterReport>>,
    stop: CancellationToken,
    fatal: CancellationToken,
) -> Result<Vec<EmitterReport>> {
    let mut reports = Vec::with_capacity(emitters.len());
    let mut first_error = None;

    while let Some(joined) = emitters.join_next().await {
        let err = match joined {
            Ok(Ok(report)) => {
                reports.push(report);
                continue;
            }
            Ok(Err(e)) => e,
            Err(join_error) => Error::Other(format!("emitter task panicked: {}", join_error)),
        };

        if first_error.is_none() {
            error!(error = %err, "Emitter failed, stopping all emitters");
            stop.cancel();
            fatal.cancel();
            first_error = Some(err);
        } else {
            error!(error = %err, "Additional emitter failure");
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(reports),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::testing::{FailingPublisher, RecordingPublisher};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn device(id: &str, interval_ms: u64) -> Device {
        Device::new(id, format!("device-{id}"), 24.34, interval_ms)
    }

    #[tokio::test]
    async fn test_every_device_emits() {
        let (publisher, mut rx) = RecordingPublisher::new();
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);
        let devices: Vec<Device> = (0..5).map(|i| device(&format!("d{i}"), 5)).collect();

        coordinator.start(devices, Arc::new(publisher)).unwrap();

        let mut seen: HashMap<String, f64> = HashMap::new();
        timeout(Duration::from_secs(2), async {
            while seen.len() < 5 {
                let (m, key) = rx.recv().await.unwrap();
                assert_eq!(key.as_str(), m.device_id.as_str());
                seen.insert(m.device_id.to_string(), m.value);
            }
        })
        .await
        .expect("not every device emitted");

        assert!(seen.values().all(|v| *v == 24.34));
        coordinator.stop();
        coordinator.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_observed_by_all_emitters() {
        let (publisher, mut rx) = RecordingPublisher::new();
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);
        let devices = vec![device("a", 20), device("b", 20), device("c", 20)];

        coordinator.start(devices, Arc::new(publisher)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.stop();

        let reports = timeout(Duration::from_millis(500), coordinator.join())
            .await
            .expect("emitters did not stop within the window")
            .unwrap();
        assert_eq!(reports.len(), 3);
        assert!(coordinator.is_stopped());

        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "measurement emitted after stop");
    }

    #[tokio::test]
    async fn test_independent_intervals() {
        let (publisher, _rx) = RecordingPublisher::new();
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);
        let devices = vec![device("fast", 10), device("slow", 40)];

        coordinator.start(devices, Arc::new(publisher)).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        coordinator.stop();

        let reports = coordinator.join().await.unwrap();
        let count = |id: &str| {
            reports
                .iter()
                .find(|r| r.device_id.as_str() == id)
                .map(|r| r.emitted)
                .unwrap()
        };
        assert!(count("slow") >= 2, "slow device barely ticked");
        assert!(
            count("fast") >= 2 * count("slow"),
            "fast={} slow={}",
            count("fast"),
            count("slow")
        );
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (publisher, _rx) = RecordingPublisher::new();
        let publisher = Arc::new(publisher);
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);

        coordinator.start(vec![device("a", 50)], publisher.clone()).unwrap();
        let err = coordinator.start(vec![device("b", 50)], publisher).unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted(_)));

        coordinator.stop();
        assert_eq!(coordinator.join().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected_before_spawning() {
        let (publisher, mut rx) = RecordingPublisher::new();
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);

        let err = coordinator
            .start(vec![device("ok", 1), device("bad", 0)], Arc::new(publisher))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(!coordinator.is_started());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fatal_publish_stops_everything() {
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);
        let devices = vec![device("a", 5), device("b", 500)];

        coordinator
            .start(devices, Arc::new(FailingPublisher::default()))
            .unwrap();

        timeout(Duration::from_secs(1), coordinator.failed())
            .await
            .expect("failure was not signalled");
        assert!(coordinator.is_stopped());

        let err = coordinator.join().await.unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }

    #[tokio::test]
    async fn test_join_without_start() {
        let coordinator = TickerCoordinator::new(EmitFailurePolicy::FailFast);
        assert!(coordinator.join().await.unwrap().is_empty());
    }
}
