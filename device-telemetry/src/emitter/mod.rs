//! Periodic measurement emission.
//!
//! One [`DeviceEmitter`] task per device ticks on its own timer and hands a
//! [`Measurement`](crate::domain::Measurement) to the shared publisher. The
//! [`TickerCoordinator`] spawns them, owns the broadcast stop token, and
//! supervises them for fatal failures.

mod coordinator;
mod device;

pub use coordinator::TickerCoordinator;
pub use device::{DeviceEmitter, EmitterReport};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::broker::Publisher;
    use crate::domain::{Measurement, RoutingKey};
    use crate::{Error, Result};

    /// Publisher that records every call on a channel.
    pub struct RecordingPublisher {
        tx: mpsc::UnboundedSender<(Measurement, RoutingKey)>,
    }

    impl RecordingPublisher {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<(Measurement, RoutingKey)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_measurement(
            &self,
            measurement: &Measurement,
            routing_key: &RoutingKey,
        ) -> Result<()> {
            let _ = self.tx.send((measurement.clone(), routing_key.clone()));
            Ok(())
        }
    }

    /// Publisher whose every call fails.
    #[derive(Default)]
    pub struct FailingPublisher {
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish_measurement(
            &self,
            _measurement: &Measurement,
            routing_key: &RoutingKey,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::publish(routing_key.as_str(), "broker unavailable"))
        }
    }
}
