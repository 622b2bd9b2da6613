//! Measurement consumer: broker deliveries in, decoded measurements out.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::broker::{DeliveryStream, decode_measurement};
use crate::config::DecodeFailurePolicy;
use crate::domain::Measurement;

/// Why the consume loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    /// The broker closed the delivery stream.
    StreamEnded,
    /// The writer dropped its receiver.
    WriterClosed,
    /// The cancellation token fired.
    Cancelled,
}

/// Counters reported when the consume loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    pub exit: ConsumerExit,
    pub forwarded: u64,
    pub skipped: u64,
}

/// Drains a delivery stream and forwards each decoded measurement.
pub struct MeasurementConsumer {
    deliveries: DeliveryStream,
    policy: DecodeFailurePolicy,
}

impl MeasurementConsumer {
    pub fn new(deliveries: DeliveryStream, policy: DecodeFailurePolicy) -> Self {
        Self { deliveries, policy }
    }

    /// Run until the stream ends, the writer goes away, or `cancel` fires.
    ///
    /// Deliveries are already acknowledged by the broker, so anything
    /// dropped here is lost.
    pub async fn run(
        mut self,
        sink: mpsc::Sender<Measurement>,
        cancel: CancellationToken,
    ) -> Result<ConsumerReport> {
        let mut forwarded = 0u64;
        let mut skipped = 0u64;

        info!(policy = ?self.policy, "Measurement consumer started");

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ConsumerExit::Cancelled,
                next = self.deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream error");
                    return Err(e);
                }
                None => break ConsumerExit::StreamEnded,
            };

            let measurement = match decode_measurement(&delivery.body) {
                Ok(m) => m,
                Err(e) => match self.policy {
                    DecodeFailurePolicy::Skip => {
                        skipped += 1;
                        warn!(
                            routing_key = %delivery.routing_key,
                            error = %e,
                            "Skipping undecodable delivery"
                        );
                        continue;
                    }
                    DecodeFailurePolicy::FailFast => return Err(e),
                },
            };

            debug!(
                device_id = %measurement.device_id,
                value = measurement.value,
                "Measurement received"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break ConsumerExit::Cancelled,
                sent = sink.send(measurement) => {
                    if sent.is_err() {
                        break ConsumerExit::WriterClosed;
                    }
                    forwarded += 1;
                }
            }
        };

        info!(?exit, forwarded, skipped, "Measurement consumer stopped");
        Ok(ConsumerReport {
            exit,
            forwarded,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::broker::{RawDelivery, encode_measurement};
    use futures::stream;
    use std::time::Duration;

    fn delivery(body: Vec<u8>) -> Result<RawDelivery> {
        Ok(RawDelivery {
            routing_key: "d1".to_string(),
            content_type: Some("application/json".to_string()),
            body,
        })
    }

    fn encoded(id: &str, value: f64) -> Result<RawDelivery> {
        delivery(encode_measurement(&Measurement::new(id, value)).unwrap())
    }

    #[tokio::test]
    async fn test_forwards_decoded_measurements_in_order() {
        let deliveries = stream::iter(vec![encoded("d1", 1.0), encoded("d1", 2.0)]).boxed();
        let (tx, mut rx) = mpsc::channel(8);

        let report = MeasurementConsumer::new(deliveries, DecodeFailurePolicy::Skip)
            .run(tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.exit, ConsumerExit::StreamEnded);
        assert_eq!(report.forwarded, 2);
        assert_eq!(rx.recv().await.unwrap().value, 1.0);
        assert_eq!(rx.recv().await.unwrap().value, 2.0);
    }

    #[tokio::test]
    async fn test_skip_policy_drops_garbage() {
        let deliveries = stream::iter(vec![
            delivery(b"not json".to_vec()),
            encoded("d2", 24.34),
        ])
        .boxed();
        let (tx, mut rx) = mpsc::channel(8);

        let report = MeasurementConsumer::new(deliveries, DecodeFailurePolicy::Skip)
            .run(tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.forwarded, 1);
        assert_eq!(rx.recv().await.unwrap(), Measurement::new("d2", 24.34));
    }

    #[tokio::test]
    async fn test_fail_fast_policy_ends_loop() {
        let deliveries = stream::iter(vec![delivery(b"{}".to_vec()), encoded("d1", 1.0)]).boxed();
        let (tx, mut rx) = mpsc::channel(8);

        let err = MeasurementConsumer::new(deliveries, DecodeFailurePolicy::FailFast)
            .run(tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Decode(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_gone_ends_loop() {
        let deliveries = stream::iter(vec![encoded("d1", 1.0)]).boxed();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let report = MeasurementConsumer::new(deliveries, DecodeFailurePolicy::Skip)
            .run(tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.exit, ConsumerExit::WriterClosed);
    }

    #[tokio::test]
    async fn test_cancel_ends_pending_loop() {
        let deliveries = stream::pending::<Result<RawDelivery>>().boxed();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            MeasurementConsumer::new(deliveries, DecodeFailurePolicy::Skip).run(tx, cancel.clone()),
        );
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.exit, ConsumerExit::Cancelled);
    }
}
