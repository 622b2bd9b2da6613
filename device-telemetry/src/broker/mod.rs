//! Broker plumbing: the publish capability used by emitters, the delivery
//! source drained by the consumer, and the two channel implementations.
//!
//! ```text
//! DeviceEmitter --publish--> [exchange "measurements" (topic)]
//!                                   | binding "#"
//!                                   v
//!                            [queue "devices"] --deliveries--> MeasurementConsumer
//! ```

mod amqp;
mod codec;
mod memory;
mod topology;

pub use amqp::AmqpBrokerChannel;
pub use codec::{ContentType, decode_measurement, encode_measurement};
pub use memory::InMemoryBroker;
pub use topology::{Topology, topic_matches};

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::info;

use crate::Result;
use crate::config::BrokerConfig;
use crate::domain::{Measurement, RoutingKey};

/// A message as handed over by the broker, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub routing_key: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Lazy, unbounded sequence of deliveries from the bound queue.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Capability to forward a measurement to the broker exchange.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Serialize and publish `measurement` under `routing_key`.
    ///
    /// Returns once the broker has accepted the publish; delivery is not
    /// confirmed.
    async fn publish_measurement(
        &self,
        measurement: &Measurement,
        routing_key: &RoutingKey,
    ) -> Result<()>;
}

/// Source of raw deliveries from the measurement queue.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Start consuming the queue. Deliveries are auto-acknowledged.
    async fn register_consumer(&self) -> Result<DeliveryStream>;
}

/// A connected broker channel with its topology declared.
#[async_trait]
pub trait BrokerChannel: Publisher + DeliverySource {
    fn topology(&self) -> &Topology;

    /// Release the channel and connection.
    async fn close(&self) -> Result<()>;
}

/// Connect to the configured broker and declare the topology.
///
/// `memory://` URLs select the in-process broker; anything else is treated
/// as an AMQP URI. Any failure here is fatal for pipeline startup.
pub async fn connect(config: &BrokerConfig) -> Result<Arc<dyn BrokerChannel>> {
    if config.is_memory() {
        info!(
            exchange = %config.topology.exchange,
            queue = %config.topology.queue,
            "Using in-memory broker"
        );
        return Ok(Arc::new(InMemoryBroker::new(
            config.topology.clone(),
            config.content_type,
        )));
    }

    let channel = AmqpBrokerChannel::connect(config).await?;
    Ok(Arc::new(channel))
}
