//! RabbitMQ channel over AMQP 0-9-1.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, trace, warn};

use super::codec::{ContentType, encode_measurement};
use super::{BrokerChannel, DeliverySource, DeliveryStream, Publisher, RawDelivery, Topology};
use crate::config::BrokerConfig;
use crate::domain::{Measurement, RoutingKey};
use crate::{Error, Result};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Consumer tag prefix; a random suffix keeps tags unique per connection.
const CONSUMER_TAG_PREFIX: &str = "device-telemetry";

/// Connection, channel, and declared topology for one broker.
///
/// The channel is shared by every emitter; lapin serializes publishes on it.
pub struct AmqpBrokerChannel {
    connection: Connection,
    channel: Channel,
    topology: Topology,
    content_type: ContentType,
}

impl AmqpBrokerChannel {
    /// Connect and declare exchange, queue, binding, and prefetch.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(Error::config("broker URL must not be empty"));
        }

        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                Error::Broker(format!("couldn't connect to {}: {}", redact(&config.url), e))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::topology("open channel", e))?;

        let topology = config.topology.clone();
        declare_topology(&channel, &topology, config.prefetch).await?;

        info!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            binding = %topology.binding_key,
            prefetch = config.prefetch,
            "AMQP topology declared"
        );

        Ok(Self {
            connection,
            channel,
            topology,
            content_type: config.content_type,
        })
    }
}

async fn declare_topology(channel: &Channel, topology: &Topology, prefetch: u16) -> Result<()> {
    channel
        .exchange_declare(
            &topology.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::topology("declare exchange", e))?;

    channel
        .queue_declare(
            &topology.queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::topology("declare queue", e))?;

    channel
        .queue_bind(
            &topology.queue,
            &topology.exchange,
            &topology.binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| Error::topology("bind queue", e))?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .map_err(|e| Error::topology("set prefetch", e))?;

    Ok(())
}

/// Strip credentials from an AMQP URI for logging.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<invalid url>".to_string(),
    }
}

#[async_trait]
impl Publisher for AmqpBrokerChannel {
    async fn publish_measurement(
        &self,
        measurement: &Measurement,
        routing_key: &RoutingKey,
    ) -> Result<()> {
        let body = encode_measurement(measurement)?;

        // The returned confirm is dropped: acceptance by the broker is enough.
        self.channel
            .basic_publish(
                &self.topology.exchange,
                routing_key.as_str(),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type(self.content_type.as_str().into()),
            )
            .await
            .map_err(|e| Error::publish(routing_key.as_str(), e))?;

        trace!(routing_key = %routing_key, value = measurement.value, "Measurement published");
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for AmqpBrokerChannel {
    async fn register_consumer(&self) -> Result<DeliveryStream> {
        let tag = format!("{}-{}", CONSUMER_TAG_PREFIX, uuid::Uuid::new_v4().simple());
        let consumer = self
            .channel
            .basic_consume(
                &self.topology.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("failed to register consumer: {}", e)))?;

        debug!(queue = %self.topology.queue, consumer_tag = %tag, "Consumer registered");

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| RawDelivery {
                    routing_key: d.routing_key.as_str().to_string(),
                    content_type: d
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|c| c.as_str().to_string()),
                    body: d.data,
                })
                .map_err(Error::from)
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl BrokerChannel for AmqpBrokerChannel {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
            warn!(error = %e, "Failed to close AMQP channel");
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(Error::from)?;
        info!("AMQP connection closed");
        Ok(())
    }
}
