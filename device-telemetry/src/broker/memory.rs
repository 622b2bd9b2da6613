//! In-process broker with topic-exchange routing.
//!
//! Used for local runs (`AMQP_URL=memory://`) and tests. Queues are
//! unbounded and each accepts a single consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::codec::{ContentType, encode_measurement};
use super::topology::topic_matches;
use super::{BrokerChannel, DeliverySource, DeliveryStream, Publisher, RawDelivery, Topology};
use crate::domain::{Measurement, RoutingKey};
use crate::{Error, Result};

struct BoundQueue {
    name: String,
    binding_key: String,
    sender: mpsc::UnboundedSender<RawDelivery>,
    receiver: Option<mpsc::UnboundedReceiver<RawDelivery>>,
}

impl BoundQueue {
    fn new(name: impl Into<String>, binding_key: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            binding_key: binding_key.into(),
            sender,
            receiver: Some(receiver),
        }
    }
}

/// In-memory stand-in for a broker channel.
pub struct InMemoryBroker {
    topology: Topology,
    content_type: ContentType,
    queues: Mutex<Vec<BoundQueue>>,
    closed: AtomicBool,
    published: AtomicU64,
    unroutable: AtomicU64,
}

impl InMemoryBroker {
    /// Create a broker with the topology's queue already declared and bound.
    pub fn new(topology: Topology, content_type: ContentType) -> Self {
        let queue = BoundQueue::new(topology.queue.clone(), topology.binding_key.clone());
        Self {
            topology,
            content_type,
            queues: Mutex::new(vec![queue]),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        }
    }

    /// Declare an additional queue bound to the exchange.
    #[cfg(test)]
    fn bind_queue(&self, queue: impl Into<String>, binding_key: impl Into<String>) {
        self.queues.lock().push(BoundQueue::new(queue, binding_key));
    }

    fn consume_queue(&self, queue: &str) -> Result<DeliveryStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChannelClosed("in-memory broker"));
        }

        let mut queues = self.queues.lock();
        let bound = queues
            .iter_mut()
            .find(|q| q.name == queue)
            .ok_or_else(|| Error::not_found("Queue", queue))?;
        let receiver = bound
            .receiver
            .take()
            .ok_or_else(|| Error::Broker(format!("queue {} already has a consumer", queue)))?;

        debug!(queue = %queue, "In-memory consumer registered");
        Ok(UnboundedReceiverStream::new(receiver).map(Ok).boxed())
    }

    /// Total accepted publishes.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publishes that matched no binding and were dropped.
    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish_measurement(
        &self,
        measurement: &Measurement,
        routing_key: &RoutingKey,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::publish(routing_key.as_str(), "channel closed"));
        }

        let body = encode_measurement(measurement)?;
        let delivery = RawDelivery {
            routing_key: routing_key.as_str().to_string(),
            content_type: Some(self.content_type.as_str().to_string()),
            body,
        };

        let mut routed = 0;
        for queue in self.queues.lock().iter() {
            if topic_matches(&queue.binding_key, routing_key.as_str()) {
                // A dropped consumer leaves the queue without a reader; the
                // message is lost exactly as an auto-acked delivery would be.
                let _ = queue.sender.send(delivery.clone());
                routed += 1;
            }
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        if routed == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(routing_key = %routing_key, "Unroutable measurement dropped");
        }
        trace!(routing_key = %routing_key, queues = routed, "Measurement routed");
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for InMemoryBroker {
    async fn register_consumer(&self) -> Result<DeliveryStream> {
        self.consume_queue(&self.topology.queue)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders ends every consumer stream.
        self.queues.lock().clear();
        debug!(
            published = self.published(),
            unroutable = self.unroutable(),
            "In-memory broker closed"
        );
        Ok(())
    }
}
