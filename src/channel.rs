//! Broker-agnostic view of an AMQP channel and the gateway that serializes access to it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::Mutex;

use crate::error::ChannelError;

/// Header carrying the number of times a message has been rescheduled.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Routing type of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeType {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    Custom(String),
}

impl FromStr for ExchangeType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "direct" => ExchangeType::Direct,
            "fanout" => ExchangeType::Fanout,
            "topic" => ExchangeType::Topic,
            "headers" => ExchangeType::Headers,
            _ => ExchangeType::Custom(s.to_string()),
        })
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeType::Direct => f.write_str("direct"),
            ExchangeType::Fanout => f.write_str("fanout"),
            ExchangeType::Topic => f.write_str("topic"),
            ExchangeType::Headers => f.write_str("headers"),
            ExchangeType::Custom(kind) => f.write_str(kind),
        }
    }
}

/// Declaration of a durable queue and its dead-letter/TTL arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-message-ttl`, in milliseconds.
    pub message_ttl: Option<u64>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl.as_millis() as u64);
        self
    }
}

/// The subset of AMQP basic properties this crate reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Delivery mode 2.
    pub persistent: bool,
    /// Value of the `x-retry-count` header, if present and a non-negative integer.
    pub retry_count: Option<u32>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Attempt counter carried by the message; absent means 0.
    pub fn attempt(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }
}

/// One message handed to a consumer. Must be acked or rejected exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery, ChannelError>>;

/// Channel-level broker primitives used by the publisher and the consumer.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, name: &str, kind: &ExchangeType) -> Result<(), ChannelError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ChannelError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError>;

    /// Publishes without waiting for a publisher confirm. An empty `exchange`
    /// is the default exchange, which routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), ChannelError>;

    /// Starts a manual-ack, non-exclusive consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ChannelError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

/// Single synchronized path to a broker channel.
///
/// Every operation takes the same async lock, so publishes from a
/// [`Publisher`](crate::Publisher) never interleave with the consumer's
/// own acks and republishes on the wire.
#[derive(Clone)]
pub struct ChannelGateway {
    channel: Arc<dyn BrokerChannel>,
    lock: Arc<Mutex<()>>,
}

impl ChannelGateway {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn declare_exchange(&self, name: &str, kind: &ExchangeType) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.declare_exchange(name, kind).await
    }

    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.declare_queue(spec).await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.bind_queue(queue, exchange, routing_key).await
    }

    pub async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.set_prefetch(count).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.publish(exchange, routing_key, body, properties).await
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.consume(queue, consumer_tag).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.ack(delivery_tag).await
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.reject(delivery_tag, requeue).await
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        let _guard = self.lock.lock().await;
        self.channel.close().await
    }
}

impl fmt::Debug for ChannelGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGateway").finish_non_exhaustive()
    }
}
