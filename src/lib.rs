//! # RabbitMQ Retry
//! Publishing and consuming JSON messages on RabbitMQ with bounded retries
//! and a terminal dead-letter queue.
//!
//! Failed messages are republished with an incremented `x-retry-count`
//! header, either straight back to the work queue or through a TTL delay
//! queue, until the retry budget runs out and they are parked in `<queue>.dlq`.

pub mod amqp;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod dlq;
pub mod error;
pub mod handler;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod worker;

// Re-export key components for easy access
pub use amqp::LapinChannel;
pub use channel::{BrokerChannel, ChannelGateway, ExchangeType, IncomingDelivery, MessageProperties, QueueSpec};
pub use client::Client;
pub use config::ConnectionConfig;
pub use connection::BrokerConnection;
pub use dlq::{DeadLetterQueueHandler, QueueNames, RetryAction};
pub use error::{ChannelError, ConnectionStage, WorkerError};
pub use handler::{handler_fn, DeliveryContext, MessageHandler, Verdict};
pub use message::{FieldError, Payload};
pub use publisher::{PublishOptions, PublishReceipt, Publisher};
pub use retry::{RetryPolicy, RetryRoute};
pub use worker::{ConsumerConfig, ConsumerConfigBuilder, ConsumerHandle, ConsumerStats, DeliveryOutcome, RetryingConsumer, StatsSnapshot};
pub use tokio_util::sync::CancellationToken;
