//! One handle bundling the connection, a publisher and consumer construction.

use std::sync::Arc;

use serde::Serialize;

use crate::channel::BrokerChannel;
use crate::config::ConnectionConfig;
use crate::connection::BrokerConnection;
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::publisher::{PublishOptions, PublishReceipt, Publisher};
use crate::retry::RetryPolicy;
use crate::worker::{ConsumerConfig, ConsumerConfigBuilder, RetryingConsumer};

/// Entry point for applications: connect once, then publish and consume.
///
/// ```no_run
/// use rabbitmq_retry::{Client, ConnectionConfig, PublishOptions};
///
/// # async fn demo() -> Result<(), rabbitmq_retry::WorkerError> {
/// let client = Client::connect(&ConnectionConfig::from_env()?, "billing").await?;
/// client.publish("invoices", &serde_json::json!({"id": 1}), PublishOptions::default()).await?;
/// client.close().await
/// # }
/// ```
pub struct Client {
    connection: BrokerConnection,
    publisher: Publisher,
    default_policy: RetryPolicy,
}

impl Client {
    /// Connects to the broker and declares the shared exchange.
    ///
    /// # Arguments
    /// * `config` - Broker URL and exchange settings.
    /// * `name` - Client connection name shown in the broker's management UI.
    pub async fn connect(config: &ConnectionConfig, name: &str) -> Result<Self, WorkerError> {
        let connection = BrokerConnection::connect(config, name).await?;
        Ok(Self::from_connection(connection))
    }

    /// Builds a client over an already open channel, such as the in-memory
    /// broker behind the `test-util` feature.
    pub async fn with_channel(
        config: &ConnectionConfig,
        channel: Arc<dyn BrokerChannel>,
        name: &str,
    ) -> Result<Self, WorkerError> {
        let connection = BrokerConnection::with_channel(config, channel, name).await?;
        Ok(Self::from_connection(connection))
    }

    fn from_connection(connection: BrokerConnection) -> Self {
        let publisher = Publisher::new(&connection);
        Self {
            connection,
            publisher,
            default_policy: RetryPolicy::default(),
        }
    }

    /// Policy applied to builders returned by [`queue`](Self::queue).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Publishes `payload` as JSON under the routing key `queue`.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<PublishReceipt, WorkerError> {
        self.publisher.send(queue, payload, options).await
    }

    /// Starts a consumer configuration for `queue` with the client's retry policy.
    pub fn queue(&self, name: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfig::builder(name).retry_policy(self.default_policy.clone())
    }

    pub fn consumer<H: MessageHandler + 'static>(&self, config: ConsumerConfig, handler: Arc<H>) -> RetryingConsumer<H> {
        RetryingConsumer::new(&self.connection, config, handler)
    }

    pub async fn close(&self) -> Result<(), WorkerError> {
        self.connection.close().await
    }
}
