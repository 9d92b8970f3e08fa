//! Broker connection: one network connection, one channel, one exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::{Connection, ConnectionProperties};

use crate::amqp::LapinChannel;
use crate::channel::{BrokerChannel, ChannelGateway};
use crate::config::ConnectionConfig;
use crate::error::{ChannelError, ConnectionStage, WorkerError};

const REPLY_SUCCESS: u16 = 200;

/// Owns the connection and the channel shared by publishers and consumers.
pub struct BrokerConnection {
    connection: Option<Connection>,
    gateway: ChannelGateway,
    exchange: String,
    name: String,
    closed: AtomicBool,
}

impl BrokerConnection {
    /// Dials the broker with `name` as client connection name, opens a
    /// channel and declares the configured exchange as durable.
    pub async fn connect(config: &ConnectionConfig, name: &str) -> Result<Self, WorkerError> {
        log::info!("Connecting to RabbitMQ as '{}'...", name);

        let properties = ConnectionProperties::default().with_connection_name(name.into());
        let connection = Connection::connect(&config.uri, properties).await.map_err(|e| {
            log::error!("Failed to connect to RabbitMQ: {}", e);
            WorkerError::connection(ConnectionStage::Dial, e)
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| WorkerError::connection(ConnectionStage::OpenChannel, e))?;

        let mut broker = Self::with_channel(config, Arc::new(LapinChannel::new(channel)), name).await?;
        broker.connection = Some(connection);
        Ok(broker)
    }

    /// Same as [`connect`](Self::connect) over an already open channel.
    pub async fn with_channel(
        config: &ConnectionConfig,
        channel: Arc<dyn BrokerChannel>,
        name: &str,
    ) -> Result<Self, WorkerError> {
        let gateway = ChannelGateway::new(channel);
        gateway
            .declare_exchange(&config.exchange, &config.exchange_type)
            .await
            .map_err(|e| WorkerError::connection(ConnectionStage::DeclareExchange, e))?;

        log::info!(
            "Connection '{}' ready, exchange '{}' ({}) declared.",
            name,
            config.exchange,
            config.exchange_type
        );

        Ok(Self {
            connection: None,
            gateway,
            exchange: config.exchange.clone(),
            name: name.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn gateway(&self) -> &ChannelGateway {
        &self.gateway
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the channel, then the connection. Fails if already closed.
    pub async fn close(&self) -> Result<(), WorkerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::connection(ConnectionStage::Close, ChannelError::Closed));
        }

        self.gateway
            .close()
            .await
            .map_err(|e| WorkerError::connection(ConnectionStage::Close, e))?;

        if let Some(connection) = &self.connection {
            connection
                .close(REPLY_SUCCESS, "connection closed")
                .await
                .map_err(|e| WorkerError::connection(ConnectionStage::Close, e))?;
        }

        log::info!("Connection '{}' closed.", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ExchangeType;
    use crate::memory::InMemoryBroker;

    #[tokio::test]
    async fn declares_durable_exchange_with_configured_type() {
        let broker = InMemoryBroker::new();
        let config = ConnectionConfig::new("amqp://unused", "events").with_exchange_type(ExchangeType::Direct);

        let connection = BrokerConnection::with_channel(&config, Arc::new(broker.clone()), "test")
            .await
            .unwrap();

        assert_eq!(connection.exchange(), "events");
        assert_eq!(broker.exchange_type("events"), Some(ExchangeType::Direct));
    }

    #[tokio::test]
    async fn exchange_declare_failure_is_a_connection_error() {
        let broker = InMemoryBroker::new();
        broker.declare_exchange("events", &ExchangeType::Fanout).await.unwrap();
        let config = ConnectionConfig::new("amqp://unused", "events");

        let result = BrokerConnection::with_channel(&config, Arc::new(broker), "test").await;

        assert!(matches!(
            result,
            Err(WorkerError::Connection { stage: ConnectionStage::DeclareExchange, .. })
        ));
    }

    #[tokio::test]
    async fn second_close_is_an_error() {
        let broker = InMemoryBroker::new();
        let config = ConnectionConfig::new("amqp://unused", "events");
        let connection = BrokerConnection::with_channel(&config, Arc::new(broker.clone()), "test")
            .await
            .unwrap();

        connection.close().await.unwrap();
        assert!(broker.is_closed());

        assert!(matches!(
            connection.close().await,
            Err(WorkerError::Connection { stage: ConnectionStage::Close, .. })
        ));
    }
}
