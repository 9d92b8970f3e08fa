//! Publishing JSON messages onto the shared exchange.

use serde::Serialize;
use uuid::Uuid;

use crate::channel::{ChannelGateway, MessageProperties};
use crate::connection::BrokerConnection;
use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Mark the message persistent (delivery mode 2).
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// Proof that the channel accepted a publish. Not a broker confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub routing_key: String,
    pub size: usize,
}

/// Sends messages to the connection's exchange. Holds no retry logic.
#[derive(Debug, Clone)]
pub struct Publisher {
    gateway: ChannelGateway,
    exchange: String,
}

impl Publisher {
    pub fn new(connection: &BrokerConnection) -> Self {
        Self {
            gateway: connection.gateway().clone(),
            exchange: connection.exchange().to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Serializes `payload` as JSON and publishes it under `routing_key`.
    ///
    /// # Arguments
    /// * `routing_key` - Routing key on the shared exchange, usually the target queue name.
    /// * `payload` - Any serializable value; consumers expect a JSON object.
    /// * `options` - Delivery options, persistent by default.
    ///
    /// # Returns
    /// A `PublishReceipt` with the generated message id once the channel has
    /// accepted the message. Serialization errors are returned before the
    /// broker is contacted.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<PublishReceipt, WorkerError> {
        let body = serde_json::to_vec(payload)?;
        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties::json()
            .persistent(options.persistent)
            .with_message_id(message_id.clone());

        if let Err(e) = self.gateway.publish(&self.exchange, routing_key, &body, &properties).await {
            log::error!("Couldn't send message to '{}', buffer size: {}", routing_key, body.len());
            return Err(WorkerError::publish(routing_key, e));
        }

        log::debug!("Message {} sent to '{}', buffer size: {}", message_id, routing_key, body.len());
        Ok(PublishReceipt {
            message_id,
            routing_key: routing_key.to_string(),
            size: body.len(),
        })
    }
}
