use std::fmt;

use thiserror::Error;

/// Failure of a single operation on the broker channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Error originating from the underlying `lapin` library.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The channel (or the connection behind it) has been closed.
    #[error("channel is closed")]
    Closed,

    #[error("no queue named '{0}'")]
    UnknownQueue(String),

    #[error("no exchange named '{0}'")]
    UnknownExchange(String),

    /// An ack or reject referenced a delivery that is not outstanding.
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The broker refused a declaration that conflicts with an existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

/// Step of connection setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Dial,
    OpenChannel,
    DeclareExchange,
    Close,
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            ConnectionStage::Dial => "connect to RabbitMQ",
            ConnectionStage::OpenChannel => "open a channel",
            ConnectionStage::DeclareExchange => "declare the exchange",
            ConnectionStage::Close => "close the connection",
        };
        f.write_str(stage)
    }
}

/// Generic error type for the library.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Connection setup or teardown failed. Fatal: there is no automatic reconnect.
    #[error("failed to {stage}: {source}")]
    Connection {
        stage: ConnectionStage,
        #[source]
        source: ChannelError,
    },

    /// Queue declaration, binding or QoS setup failed for a consumer.
    #[error("failed to declare '{target}': {source}")]
    Declare {
        target: String,
        #[source]
        source: ChannelError,
    },

    /// Starting or reading the delivery stream failed.
    #[error("consumer on queue '{queue}' failed: {source}")]
    Consume {
        queue: String,
        #[source]
        source: ChannelError,
    },

    /// Payload could not be encoded or decoded as JSON.
    #[error("failed to (de)serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The channel refused a publish.
    #[error("failed to publish to '{routing_key}': {source}")]
    Publish {
        routing_key: String,
        #[source]
        source: ChannelError,
    },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl WorkerError {
    pub(crate) fn connection(stage: ConnectionStage, source: impl Into<ChannelError>) -> Self {
        WorkerError::Connection { stage, source: source.into() }
    }

    pub(crate) fn declare(target: impl Into<String>, source: ChannelError) -> Self {
        WorkerError::Declare { target: target.into(), source }
    }

    pub(crate) fn publish(routing_key: impl Into<String>, source: ChannelError) -> Self {
        WorkerError::Publish { routing_key: routing_key.into(), source }
    }
}

impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::Configuration { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::Configuration { message: s }
    }
}

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_name_the_failing_stage() {
        let dial = WorkerError::connection(ConnectionStage::Dial, ChannelError::Closed);
        let exchange = WorkerError::connection(ConnectionStage::DeclareExchange, ChannelError::Closed);

        assert_eq!(dial.to_string(), "failed to connect to RabbitMQ: channel is closed");
        assert_eq!(exchange.to_string(), "failed to declare the exchange: channel is closed");
        assert!(matches!(dial, WorkerError::Connection { stage: ConnectionStage::Dial, .. }));
    }

    #[test]
    fn string_converts_into_configuration_error() {
        let err = WorkerError::from("queue name must not be empty");
        assert!(matches!(err, WorkerError::Configuration { .. }));
    }
}
