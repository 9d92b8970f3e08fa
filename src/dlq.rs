//! Dead Letter Queue (DLQ) and retry scheduling logic.

use crate::channel::{ChannelGateway, IncomingDelivery, MessageProperties, QueueSpec, JSON_CONTENT_TYPE};
use crate::error::WorkerError;
use crate::retry::{RetryDecision, RetryPolicy, RetryRoute};

/// Names of the queues that make up one logical topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueNames {
    pub work: String,
    /// TTL queue that dead-letters back into the work queue.
    pub delay: String,
    /// Terminal queue. Nothing reads from it automatically.
    pub dead_letter: String,
}

impl QueueNames {
    pub fn new(work: &str) -> Self {
        Self {
            work: work.to_string(),
            delay: format!("{}.nack", work),
            dead_letter: format!("{}.dlq", work),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: impl Into<String>) -> Self {
        self.dead_letter = dead_letter.into();
        self
    }
}

/// What to do with a delivery whose handler reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Republish to the work queue through the shared exchange.
    ImmediateRetry { attempt: u32 },
    /// Park in the delay queue until its TTL sends it back.
    DelayedRetry { attempt: u32 },
    /// Retries exhausted after `attempts` reschedules.
    SentToDlq { attempts: u32 },
}

/// Declares the retry/dead-letter queues of one work queue and routes
/// failed deliveries into them.
#[derive(Clone, Debug)]
pub struct DeadLetterQueueHandler {
    gateway: ChannelGateway,
    exchange: String,
    names: QueueNames,
    policy: RetryPolicy,
    delay_queue: bool,
}

impl DeadLetterQueueHandler {
    pub fn new(
        gateway: ChannelGateway,
        exchange: impl Into<String>,
        names: QueueNames,
        policy: RetryPolicy,
        delay_queue: bool,
    ) -> Self {
        Self {
            gateway,
            exchange: exchange.into(),
            names,
            policy,
            delay_queue,
        }
    }

    pub fn names(&self) -> &QueueNames {
        &self.names
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Spec of the delay queue: expired messages return to the work queue.
    pub fn delay_queue_spec(&self) -> QueueSpec {
        QueueSpec::durable(&self.names.delay)
            .with_dead_letter(&self.exchange, &self.names.work)
            .with_message_ttl(self.policy.retry_timeout)
    }

    /// Declares the delay queue (unless disabled) and the dead-letter queue.
    pub async fn setup_infrastructure(&self) -> Result<(), WorkerError> {
        if self.delay_queue {
            self.gateway
                .declare_queue(&self.delay_queue_spec())
                .await
                .map_err(|e| WorkerError::declare(&self.names.delay, e))?;
        }

        self.gateway
            .declare_queue(&QueueSpec::durable(&self.names.dead_letter))
            .await
            .map_err(|e| WorkerError::declare(&self.names.dead_letter, e))?;

        log::info!(
            "Retry infrastructure ready for '{}' (delay queue: {}, dead-letter queue: '{}').",
            self.names.work,
            if self.delay_queue { self.names.delay.as_str() } else { "disabled" },
            self.names.dead_letter
        );
        Ok(())
    }

    /// Decides between retry and dead-lettering from the delivery's attempt counter.
    pub fn plan(&self, delivery: &IncomingDelivery) -> RetryAction {
        let attempt = delivery.properties.attempt();
        match self.policy.decide(attempt) {
            RetryDecision::Reschedule { next_attempt } => match self.policy.route {
                RetryRoute::Immediate => RetryAction::ImmediateRetry { attempt: next_attempt },
                RetryRoute::Delayed => RetryAction::DelayedRetry { attempt: next_attempt },
            },
            RetryDecision::DeadLetter => RetryAction::SentToDlq { attempts: attempt },
        }
    }

    /// Publishes the delivery's body where `action` says. Does not ack.
    pub async fn route(&self, action: RetryAction, delivery: &IncomingDelivery) -> Result<(), WorkerError> {
        match action {
            RetryAction::ImmediateRetry { attempt } => {
                self.publish(&self.exchange, &self.names.work, delivery, attempt).await?;
                log::info!("Message requeued to '{}' (attempt {}).", self.names.work, attempt);
            }
            RetryAction::DelayedRetry { attempt } => {
                self.publish("", &self.names.delay, delivery, attempt).await?;
                log::info!(
                    "Message parked in '{}' for {:?} (attempt {}).",
                    self.names.delay,
                    self.policy.retry_timeout,
                    attempt
                );
            }
            RetryAction::SentToDlq { attempts } => {
                self.publish("", &self.names.dead_letter, delivery, attempts).await?;
                log::warn!(
                    "Message sent to '{}' after exhausting {} retries.",
                    self.names.dead_letter,
                    self.policy.max_retries
                );
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        delivery: &IncomingDelivery,
        retry_count: u32,
    ) -> Result<(), WorkerError> {
        let properties = MessageProperties {
            content_type: Some(
                delivery
                    .properties
                    .content_type
                    .clone()
                    .unwrap_or_else(|| JSON_CONTENT_TYPE.to_string()),
            ),
            message_id: delivery.properties.message_id.clone(),
            persistent: true,
            retry_count: Some(retry_count),
        };

        self.gateway
            .publish(exchange, routing_key, &delivery.body, &properties)
            .await
            .map_err(|e| WorkerError::publish(routing_key, e))
    }
}
