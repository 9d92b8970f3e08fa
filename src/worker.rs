//! The retrying consumer and its configuration.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelGateway, IncomingDelivery, QueueSpec};
use crate::connection::BrokerConnection;
use crate::dlq::{DeadLetterQueueHandler, QueueNames, RetryAction};
use crate::error::WorkerError;
use crate::handler::{DeliveryContext, MessageHandler, Verdict};
use crate::message::Payload;
use crate::retry::{RetryPolicy, RetryRoute};

/// Configuration for a [`RetryingConsumer`].
///
/// Use [`ConsumerConfig::builder`] to construct it.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// The queue to consume from; also its binding key on the exchange.
    pub queue_name: String,
    pub consumer_tag: String,
    pub retry_policy: RetryPolicy,
    /// Whether to declare the `<queue>.nack` delay queue.
    pub delay_queue: bool,
    pub dead_letter_queue: String,
    /// QoS prefetch count.
    pub prefetch_count: u16,
}

impl ConsumerConfig {
    /// Creates a new `ConsumerConfigBuilder` to start building the consumer configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The work queue to consume from. It is bound to the
    ///   connection's exchange under its own name.
    pub fn builder(queue_name: impl Into<String>) -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new(queue_name.into())
    }

    pub fn queue_names(&self) -> QueueNames {
        QueueNames::new(&self.queue_name).with_dead_letter(&self.dead_letter_queue)
    }
}

/// A builder for creating `ConsumerConfig` instances.
#[derive(Debug, Clone)]
pub struct ConsumerConfigBuilder {
    queue_name: String,
    consumer_tag: Option<String>,
    retry_policy: RetryPolicy,
    delay_queue: bool,
    dead_letter_queue: Option<String>,
    prefetch_count: u16,
}

impl ConsumerConfigBuilder {
    /// Creates a new builder with the required fields.
    fn new(queue_name: String) -> Self {
        Self {
            queue_name,
            consumer_tag: None,
            retry_policy: RetryPolicy::default(),
            delay_queue: true,
            dead_letter_queue: None,
            prefetch_count: 1,
        }
    }

    /// Replaces the whole retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Reschedules allowed before dead-lettering. Defaults to 5.
    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_policy.max_retries = count;
        self
    }

    /// TTL of the delay queue. Defaults to 60 seconds.
    pub fn retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_policy.retry_timeout = timeout;
        self
    }

    pub fn retry_route(mut self, route: RetryRoute) -> Self {
        self.retry_policy.route = route;
        self
    }

    /// Skips declaring the delay queue, e.g. when it is managed elsewhere.
    pub fn without_delay_queue(mut self) -> Self {
        self.delay_queue = false;
        self
    }

    /// Defaults to `<queue>.dlq`.
    pub fn dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queue = Some(name.into());
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer_{uuid}`, unique per consumer.
    ///
    /// **Warning:** every consumer on one connection shares a channel, and the
    /// broker closes a channel that sees the same tag twice.
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    /// Defaults to 1. Deliveries are still handled one at a time.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Builds the final `ConsumerConfig`, applying defaults for any unset options.
    ///
    /// # Returns
    /// `WorkerError::Configuration` when the queue name is empty, when a
    /// delayed route is asked for without the delay queue, or when the delay
    /// queue TTL is zero or does not fit in 32 bits of milliseconds.
    pub fn build(self) -> Result<ConsumerConfig, WorkerError> {
        if self.queue_name.trim().is_empty() {
            return Err("queue name must not be empty".into());
        }
        if self.retry_policy.route == RetryRoute::Delayed && !self.delay_queue {
            return Err(format!(
                "queue '{}': delayed retries need the delay queue, which is disabled",
                self.queue_name
            )
            .into());
        }
        if self.delay_queue {
            let ttl = self.retry_policy.retry_timeout_millis();
            if ttl == 0 || ttl > u64::from(u32::MAX) {
                return Err(format!("retry timeout of {}ms is out of range", ttl).into());
            }
        }

        let names = QueueNames::new(&self.queue_name);
        Ok(ConsumerConfig {
            consumer_tag: self
                .consumer_tag
                .unwrap_or_else(|| format!("{}_consumer_{}", self.queue_name, Uuid::new_v4().simple())),
            dead_letter_queue: self.dead_letter_queue.unwrap_or(names.dead_letter),
            retry_policy: self.retry_policy,
            delay_queue: self.delay_queue,
            prefetch_count: self.prefetch_count,
            queue_name: self.queue_name,
        })
    }
}

/// How one delivery was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rescheduled { attempt: u32 },
    DeadLettered,
    /// Body was not a JSON object; rejected without requeue.
    Dropped,
    /// Publishing the retry or dead-letter copy failed. The original was
    /// still acknowledged, so the message is lost.
    RoutingFailed { action: RetryAction },
}

/// Running counters for one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    rescheduled: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    routing_failures: AtomicU64,
    handler_panics: AtomicU64,
    last_routing_failure: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`ConsumerStats`], serializable for status endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub delivered: u64,
    pub acked: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub routing_failures: u64,
    pub handler_panics: u64,
    pub last_routing_failure: Option<DateTime<Utc>>,
}

impl ConsumerStats {
    fn record(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Acked => &self.acked,
            DeliveryOutcome::Rescheduled { .. } => &self.rescheduled,
            DeliveryOutcome::DeadLettered => &self.dead_lettered,
            DeliveryOutcome::Dropped => &self.dropped,
            DeliveryOutcome::RoutingFailed { .. } => {
                *self.last_routing_failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
                &self.routing_failures
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            last_routing_failure: *self.last_routing_failure.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// Consumes one work queue, handing each message to `H` and retrying or
/// dead-lettering failures.
pub struct RetryingConsumer<H: MessageHandler> {
    handler: Arc<H>,
    config: ConsumerConfig,
    gateway: ChannelGateway,
    exchange: String,
    dlq_handler: DeadLetterQueueHandler,
    stats: Arc<ConsumerStats>,
}

impl<H: MessageHandler + 'static> RetryingConsumer<H> {
    /// Creates a new consumer on the connection's shared channel.
    ///
    /// # Arguments
    /// * `connection` - Supplies the channel gateway and the exchange name.
    /// * `config` - Queue names, retry policy and consumer settings.
    /// * `handler` - The message handler implementation.
    pub fn new(connection: &BrokerConnection, config: ConsumerConfig, handler: Arc<H>) -> Self {
        let gateway = connection.gateway().clone();
        let exchange = connection.exchange().to_string();
        let dlq_handler = DeadLetterQueueHandler::new(
            gateway.clone(),
            exchange.clone(),
            config.queue_names(),
            config.retry_policy.clone(),
            config.delay_queue,
        );

        Self {
            handler,
            config,
            gateway,
            exchange,
            dlq_handler,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Declares the work queue, binds it, and declares the retry infrastructure.
    pub async fn setup_infrastructure(&self) -> Result<(), WorkerError> {
        let names = self.dlq_handler.names();
        let work_queue = QueueSpec::durable(&names.work).with_dead_letter(&self.exchange, &names.delay);

        self.gateway
            .declare_queue(&work_queue)
            .await
            .map_err(|e| WorkerError::declare(&names.work, e))?;

        self.gateway
            .bind_queue(&names.work, &self.exchange, &names.work)
            .await
            .map_err(|e| WorkerError::declare(format!("{} -> {}", self.exchange, names.work), e))?;

        self.dlq_handler.setup_infrastructure().await?;

        log::info!("Queue '{}' is set up and bound to exchange '{}'.", names.work, self.exchange);
        Ok(())
    }

    /// Sets up the queues, then runs the consume loop on the current task
    /// until `shutdown` is cancelled or the delivery stream ends.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        self.setup_infrastructure().await?;
        self.consume(shutdown).await
    }

    /// Sets up the queues on the caller's task, so setup errors surface here,
    /// then spawns the consume loop.
    ///
    /// # Arguments
    /// * `shutdown` - Cancelling it stops the loop once the delivery in
    ///   progress is resolved. Also handed to the handler via `DeliveryContext`.
    ///
    /// # Returns
    /// A `ConsumerHandle` for the spawned loop, or the declare/bind error
    /// that prevented setup.
    pub async fn start(self, shutdown: CancellationToken) -> Result<ConsumerHandle, WorkerError> {
        self.setup_infrastructure().await?;

        let stats = self.stats();
        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move { self.consume(task_shutdown).await });

        Ok(ConsumerHandle { task, shutdown, stats })
    }

    async fn consume(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let queue = &self.config.queue_name;

        self.gateway
            .set_prefetch(self.config.prefetch_count)
            .await
            .map_err(|e| WorkerError::declare(format!("{} qos", queue), e))?;

        let mut deliveries = self
            .gateway
            .consume(queue, &self.config.consumer_tag)
            .await
            .map_err(|source| WorkerError::Consume { queue: queue.clone(), source })?;

        log::info!(
            "Consumer '{}' started on '{}' with handler '{}'. Waiting for messages...",
            self.config.consumer_tag,
            queue,
            self.handler.handler_name()
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    log::info!("Consumer '{}' received shutdown signal.", self.config.consumer_tag);
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process_delivery(delivery, &shutdown).await;
                }
                Some(Err(source)) => {
                    log::error!("Delivery stream for '{}' failed: {}", queue, source);
                    return Err(WorkerError::Consume { queue: queue.clone(), source });
                }
                None => {
                    log::info!("Delivery stream for '{}' ended.", queue);
                    break;
                }
            }
        }

        log::info!("Consumer '{}' stopped.", self.config.consumer_tag);
        Ok(())
    }

    /// Resolves one delivery: ack, reschedule, dead-letter or drop.
    pub async fn process_delivery(&self, delivery: IncomingDelivery, shutdown: &CancellationToken) -> DeliveryOutcome {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        let delivery_tag = delivery.delivery_tag;

        let message = match Payload::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping undecodable message. Tag: {}, Error: {}", delivery_tag, e);
                if let Err(e) = self.gateway.reject(delivery_tag, false).await {
                    log::error!("Failed to reject message. Tag: {}, Error: {}", delivery_tag, e);
                }
                self.stats.record(DeliveryOutcome::Dropped);
                return DeliveryOutcome::Dropped;
            }
        };

        let context = DeliveryContext {
            queue: self.config.queue_name.clone(),
            delivery_tag,
            message_id: delivery.properties.message_id.clone(),
            attempt: delivery.properties.attempt(),
            redelivered: delivery.redelivered,
            shutdown: shutdown.clone(),
        };

        let verdict = match AssertUnwindSafe(self.handler.handle_message(message, &context))
            .catch_unwind()
            .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                log::error!(
                    "Handler '{}' panicked. Tag: {}",
                    self.handler.handler_name(),
                    delivery_tag
                );
                self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                Verdict::Failure
            }
        };

        let outcome = match verdict {
            Verdict::Success => DeliveryOutcome::Acked,
            Verdict::Failure => {
                log::error!(
                    "Failed to process message. Tag: {}, attempt: {}",
                    delivery_tag,
                    context.attempt
                );
                let action = self.dlq_handler.plan(&delivery);
                match self.dlq_handler.route(action, &delivery).await {
                    Ok(()) => match action {
                        RetryAction::ImmediateRetry { attempt } | RetryAction::DelayedRetry { attempt } => {
                            DeliveryOutcome::Rescheduled { attempt }
                        }
                        RetryAction::SentToDlq { .. } => DeliveryOutcome::DeadLettered,
                    },
                    Err(e) => {
                        log::error!("Message lost: {:?} failed. Tag: {}, Error: {}", action, delivery_tag, e);
                        DeliveryOutcome::RoutingFailed { action }
                    }
                }
            }
        };

        // The original is acked in every case so the broker never redelivers it on its own.
        if let Err(e) = self.gateway.ack(delivery_tag).await {
            log::error!("Failed to ack message. Tag: {}, Error: {}", delivery_tag, e);
        } else {
            log::debug!("Message resolved as {:?}. Tag: {}", outcome, delivery_tag);
        }

        self.stats.record(outcome);
        outcome
    }
}

/// A consume loop running on its own task.
pub struct ConsumerHandle {
    task: JoinHandle<Result<(), WorkerError>>,
    shutdown: CancellationToken,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Asks the loop to stop after the delivery in progress and waits for it.
    pub async fn stop(self) -> Result<(), WorkerError> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Waits for the loop to end on its own.
    pub async fn join(self) -> Result<(), WorkerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(format!("consumer task failed: {}", e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_builder_defaults() {
        let config = ConsumerConfig::builder("test_queue").build().unwrap();

        assert_eq!(config.queue_name, "test_queue");
        assert!(config.consumer_tag.starts_with("test_queue_consumer_"));
        assert_eq!(config.dead_letter_queue, "test_queue.dlq");
        assert_eq!(config.prefetch_count, 1);
        assert!(config.delay_queue);
        assert_eq!(config.retry_policy, RetryPolicy::default());
    }

    #[test]
    fn default_consumer_tags_are_unique() {
        let first = ConsumerConfig::builder("orders").build().unwrap();
        let second = ConsumerConfig::builder("orders").build().unwrap();

        assert_ne!(first.consumer_tag, second.consumer_tag);
    }

    #[test]
    fn test_consumer_config_builder_custom_values() {
        let config = ConsumerConfig::builder("test_queue")
            .consumer_tag("custom_consumer")
            .dead_letter_queue("parked")
            .retry_count(2)
            .retry_timeout(Duration::from_secs(5))
            .retry_route(RetryRoute::Delayed)
            .prefetch_count(10)
            .build()
            .unwrap();

        assert_eq!(config.consumer_tag, "custom_consumer");
        assert_eq!(config.dead_letter_queue, "parked");
        assert_eq!(config.retry_policy.max_retries, 2);
        assert_eq!(config.retry_policy.retry_timeout_millis(), 5_000);
        assert_eq!(config.retry_policy.route, RetryRoute::Delayed);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.queue_names().dead_letter, "parked");
    }

    #[test]
    fn delayed_route_requires_delay_queue() {
        let result = ConsumerConfig::builder("q")
            .retry_route(RetryRoute::Delayed)
            .without_delay_queue()
            .build();

        assert!(matches!(result, Err(WorkerError::Configuration { .. })));
    }

    #[test]
    fn ttl_must_fit_broker_range() {
        let zero = ConsumerConfig::builder("q").retry_timeout(Duration::ZERO).build();
        assert!(zero.is_err());

        let no_delay_queue = ConsumerConfig::builder("q")
            .retry_timeout(Duration::ZERO)
            .without_delay_queue()
            .build();
        assert!(no_delay_queue.is_ok());
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        assert!(ConsumerConfig::builder("  ").build().is_err());
    }

    #[test]
    fn stats_count_each_outcome() {
        let stats = ConsumerStats::default();
        stats.record(DeliveryOutcome::Acked);
        stats.record(DeliveryOutcome::Rescheduled { attempt: 1 });
        stats.record(DeliveryOutcome::RoutingFailed {
            action: RetryAction::SentToDlq { attempts: 3 },
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.rescheduled, 1);
        assert_eq!(snapshot.routing_failures, 1);
        assert!(snapshot.last_routing_failure.is_some());
        assert_eq!(snapshot.dead_lettered, 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["acked"], 1);
        assert!(json["last_routing_failure"].is_string());
    }
}
