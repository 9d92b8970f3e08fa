//! In-process broker implementing [`BrokerChannel`].
//!
//! Honours the parts of the AMQP contract the retry pipeline depends on:
//! exchange routing (default, direct, fanout, topic), queue arguments for
//! dead-lettering and TTL, delivery tags with ack/reject bookkeeping, and
//! round-robin dispatch between consumers of one queue. TTL expiry is not
//! clock driven; call [`InMemoryBroker::expire`] to dead-letter everything
//! waiting in a queue, as the broker would once the TTL elapses.
//!
//! Intended for tests of consumers and handlers without a running RabbitMQ;
//! compiled only with the `test-util` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::channel::{BrokerChannel, DeliveryStream, ExchangeType, IncomingDelivery, MessageProperties, QueueSpec};
use crate::error::ChannelError;

/// A message as stored in a queue or recorded in the publish log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConsumerSlot {
    tag: String,
    sender: mpsc::UnboundedSender<IncomingDelivery>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<(BrokerMessage, bool)>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }
}

struct Outstanding {
    queue: String,
    message: BrokerMessage,
}

#[derive(Default)]
struct BrokerState {
    closed: bool,
    exchanges: HashMap<String, ExchangeType>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    unacked: HashMap<u64, Outstanding>,
    next_tag: u64,
    published: Vec<BrokerMessage>,
    acked: Vec<u64>,
    rejected: Vec<(u64, bool)>,
    failing_publishes: usize,
    prefetch: Option<u16>,
}

impl BrokerState {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.closed {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: BrokerMessage) -> Result<(), ChannelError> {
        if exchange.is_empty() {
            // Default exchange: unroutable messages are silently dropped.
            if self.queues.contains_key(routing_key) {
                self.enqueue(routing_key, message, false);
            }
            return Ok(());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownExchange(exchange.to_string()))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if binding_matches(&kind, &binding.routing_key, routing_key) && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        for queue in targets {
            self.enqueue(&queue, message.clone(), false);
        }
        Ok(())
    }

    fn enqueue(&mut self, queue_name: &str, message: BrokerMessage, redelivered: bool) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.ready.push_back((message, redelivered));
        }
        self.dispatch(queue_name);
    }

    /// Hands ready messages to consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() {
                return;
            }
            let Some((message, redelivered)) = queue.ready.pop_front() else {
                return;
            };

            self.next_tag += 1;
            let delivery_tag = self.next_tag;
            let delivery = IncomingDelivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };

            let mut delivered = false;
            while !queue.consumers.is_empty() {
                let index = queue.next_consumer % queue.consumers.len();
                if queue.consumers[index].sender.send(delivery.clone()).is_ok() {
                    queue.next_consumer = index + 1;
                    delivered = true;
                    break;
                }
                // Receiver dropped: the consumer is gone.
                queue.consumers.remove(index);
            }

            if !delivered {
                queue.ready.push_front((message, redelivered));
                return;
            }
            self.unacked.insert(
                delivery_tag,
                Outstanding {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
    }

    /// Applies the queue's `x-dead-letter-*` arguments to a message leaving it.
    fn dead_letter(&mut self, queue_name: &str, message: BrokerMessage) {
        let Some(spec) = self.queues.get(queue_name).map(|q| q.spec.clone()) else {
            return;
        };
        let Some(exchange) = spec.dead_letter_exchange else {
            return;
        };
        let routing_key = spec.dead_letter_routing_key.unwrap_or_else(|| message.routing_key.clone());
        let message = BrokerMessage {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            ..message
        };
        if let Err(e) = self.route(&exchange, &routing_key, message) {
            log::debug!("dead-lettered message from '{}' was dropped: {}", queue_name, e);
        }
    }
}

fn binding_matches(kind: &ExchangeType, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Fanout => true,
        ExchangeType::Topic => topic_matches(pattern, routing_key),
        _ => pattern == routing_key,
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Shared handle to an in-process broker. Clones observe the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Places a message straight into a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>, properties: MessageProperties) {
        let message = BrokerMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            body: body.into(),
            properties,
        };
        self.state().enqueue(queue, message, false);
    }

    /// Dead-letters every message waiting in `queue`, as TTL expiry would.
    /// Returns how many messages expired.
    pub fn expire(&self, queue: &str) -> usize {
        let mut state = self.state();
        let expired: Vec<BrokerMessage> = match state.queues.get_mut(queue) {
            Some(q) => q.ready.drain(..).map(|(message, _)| message).collect(),
            None => return 0,
        };
        let count = expired.len();
        for message in expired {
            state.dead_letter(queue, message);
        }
        count
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_publishes(&self, count: usize) {
        self.state().failing_publishes = count;
    }

    /// Messages currently waiting (not delivered) in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<BrokerMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|(message, _)| message.clone()).collect())
            .unwrap_or_default()
    }

    /// Every publish the channel accepted, in order.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.state().published.clone()
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    /// Rejected delivery tags with their `requeue` flag.
    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.state().rejected.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.state().queues.get(queue).map(|q| q.spec.clone())
    }

    pub fn exchange_type(&self, exchange: &str) -> Option<ExchangeType> {
        self.state().exchanges.get(exchange).cloned()
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key)
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.state().prefetch
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: &ExchangeType) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        match state.exchanges.get(name) {
            Some(existing) if existing != kind => Err(ChannelError::PreconditionFailed(format!(
                "exchange '{}' already declared as {}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(ChannelError::PreconditionFailed(format!(
                "queue '{}' already declared with different arguments",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        if !state.queues.contains_key(queue) {
            return Err(ChannelError::UnknownQueue(queue.to_string()));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(ChannelError::UnknownExchange(exchange.to_string()));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.prefetch = Some(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(ChannelError::PreconditionFailed("publish refused".to_string()));
        }

        let message = BrokerMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        };
        state.route(exchange, routing_key, message.clone())?;
        state.published.push(message);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        if !state.queues.contains_key(queue) {
            return Err(ChannelError::UnknownQueue(queue.to_string()));
        }
        // Consumer tags are unique per channel, across all queues.
        let tag_in_use = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter())
            .any(|c| c.tag == consumer_tag && !c.sender.is_closed());
        if tag_in_use {
            return Err(ChannelError::PreconditionFailed(format!(
                "consumer tag '{}' is already in use on this channel",
                consumer_tag
            )));
        }
        for q in state.queues.values_mut() {
            q.consumers.retain(|c| !c.sender.is_closed());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                sender,
            }),
            None => return Err(ChannelError::UnknownQueue(queue.to_string())),
        }
        state.dispatch(queue);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        });
        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or(ChannelError::UnknownDeliveryTag(delivery_tag))?;
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        let outstanding = state
            .unacked
            .remove(&delivery_tag)
            .ok_or(ChannelError::UnknownDeliveryTag(delivery_tag))?;
        state.rejected.push((delivery_tag, requeue));

        if requeue {
            if let Some(queue) = state.queues.get_mut(&outstanding.queue) {
                queue.ready.push_front((outstanding.message, true));
            }
            state.dispatch(&outstanding.queue);
        } else {
            state.dead_letter(&outstanding.queue, outstanding.message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.closed = true;

        // Unacked deliveries go back to their queues, as on a real channel close.
        let outstanding: Vec<Outstanding> = state.unacked.drain().map(|(_, o)| o).collect();
        for Outstanding { queue, message } in outstanding {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front((message, true));
            }
        }
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }
}
