//! `lapin` implementation of [`BrokerChannel`].

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};

use crate::channel::{
    BrokerChannel, DeliveryStream, ExchangeType, IncomingDelivery, MessageProperties, QueueSpec,
    RETRY_COUNT_HEADER,
};
use crate::error::ChannelError;

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// A live `lapin` channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, kind: &ExchangeType) -> Result<(), ChannelError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), ChannelError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                queue_arguments(spec),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), ChannelError> {
        // The returned confirm is dropped: acceptance by the channel is all we report.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, ChannelError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(incoming_delivery).map_err(ChannelError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ChannelError> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), ChannelError> {
        self.channel.basic_reject(delivery_tag, BasicRejectOptions { requeue }).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.channel.close(REPLY_SUCCESS, "channel closed").await?;
        Ok(())
    }
}

pub(crate) fn exchange_kind(kind: &ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
        ExchangeType::Custom(kind) => ExchangeKind::Custom(kind.clone()),
    }
}

pub(crate) fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(exchange) = &spec.dead_letter_exchange {
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(exchange.clone().into()));
    }
    if let Some(routing_key) = &spec.dead_letter_routing_key {
        args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(routing_key.clone().into()));
    }
    if let Some(ttl) = spec.message_ttl {
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
    }
    args
}

pub(crate) fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(count) = properties.retry_count {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(i64::from(count)));
        basic = basic.with_headers(headers);
    }
    basic
}

pub(crate) fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_string()),
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_string()),
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        retry_count: basic.headers().as_ref().and_then(retry_count_from_headers),
    }
}

/// Reads `x-retry-count` from any integer width a publisher may have used.
fn retry_count_from_headers(headers: &FieldTable) -> Option<u32> {
    match headers.inner().get(RETRY_COUNT_HEADER)? {
        AMQPValue::ShortShortInt(count) => u32::try_from(*count).ok(),
        AMQPValue::ShortShortUInt(count) => Some(u32::from(*count)),
        AMQPValue::ShortInt(count) => u32::try_from(*count).ok(),
        AMQPValue::ShortUInt(count) => Some(u32::from(*count)),
        AMQPValue::LongInt(count) => u32::try_from(*count).ok(),
        AMQPValue::LongUInt(count) => Some(*count),
        AMQPValue::LongLongInt(count) => u32::try_from(*count).ok(),
        _ => None,
    }
}

fn incoming_delivery(delivery: Delivery) -> IncomingDelivery {
    IncomingDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delay_queue_arguments_match_broker_contract() {
        let spec = QueueSpec::durable("orders.nack")
            .with_dead_letter("events", "orders")
            .with_message_ttl(Duration::from_secs(60));

        let args = queue_arguments(&spec);
        let inner = args.inner();

        assert_eq!(
            inner.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("events".into()))
        );
        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("orders".into()))
        );
        assert_eq!(inner.get("x-message-ttl"), Some(&AMQPValue::LongLongInt(60_000)));
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        assert!(queue_arguments(&QueueSpec::durable("orders.dlq")).inner().is_empty());
    }

    #[test]
    fn properties_survive_conversion_through_lapin() {
        let props = MessageProperties::json()
            .persistent(true)
            .with_message_id("abc")
            .with_retry_count(4);

        let basic = to_basic_properties(&props);
        assert_eq!(*basic.delivery_mode(), Some(2));
        assert_eq!(from_basic_properties(&basic), props);
    }

    #[test]
    fn retry_count_accepts_any_integer_width() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(3));
        assert_eq!(retry_count_from_headers(&headers), Some(3));

        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::ShortShortUInt(7));
        assert_eq!(retry_count_from_headers(&headers), Some(7));
    }

    #[test]
    fn negative_or_non_integer_retry_count_is_ignored() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(-1));
        assert_eq!(retry_count_from_headers(&headers), None);

        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongString("2".into()));
        assert_eq!(retry_count_from_headers(&headers), None);
    }
}
