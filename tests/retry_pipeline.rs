use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rabbitmq_retry::memory::InMemoryBroker;
use rabbitmq_retry::{
    handler_fn, BrokerChannel, CancellationToken, Client, ConnectionConfig, DeliveryContext, MessageProperties,
    Payload, PublishOptions, QueueSpec, RetryRoute, WorkerError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    sku: String,
    lines: Vec<u32>,
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn client(broker: &InMemoryBroker) -> Client {
    init_logger();
    let config = ConnectionConfig::new("amqp://unused", "events");
    Client::with_channel(&config, Arc::new(broker.clone()), "pipeline-test")
        .await
        .unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn always_failing_message_is_dead_lettered_after_max_retries() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let seen = attempts.clone();
    let handler = handler_fn("always-fails", move |_payload: Payload, ctx: DeliveryContext| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(ctx.attempt);
            false
        }
    });
    let config = client.queue("orders").retry_count(2).build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    client
        .publish("orders", &serde_json::json!({"id": 1}), PublishOptions::default())
        .await
        .unwrap();

    eventually(|| handle.stats().snapshot().dead_lettered == 1).await;
    let stats = handle.stats().snapshot();
    handle.stop().await.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.rescheduled, 2);
    assert_eq!(stats.acked, 0);
    assert_eq!(broker.acked().len(), 3);
    assert_eq!(broker.unacked_count(), 0);

    let counters: Vec<Option<u32>> = broker.published().iter().map(|m| m.properties.retry_count).collect();
    assert_eq!(counters, vec![None, Some(1), Some(2), Some(2)]);

    let parked = broker.messages("orders.dlq");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].body, br#"{"id":1}"#);
    assert_eq!(parked[0].properties.retry_count, Some(2));
    assert!(broker.messages("orders").is_empty());
}

#[tokio::test]
async fn sent_payload_reaches_handler_unchanged() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = handler_fn("collect", move |payload: Payload, _ctx: DeliveryContext| {
        let tx = tx.clone();
        async move {
            match payload.decode::<Order>() {
                Ok(order) => tx.send(order).is_ok(),
                Err(_) => false,
            }
        }
    });
    let config = client.queue("orders").build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    let order = Order {
        id: 42,
        sku: "A-7".into(),
        lines: vec![1, 2, 3],
    };
    client.publish("orders", &order, PublishOptions::default()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(received, Some(order));

    eventually(|| handle.stats().snapshot().acked == 1).await;
    handle.stop().await.unwrap();

    assert!(broker.messages("orders.nack").is_empty());
    assert!(broker.messages("orders.dlq").is_empty());
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn malformed_body_is_dropped_without_calling_handler() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let calls = Arc::new(Mutex::new(0u32));

    let counter = calls.clone();
    let handler = handler_fn("counting", move |_payload: Payload, _ctx: DeliveryContext| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
            true
        }
    });
    let config = client.queue("orders").build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    broker.inject("orders", b"[1, 2, 3]".to_vec(), MessageProperties::json());

    eventually(|| handle.stats().snapshot().dropped == 1).await;
    handle.stop().await.unwrap();

    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(broker.rejected().len(), 1);
    assert!(!broker.rejected()[0].1);
    assert!(broker.acked().is_empty());
    assert!(broker.published().is_empty());
    assert!(broker.messages("orders.dlq").is_empty());
}

#[tokio::test]
async fn failed_reroute_still_acks_original() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("always-fails", |_payload: Payload, _ctx: DeliveryContext| async { false });
    let config = client.queue("orders").retry_count(2).build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    broker.fail_publishes(1);
    broker.inject("orders", br#"{"id":5}"#.to_vec(), MessageProperties::json());

    eventually(|| handle.stats().snapshot().routing_failures == 1).await;
    let stats = handle.stats().snapshot();
    handle.stop().await.unwrap();

    assert!(stats.last_routing_failure.is_some());
    assert_eq!(stats.rescheduled, 0);
    assert_eq!(broker.acked().len(), 1);
    assert_eq!(broker.unacked_count(), 0);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn delayed_route_waits_in_delay_queue() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("always-fails", |_payload: Payload, _ctx: DeliveryContext| async { false });
    let config = client
        .queue("orders")
        .retry_count(1)
        .retry_timeout(Duration::from_secs(30))
        .retry_route(RetryRoute::Delayed)
        .build()
        .unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    broker.inject("orders", br#"{"id":9}"#.to_vec(), MessageProperties::json());

    eventually(|| handle.stats().snapshot().rescheduled == 1).await;
    let parked = broker.messages("orders.nack");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].properties.retry_count, Some(1));
    assert_eq!(handle.stats().snapshot().delivered, 1);

    assert_eq!(broker.expire("orders.nack"), 1);

    eventually(|| handle.stats().snapshot().dead_lettered == 1).await;
    handle.stop().await.unwrap();

    let dead = broker.messages("orders.dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, br#"{"id":9}"#);
    assert_eq!(dead[0].properties.retry_count, Some(1));
}

#[tokio::test]
async fn setup_declares_and_binds_queues() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("noop", |_payload: Payload, _ctx: DeliveryContext| async { true });
    let config = client
        .queue("orders")
        .retry_timeout(Duration::from_millis(1500))
        .prefetch_count(4)
        .build()
        .unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    let work = broker.queue_spec("orders").unwrap();
    assert_eq!(work.dead_letter_exchange.as_deref(), Some("events"));
    assert_eq!(work.dead_letter_routing_key.as_deref(), Some("orders.nack"));
    assert!(broker.has_binding("orders", "events", "orders"));
    assert_eq!(broker.queue_spec("orders.nack").unwrap().message_ttl, Some(1500));
    assert!(broker.queue_spec("orders.dlq").is_some());

    eventually(|| broker.consumer_tags("orders").len() == 1).await;
    assert!(broker.consumer_tags("orders")[0].starts_with("orders_consumer_"));
    assert_eq!(broker.prefetch(), Some(4));

    handle.stop().await.unwrap();
}

#[tokio::test]
async fn duplicate_explicit_tag_fails_second_start() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let first = client.queue("orders").consumer_tag("billing").build().unwrap();
    let handle = client
        .consumer(first, Arc::new(handler_fn("a", |_p: Payload, _c: DeliveryContext| async { true })))
        .start(CancellationToken::new())
        .await
        .unwrap();
    eventually(|| broker.consumer_tags("orders").len() == 1).await;

    let second = client.queue("orders").consumer_tag("billing").build().unwrap();
    let result = client
        .consumer(second, Arc::new(handler_fn("b", |_p: Payload, _c: DeliveryContext| async { true })))
        .run(CancellationToken::new())
        .await;

    assert!(matches!(result, Err(WorkerError::Consume { ref queue, .. }) if queue == "orders"));
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn conflicting_queue_fails_start() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("orders")).await.unwrap();
    let client = client(&broker).await;

    let handler = handler_fn("noop", |_payload: Payload, _ctx: DeliveryContext| async { true });
    let config = client.queue("orders").build().unwrap();
    let result = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await;

    assert!(matches!(result, Err(WorkerError::Declare { ref target, .. }) if target == "orders"));
}

#[tokio::test]
async fn stopped_consumer_leaves_messages_queued() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("noop", |_payload: Payload, _ctx: DeliveryContext| async { true });
    let config = client.queue("orders").build().unwrap();
    let shutdown = CancellationToken::new();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(shutdown.clone())
        .await
        .unwrap();

    shutdown.cancel();
    handle.join().await.unwrap();

    broker.inject("orders", br#"{"id":1}"#.to_vec(), MessageProperties::json());

    assert_eq!(broker.messages("orders").len(), 1);
    assert!(broker.acked().is_empty());
}

#[tokio::test]
async fn closing_the_channel_ends_the_loop() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("noop", |_payload: Payload, _ctx: DeliveryContext| async { true });
    let config = client.queue("orders").build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    eventually(|| !broker.consumer_tags("orders").is_empty()).await;
    client.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;

    let handler = handler_fn("panics", |payload: Payload, _ctx: DeliveryContext| async move {
        if payload.contains_key("id") {
            panic!("handler bug");
        }
        true
    });
    let config = client.queue("orders").retry_count(0).build().unwrap();
    let handle = client
        .consumer(config, Arc::new(handler))
        .start(CancellationToken::new())
        .await
        .unwrap();

    broker.inject("orders", br#"{"id":3}"#.to_vec(), MessageProperties::json());

    eventually(|| handle.stats().snapshot().dead_lettered == 1).await;
    let stats = handle.stats().snapshot();
    handle.stop().await.unwrap();

    assert_eq!(stats.handler_panics, 1);
    assert_eq!(broker.messages("orders.dlq").len(), 1);
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn two_consumers_share_one_queue() {
    let broker = InMemoryBroker::new();
    let client = client(&broker).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for name in ["orders_a", "orders_b"] {
        let seen = seen.clone();
        let handler = handler_fn(name, move |payload: Payload, _ctx: DeliveryContext| {
            let seen = seen.clone();
            async move {
                match payload.get_u64("id") {
                    Ok(id) => {
                        seen.lock().unwrap().push(id);
                        true
                    }
                    Err(_) => false,
                }
            }
        });
        let config = client.queue("orders").build().unwrap();
        handles.push(
            client
                .consumer(config, Arc::new(handler))
                .start(CancellationToken::new())
                .await
                .unwrap(),
        );
    }
    eventually(|| broker.consumer_tags("orders").len() == 2).await;
    let tags = broker.consumer_tags("orders");
    assert_ne!(tags[0], tags[1]);

    for id in 0..100u64 {
        client
            .publish("orders", &serde_json::json!({ "id": id }), PublishOptions::default())
            .await
            .unwrap();
    }

    eventually(|| handles.iter().map(|h| h.stats().snapshot().acked).sum::<u64>() == 100).await;

    let per_consumer: Vec<u64> = handles.iter().map(|h| h.stats().snapshot().acked).collect();
    assert!(per_consumer.iter().all(|&count| count > 0));
    for handle in handles {
        handle.stop().await.unwrap();
    }

    let ids = seen.lock().unwrap().clone();
    assert_eq!(ids.len(), 100);
    assert_eq!(ids.iter().copied().collect::<HashSet<u64>>(), (0..100).collect::<HashSet<u64>>());
    assert_eq!(broker.acked().len(), 100);
    assert!(broker.messages("orders.dlq").is_empty());
}
