use async_trait::async_trait;
use rabbitmq_retry::{
    CancellationToken, Client, ConnectionConfig, DeliveryContext, MessageHandler, Payload, RetryPolicy, Verdict,
    WorkerError,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// 1. Define your message struct
#[derive(Deserialize, Debug, Clone)]
struct MyMessage {
    content: String,
    id: u32,
}

// 2. Implement the `MessageHandler` trait for your logic
struct MyMessageHandler;

#[async_trait]
impl MessageHandler for MyMessageHandler {
    fn handler_name(&self) -> &str {
        "MyTestMessageHandler"
    }

    async fn handle_message(&self, payload: Payload, context: &DeliveryContext) -> Verdict {
        let message: MyMessage = match payload.decode() {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Message does not match schema: {}", e);
                return Verdict::Failure;
            }
        };

        log::info!(
            "Received message with ID: {} (attempt {}). Content: '{}'",
            message.id,
            context.attempt,
            message.content
        );

        if message.id == 99 {
            log::info!("Simulating a long-running task...");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => log::info!("Long-running task finished."),
                _ = context.shutdown.cancelled() => {
                    log::warn!("Shutdown requested, giving up on message {}", message.id);
                    return Verdict::Failure;
                }
            }
        }

        if message.id % 2 != 0 {
            log::warn!("Simulating a processing failure for message {}", message.id);
            return Verdict::Failure;
        }

        log::info!("Successfully processed message {}", message.id);
        Verdict::Success
    }
}

async fn run_once(config: &ConnectionConfig, policy: &RetryPolicy, shutdown: CancellationToken) -> Result<(), WorkerError> {
    let client = Client::connect(config, "simple_consumer")
        .await?
        .with_retry_policy(policy.clone());

    let consumer_config = client.queue("my_app_queue").prefetch_count(5).build()?;
    let consumer = client.consumer(consumer_config, Arc::new(MyMessageHandler));
    let handle = consumer.start(shutdown).await?;

    let result = handle.join().await;
    if let Err(e) = client.close().await {
        log::warn!("Error while closing connection: {}", e);
    }
    result
}

// 3. Configure and run the consumer
#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ConnectionConfig::from_env()?;
    let policy = RetryPolicy::from_env()?;
    log::info!("Using RabbitMQ at {} (exchange '{}')", config.uri, config.exchange);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl+C received. Shutting down.");
            signal.cancel();
        }
    });

    let reconnect_delay = Duration::from_secs(5);

    // The application is now in control of the run loop.
    while !shutdown.is_cancelled() {
        match run_once(&config, &policy, shutdown.clone()).await {
            Ok(()) if shutdown.is_cancelled() => break,
            Ok(()) => log::warn!("Consumer stopped on its own. Reconnecting in {:?}...", reconnect_delay),
            Err(e) => log::error!("Consumer failed: {}. Reconnecting in {:?}...", e, reconnect_delay),
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    log::info!("Application has shut down.");
    Ok(())
}
