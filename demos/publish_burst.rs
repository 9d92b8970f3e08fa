//! Publishes a handful of messages for `simple_consumer` to chew on.
//!
//! Even ids succeed, odd ids exhaust their retries and land in
//! `my_app_queue.dlq`, id 99 takes ten seconds.

use rabbitmq_retry::{Client, ConnectionConfig, PublishOptions, WorkerError};
use serde::Serialize;

#[derive(Serialize)]
struct MyMessage<'a> {
    content: &'a str,
    id: u32,
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let count: u32 = std::env::args().nth(1).and_then(|arg| arg.parse().ok()).unwrap_or(10);

    let client = Client::connect(&ConnectionConfig::from_env()?, "publish_burst").await?;

    for id in (0..count).chain(std::iter::once(99)) {
        let receipt = client
            .publish("my_app_queue", &MyMessage { content: "hello", id }, PublishOptions::default())
            .await?;
        log::info!("Sent message {} as {} ({} bytes)", id, receipt.message_id, receipt.size);
    }

    client.close().await
}
