//! Defines the core trait for message handling logic.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::message::Payload;

/// Outcome a handler reports for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Retry the message, or dead-letter it once retries are exhausted.
    Failure,
}

impl Verdict {
    pub fn is_success(self) -> bool {
        matches!(self, Verdict::Success)
    }
}

impl From<bool> for Verdict {
    fn from(ok: bool) -> Self {
        if ok {
            Verdict::Success
        } else {
            Verdict::Failure
        }
    }
}

impl<E> From<Result<(), E>> for Verdict {
    fn from(result: Result<(), E>) -> Self {
        result.is_ok().into()
    }
}

/// Per-delivery information passed alongside the payload.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: Option<String>,
    /// Current `x-retry-count`, 0 on first delivery.
    pub attempt: u32,
    pub redelivered: bool,
    /// Cancelled when the consumer is asked to stop. Long-running handlers
    /// should watch it and give up early.
    pub shutdown: CancellationToken,
}

/// A trait for processing messages from a RabbitMQ queue.
///
/// Implementations must not panic; a panic is caught and counted as
/// [`Verdict::Failure`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single decoded message.
    async fn handle_message(&self, message: Payload, context: &DeliveryContext) -> Verdict;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// [`MessageHandler`] backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F, Fut> {
    name: String,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure taking the payload and an owned context.
///
/// The closure may return anything convertible into a [`Verdict`], such as
/// `bool` or `Result<(), E>`.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F, Fut>
where
    F: Fn(Payload, DeliveryContext) -> Fut + Send + Sync,
    Fut: Future + Send,
    Fut::Output: Into<Verdict>,
{
    FnHandler {
        name: name.into(),
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Payload, DeliveryContext) -> Fut + Send + Sync,
    Fut: Future + Send,
    Fut::Output: Into<Verdict>,
{
    async fn handle_message(&self, message: Payload, context: &DeliveryContext) -> Verdict {
        (self.f)(message, context.clone()).await.into()
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}
