//! Retry configuration and the reschedule/dead-letter decision.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// How a failed delivery is put back in front of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryRoute {
    /// Republish straight to the work queue through the shared exchange.
    #[default]
    Immediate,
    /// Park the message in the `<queue>.nack` delay queue; the broker moves it
    /// back to the work queue once the retry timeout has elapsed.
    Delayed,
}

impl FromStr for RetryRoute {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(RetryRoute::Immediate),
            "delayed" => Ok(RetryRoute::Delayed),
            other => Err(format!("unknown retry route '{}', expected 'immediate' or 'delayed'", other).into()),
        }
    }
}

impl fmt::Display for RetryRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryRoute::Immediate => f.write_str("immediate"),
            RetryRoute::Delayed => f.write_str("delayed"),
        }
    }
}

/// Configuration for message redelivery attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Reschedules allowed before a message is dead-lettered.
    pub max_retries: u32,
    /// TTL of the delay queue.
    pub retry_timeout: Duration,
    pub route: RetryRoute,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_timeout: Duration) -> Self {
        Self {
            max_retries,
            retry_timeout,
            route: RetryRoute::default(),
        }
    }

    pub fn with_route(mut self, route: RetryRoute) -> Self {
        self.route = route;
        self
    }

    /// Reads `RABBITMQ_RETRY_COUNT`, `RABBITMQ_RETRY_TIMEOUT_MS` and
    /// `RABBITMQ_RETRY_ROUTE`, falling back to the defaults for unset variables.
    pub fn from_env() -> Result<Self, WorkerError> {
        let mut policy = Self::default();
        if let Some(count) = env_parse::<u32>("RABBITMQ_RETRY_COUNT")? {
            policy.max_retries = count;
        }
        if let Some(millis) = env_parse::<u64>("RABBITMQ_RETRY_TIMEOUT_MS")? {
            policy.retry_timeout = Duration::from_millis(millis);
        }
        if let Ok(route) = env::var("RABBITMQ_RETRY_ROUTE") {
            policy.route = route.parse()?;
        }
        Ok(policy)
    }

    /// TTL for the delay queue, in the milliseconds the broker expects.
    pub fn retry_timeout_millis(&self) -> u64 {
        self.retry_timeout.as_millis() as u64
    }

    /// Decides what happens to a message that failed at `attempt` (its current
    /// `x-retry-count`, 0 on first delivery).
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::Reschedule { next_attempt: attempt + 1 }
        } else {
            RetryDecision::DeadLetter
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_TIMEOUT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Reschedule { next_attempt: u32 },
    DeadLetter,
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, WorkerError>
where
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("failed to parse environment variable '{}': {}", key, e).into()),
        Err(_) => Ok(None),
    }
}
