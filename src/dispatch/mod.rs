//! Channel dispatchers and the per-dispatch retry budget.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::content::ChannelPayload;
use crate::error::DispatchError;
use crate::model::{ChannelKind, ChannelResult, ErrorClass};

pub mod webhook;

pub use webhook::WebhookDispatcher;

/// Receipt returned by a channel after a successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    /// Channel-side identifier of the delivery, when the channel returns one.
    pub reference: Option<String>,
}

impl Delivery {
    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
        }
    }
}

#[async_trait]
pub trait ChannelDispatcher: Send + Sync {
    async fn dispatch(&self, payload: &ChannelPayload) -> Result<Delivery, DispatchError>;
}

/// Lookup table from channel kind to its dispatcher.
#[derive(Clone, Default)]
pub struct DispatcherRegistry {
    dispatchers: HashMap<ChannelKind, Arc<dyn ChannelDispatcher>>,
}

impl fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.dispatchers.keys().collect();
        kinds.sort();
        f.debug_struct("DispatcherRegistry")
            .field("channels", &kinds)
            .finish()
    }
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, channel: ChannelKind, dispatcher: Arc<dyn ChannelDispatcher>) -> Self {
        self.dispatchers.insert(channel, dispatcher);
        self
    }

    pub fn get(&self, channel: ChannelKind) -> Option<Arc<dyn ChannelDispatcher>> {
        self.dispatchers.get(&channel).cloned()
    }

    pub fn supports(&self, channel: ChannelKind) -> bool {
        self.dispatchers.contains_key(&channel)
    }
}

/// Bounded retry budget for a single channel dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` counts from 0.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run one channel's dispatch under `policy`, turning the final outcome into
/// a [`ChannelResult`]. Never returns an error: exhausting the budget is a
/// failed result.
#[instrument(skip_all, fields(channel = %payload.channel, correlation_id = %payload.correlation_id))]
pub async fn dispatch_with_retry(
    dispatcher: &dyn ChannelDispatcher,
    payload: &ChannelPayload,
    policy: &RetryPolicy,
) -> ChannelResult {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.attempt_timeout, dispatcher.dispatch(payload)).await {
            Ok(res) => res,
            Err(_) => Err(DispatchError::transient(format!(
                "timed out after {:?}",
                policy.attempt_timeout
            ))),
        };

        match outcome {
            Ok(delivery) => {
                debug!(attempt, reference = ?delivery.reference, "dispatch succeeded");
                return ChannelResult::success(&payload.correlation_id, delivery.reference, attempt);
            }
            Err(err) if err.class() == ErrorClass::Transient && attempt < max_attempts => {
                let delay = policy.backoff(attempt - 1);
                warn!(%err, attempt, ?delay, "dispatch failed; backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(%err, attempt, "dispatch failed; giving up");
                return ChannelResult::failure(
                    &payload.correlation_id,
                    err.message(),
                    err.class(),
                    attempt,
                );
            }
        }
    }
}
