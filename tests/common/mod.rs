#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use content_relay::content::{ChannelPayload, DocumentFetcher, DocumentRef, PlainRenderer, RawContent};
use content_relay::dispatch::{ChannelDispatcher, Delivery, DispatcherRegistry, RetryPolicy};
use content_relay::error::{DispatchError, FetchError};
use content_relay::store::JobStore;
use content_relay::{ChannelKind, Orchestrator, OrchestratorSettings};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Scripted channel double. Responses are consumed in order; once they run
/// out every call succeeds with `<channel>-ref`.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    delay: Duration,
    panic: bool,
    responses: Arc<Mutex<VecDeque<Result<Delivery, DispatchError>>>>,
    calls: Arc<Mutex<Vec<ChannelPayload>>>,
}

impl RecordingDispatcher {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<Delivery, DispatchError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn calls(&self) -> Vec<ChannelPayload> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl ChannelDispatcher for RecordingDispatcher {
    async fn dispatch(&self, payload: &ChannelPayload) -> Result<Delivery, DispatchError> {
        self.calls.lock().await.push(payload.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic {
            panic!("dispatcher exploded");
        }
        let next = self.responses.lock().await.pop_front();
        next.unwrap_or_else(|| Ok(Delivery::with_reference(format!("{}-ref", payload.channel))))
    }
}

/// Serves the same document for every ref, or fails every fetch.
#[derive(Clone, Default)]
pub struct StaticFetcher {
    missing: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StaticFetcher {
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DocumentFetcher for StaticFetcher {
    async fn fetch(&self, document: &DocumentRef) -> Result<RawContent, FetchError> {
        self.calls.lock().await.push(document.to_string());
        if self.missing {
            return Err(FetchError::NotFound(document.to_string()));
        }
        Ok(RawContent {
            document_ref: document.to_string(),
            title: Some("Spring launch".into()),
            body: "Our spring collection is live.".into(),
            fetched_at: Utc::now(),
        })
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        },
        past_schedule_grace: chrono::Duration::seconds(5),
    }
}

pub fn registry(dispatchers: &[(ChannelKind, RecordingDispatcher)]) -> DispatcherRegistry {
    dispatchers
        .iter()
        .fold(DispatcherRegistry::new(), |reg, (channel, d)| {
            reg.register(*channel, Arc::new(d.clone()))
        })
}

pub fn orchestrator(
    store: Arc<dyn JobStore>,
    fetcher: StaticFetcher,
    dispatchers: &[(ChannelKind, RecordingDispatcher)],
) -> Orchestrator {
    Orchestrator::new(
        store,
        Arc::new(fetcher),
        Arc::new(PlainRenderer),
        registry(dispatchers),
        settings(),
    )
}
