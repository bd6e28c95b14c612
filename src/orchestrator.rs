//! Job lifecycle: validation, scheduling, concurrent channel fan-out and
//! aggregation of channel results.
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::content::{ContentRenderer, DocumentFetcher, DocumentRef, RawContent, RenderOptions};
use crate::dispatch::{dispatch_with_retry, DispatcherRegistry, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::model::{ChannelKind, ChannelResult, ErrorClass, JobId, JobStatus, SyncJob};
use crate::store::JobStore;

/// A caller's request to publish one document to a set of channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    pub document_ref: String,
    pub channels: Vec<String>,
    pub correlation_id: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl SyncRequest {
    pub fn new<I, S>(document_ref: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            document_ref: document_ref.into(),
            channels: channels.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// What `submit` hands back before any channel has been contacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub channels: BTreeSet<ChannelKind>,
    pub correlation_id: String,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl From<&SyncJob> for JobReceipt {
    fn from(job: &SyncJob) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            created_at: job.created_at,
            channels: job.channels.clone(),
            correlation_id: job.correlation_id.clone(),
            scheduled_for: job.scheduled_for,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    /// How far in the past `scheduled_for` may lie and still count as "now".
    pub past_schedule_grace: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            past_schedule_grace: chrono::Duration::seconds(5),
        }
    }
}

struct InFlight {
    done: watch::Receiver<bool>,
    abort: AbortHandle,
}

struct Inner {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    renderer: Arc<dyn ContentRenderer>,
    dispatchers: DispatcherRegistry,
    settings: OrchestratorSettings,
    inflight: Mutex<HashMap<JobId, InFlight>>,
}

/// Owns every job run. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

fn lock_inflight(m: &Mutex<HashMap<JobId, InFlight>>) -> MutexGuard<'_, HashMap<JobId, InFlight>> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        renderer: Arc<dyn ContentRenderer>,
        dispatchers: DispatcherRegistry,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                renderer,
                dispatchers,
                settings,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.inner.store.clone()
    }

    /// Validate and persist a job, then start its run in the background.
    #[instrument(skip_all, fields(document_ref = %request.document_ref))]
    pub async fn submit(&self, request: SyncRequest) -> Result<JobReceipt> {
        let channels = self.validate_channels(&request.channels)?;
        DocumentRef::parse(&request.document_ref)?;

        let now = Utc::now();
        if let Some(at) = request.scheduled_for {
            if at < now - self.inner.settings.past_schedule_grace {
                return Err(SyncError::invalid(format!(
                    "scheduled_for {} is in the past",
                    at.to_rfc3339()
                )));
            }
        }

        let correlation_id = request
            .correlation_id
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let job = SyncJob::new(
            request.document_ref.trim(),
            channels,
            correlation_id,
            request.scheduled_for,
            None,
        );
        self.launch(job).await
    }

    /// Start a follow-up job for `channels` of `parent`. The parent record is
    /// only read.
    pub(crate) async fn submit_child(
        &self,
        parent: &SyncJob,
        channels: BTreeSet<ChannelKind>,
    ) -> Result<JobReceipt> {
        if channels.is_empty() {
            return Err(SyncError::invalid("no channels left to retry"));
        }
        if let Some(missing) = channels.iter().find(|c| !self.inner.dispatchers.supports(**c)) {
            return Err(SyncError::invalid(format!(
                "no dispatcher configured for channel {}",
                missing
            )));
        }
        let job = SyncJob::new(
            parent.document_ref.clone(),
            channels,
            parent.correlation_id.clone(),
            None,
            Some(parent.job_id),
        );
        self.launch(job).await
    }

    /// Cancel a job that has not started yet.
    #[instrument(skip_all, fields(%job_id))]
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.inner.store.cancel(job_id, Utc::now()).await?;
        if let Some(entry) = lock_inflight(&self.inner.inflight).remove(&job_id) {
            entry.abort.abort();
        }
        info!("job cancelled");
        Ok(())
    }

    /// Resolve once the job's run has finished, then return the stored job.
    pub async fn wait_for(&self, job_id: JobId) -> Result<SyncJob> {
        let done = lock_inflight(&self.inner.inflight)
            .get(&job_id)
            .map(|e| e.done.clone());
        if let Some(mut done) = done {
            // An aborted run drops its sender; either way it is over.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.inner.store.get(job_id).await
    }

    /// Re-arm runs for jobs left `pending` by a previous process. Returns the
    /// ids that were re-armed.
    #[instrument(skip_all)]
    pub async fn resume_pending(&self) -> Result<Vec<JobId>> {
        let pending: Vec<SyncJob> = self
            .inner
            .store
            .snapshot()
            .await?
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        let mut resumed = Vec::new();
        for job in pending {
            if lock_inflight(&self.inner.inflight).contains_key(&job.job_id) {
                continue;
            }
            resumed.push(job.job_id);
            self.spawn_run(job);
        }
        if !resumed.is_empty() {
            info!(resumed = resumed.len(), "re-armed scheduled jobs");
        }
        Ok(resumed)
    }

    fn validate_channels(&self, raw: &[String]) -> Result<BTreeSet<ChannelKind>> {
        if raw.is_empty() {
            return Err(SyncError::invalid("at least one channel is required"));
        }
        let mut channels = BTreeSet::new();
        for name in raw {
            let channel: ChannelKind = name.parse()?;
            if !self.inner.dispatchers.supports(channel) {
                return Err(SyncError::invalid(format!(
                    "no dispatcher configured for channel {}",
                    channel
                )));
            }
            channels.insert(channel);
        }
        Ok(channels)
    }

    async fn launch(&self, job: SyncJob) -> Result<JobReceipt> {
        self.inner.store.create(&job).await?;
        let receipt = JobReceipt::from(&job);
        info!(
            job_id = %job.job_id,
            status = %job.status,
            channels = job.channels.len(),
            correlation_id = %job.correlation_id,
            "job accepted"
        );
        self.spawn_run(job);
        Ok(receipt)
    }

    fn spawn_run(&self, job: SyncJob) {
        let (done_tx, done_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let job_id = job.job_id;
        let span = tracing::info_span!("job", %job_id, correlation_id = %job.correlation_id);

        // Held across the spawn so the run cannot deregister before it is registered.
        let mut inflight = lock_inflight(&self.inner.inflight);
        let handle = tokio::spawn(
            async move {
                inner.clone().run(job).await;
                let _ = done_tx.send(true);
                lock_inflight(&inner.inflight).remove(&job_id);
            }
            .instrument(span),
        );
        inflight.insert(
            job_id,
            InFlight {
                done: done_rx,
                abort: handle.abort_handle(),
            },
        );
    }
}

impl Inner {
    async fn run(self: Arc<Self>, job: SyncJob) {
        let job_id = job.job_id;
        if job.status == JobStatus::Pending {
            if let Some(at) = job.scheduled_for {
                let wait = (at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
            }
            if let Err(err) = self.store.mark_started(job_id, Utc::now()).await {
                warn!(%err, "scheduled job not started");
                return;
            }
            info!("scheduled job started");
        }

        self.clone().fan_out(&job).await;

        match self.store.get(job_id).await {
            Ok(done) if !done.is_terminal() => error!(
                status = %done.status,
                recorded = done.channel_results.len(),
                channels = done.channels.len(),
                "job run ended with channel results missing"
            ),
            Ok(done) => info!(status = %done.status, "job finished"),
            Err(err) => error!(%err, "job finished but could not be reloaded"),
        }
    }

    async fn fan_out(self: Arc<Self>, job: &SyncJob) {
        let content = match self.fetch(job).await {
            Ok(content) => Arc::new(content),
            Err(reason) => {
                warn!(%reason, "document unavailable; failing every channel");
                for channel in &job.channels {
                    let result =
                        ChannelResult::failure(&job.correlation_id, reason.clone(), ErrorClass::Permanent, 0);
                    self.record(job.job_id, *channel, result).await;
                }
                return;
            }
        };

        let handles: Vec<_> = job
            .channels
            .iter()
            .map(|&channel| {
                let inner = self.clone();
                let content = content.clone();
                let job_id = job.job_id;
                let correlation_id = job.correlation_id.clone();
                let span = tracing::info_span!("channel", %channel);
                let handle = tokio::spawn(
                    async move {
                        let result = inner.deliver(channel, &content, &correlation_id).await;
                        inner.record(job_id, channel, result).await;
                    }
                    .instrument(span),
                );
                (channel, handle)
            })
            .collect();

        let (channels, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (channel, joined) in channels.into_iter().zip(join_all(handles).await) {
            if let Err(err) = joined {
                error!(%channel, %err, "channel task died before recording a result");
                let result = ChannelResult::failure(
                    &job.correlation_id,
                    format!("dispatch task failed: {}", err),
                    ErrorClass::Permanent,
                    0,
                );
                self.record(job.job_id, channel, result).await;
            }
        }
    }

    async fn fetch(&self, job: &SyncJob) -> std::result::Result<RawContent, String> {
        let document = DocumentRef::parse(&job.document_ref).map_err(|e| e.to_string())?;
        self.fetcher
            .fetch(&document)
            .await
            .map_err(|e| format!("fetch failed: {}", e))
    }

    async fn deliver(&self, channel: ChannelKind, content: &RawContent, correlation_id: &str) -> ChannelResult {
        let options = RenderOptions {
            correlation_id: correlation_id.to_string(),
        };
        let payload = match self.renderer.render(content, channel, &options) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "render failed");
                return ChannelResult::failure(
                    correlation_id,
                    format!("render failed: {}", err),
                    ErrorClass::Permanent,
                    0,
                );
            }
        };
        let Some(dispatcher) = self.dispatchers.get(channel) else {
            return ChannelResult::failure(
                correlation_id,
                format!("no dispatcher configured for channel {}", channel),
                ErrorClass::Permanent,
                0,
            );
        };
        dispatch_with_retry(dispatcher.as_ref(), &payload, &self.settings.retry).await
    }

    /// Store a channel result. Storage errors are retried under the dispatch
    /// retry policy; anything else, or running out of attempts, drops the
    /// result and leaves the job unsettled.
    async fn record(&self, job_id: JobId, channel: ChannelKind, result: ChannelResult) {
        let outcome = result.outcome;
        let policy = &self.settings.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.update_result(job_id, channel, result.clone()).await {
                Ok(status) => {
                    info!(%channel, outcome = outcome.as_str(), %status, "channel result recorded");
                    return;
                }
                Err(err @ SyncError::Storage(_)) if attempt < max_attempts => {
                    let delay = policy.backoff(attempt - 1);
                    warn!(%channel, %err, attempt, ?delay, "storing channel result failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(%channel, %err, attempt, "channel result lost");
                    return;
                }
            }
        }
    }
}
