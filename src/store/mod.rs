//! Job storage: the single shared mutable resource of the relay.
//!
//! - `memory`: process-local map with one lock per job.
//! - `sqlite`: `sqlx` repository, writers serialized, one transaction per write.
//!
//! Both implementations delegate state transitions to [`SyncJob`] so the
//! invariants live in one place; the stores only provide atomicity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{ChannelKind, ChannelResult, JobId, JobStatus, JobSummary, SyncJob};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

pub const DEFAULT_LIST_LIMIT: u32 = 10;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub channel: Option<ChannelKind>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl ListFilter {
    /// Page size actually served, whatever the caller asked for.
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, job: &SyncJob) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.channel.map_or(true, |c| job.channels.contains(&c))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    /// Matching jobs across all pages.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &SyncJob) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<SyncJob>;

    /// Newest first, `limit` clamped to [`MAX_LIST_LIMIT`].
    async fn list(&self, filter: &ListFilter) -> Result<JobPage>;

    /// Record a channel result; promotes the job when it was the last one.
    async fn update_result(
        &self,
        job_id: JobId,
        channel: ChannelKind,
        result: ChannelResult,
    ) -> Result<JobStatus>;

    async fn mark_started(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()>;

    async fn cancel(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()>;

    /// Every job, in no particular order. Point-in-time, not linearizable
    /// with concurrent writes.
    async fn snapshot(&self) -> Result<Vec<SyncJob>>;
}
