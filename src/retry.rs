//! Job-level retries: a new job over the failed channels of a finished one.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{Result, SyncError};
use crate::model::{JobId, JobStatus};
use crate::orchestrator::{JobReceipt, Orchestrator};
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReceipt {
    #[serde(flatten)]
    pub job: JobReceipt,
    pub parent_job_id: JobId,
}

#[derive(Clone)]
pub struct RetryCoordinator {
    store: Arc<dyn JobStore>,
    orchestrator: Orchestrator,
}

impl RetryCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            store: orchestrator.store(),
            orchestrator,
        }
    }

    /// Only `failed` and `partial` jobs are retryable. The parent is left
    /// untouched; the child covers exactly the channels that failed.
    #[instrument(skip_all, fields(parent = %job_id))]
    pub async fn retry(&self, job_id: JobId) -> Result<RetryReceipt> {
        let parent = self.store.get(job_id).await?;
        if !matches!(parent.status, JobStatus::Failed | JobStatus::Partial) {
            return Err(SyncError::NotRetryable {
                job_id,
                status: parent.status,
            });
        }

        let channels = parent.failed_channels();
        let job = self.orchestrator.submit_child(&parent, channels).await?;
        info!(child = %job.job_id, channels = job.channels.len(), "retry job submitted");
        Ok(RetryReceipt {
            job,
            parent_job_id: job_id,
        })
    }
}
