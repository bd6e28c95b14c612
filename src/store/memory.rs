use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{error, instrument};

use super::{JobPage, JobStore, ListFilter};
use crate::error::{Result, SyncError};
use crate::model::{ChannelKind, ChannelResult, JobId, JobStatus, SyncJob};

struct Entry {
    seq: u64,
    job: Arc<Mutex<SyncJob>>,
}

/// Process-local job store. The map lock is only held to look up or insert
/// an entry; each job has its own mutex so writes to different jobs never
/// contend.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
    next_seq: AtomicU64,
}

fn lock_job(job: &Mutex<SyncJob>) -> MutexGuard<'_, SyncJob> {
    job.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, job_id: JobId) -> Result<Arc<Mutex<SyncJob>>> {
        let map = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        map.get(&job_id)
            .map(|e| e.job.clone())
            .ok_or(SyncError::NotFound(job_id))
    }

    fn with_job<T>(&self, job_id: JobId, f: impl FnOnce(&mut SyncJob) -> Result<T>) -> Result<T> {
        let job = self.entry(job_id)?;
        let mut guard = lock_job(&job);
        f(&mut guard)
    }

    fn sequenced(&self) -> Vec<(u64, SyncJob)> {
        let map = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        map.values()
            .map(|e| (e.seq, lock_job(&e.job).clone()))
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    #[instrument(skip_all, fields(job_id = %job.job_id))]
    async fn create(&self, job: &SyncJob) -> Result<()> {
        let mut map = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&job.job_id) {
            return Err(SyncError::DuplicateId(job.job_id));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        map.insert(
            job.job_id,
            Entry {
                seq,
                job: Arc::new(Mutex::new(job.clone())),
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<SyncJob> {
        self.with_job(job_id, |job| Ok(job.clone()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<JobPage> {
        let limit = filter.effective_limit();
        let mut matching: Vec<(u64, SyncJob)> = self
            .sequenced()
            .into_iter()
            .filter(|(_, job)| filter.matches(job))
            .collect();
        matching.sort_by(|(sa, a), (sb, b)| b.created_at.cmp(&a.created_at).then(sb.cmp(sa)));

        let total = matching.len() as u64;
        let jobs = matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit as usize)
            .map(|(_, job)| job.summary())
            .collect();
        Ok(JobPage {
            jobs,
            total,
            limit,
            offset: filter.offset,
        })
    }

    #[instrument(skip_all, fields(%job_id, %channel))]
    async fn update_result(
        &self,
        job_id: JobId,
        channel: ChannelKind,
        result: ChannelResult,
    ) -> Result<JobStatus> {
        self.with_job(job_id, |job| {
            job.apply_result(channel, result).map_err(|err| {
                if matches!(err, SyncError::InvalidState { .. }) {
                    error!(%err, "rejected channel result for settled job");
                }
                err
            })
        })
    }

    #[instrument(skip_all, fields(%job_id))]
    async fn mark_started(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        self.with_job(job_id, |job| job.start(at))
    }

    #[instrument(skip_all, fields(%job_id))]
    async fn cancel(&self, job_id: JobId, at: DateTime<Utc>) -> Result<()> {
        self.with_job(job_id, |job| job.cancel(at))
    }

    async fn snapshot(&self) -> Result<Vec<SyncJob>> {
        Ok(self.sequenced().into_iter().map(|(_, job)| job).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorClass;

    fn job(doc: &str, channels: &[ChannelKind]) -> SyncJob {
        SyncJob::new(doc, channels.iter().copied().collect(), "corr", None, None)
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = MemoryJobStore::new();
        let j = job("gdocs:a", &[ChannelKind::Email]);
        store.create(&j).await.unwrap();
        assert!(matches!(
            store.create(&j).await,
            Err(SyncError::DuplicateId(id)) if id == j.job_id
        ));
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            store.get(JobId::new()).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = MemoryJobStore::new();
        let a = job("gdocs:a", &[ChannelKind::Email]);
        let b = job("gdocs:b", &[ChannelKind::Web, ChannelKind::Email]);
        let c = job("gdocs:c", &[ChannelKind::Web]);
        for j in [&a, &b, &c] {
            store.create(j).await.unwrap();
        }
        store
            .update_result(c.job_id, ChannelKind::Web, ChannelResult::success("corr", None, 1))
            .await
            .unwrap();

        let page = store.list(&ListFilter::default()).await.unwrap();
        let ids: Vec<_> = page.jobs.iter().map(|s| s.job_id).collect();
        assert_eq!(ids, vec![c.job_id, b.job_id, a.job_id]);
        assert_eq!(page.total, 3);

        let web = store
            .list(&ListFilter {
                channel: Some(ChannelKind::Web),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(web.total, 2);

        let done = store
            .list(&ListFilter {
                status: Some(JobStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(done.jobs.len(), 1);
        assert_eq!(done.jobs[0].job_id, c.job_id);

        let second = store
            .list(&ListFilter {
                limit: Some(1),
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.jobs[0].job_id, b.job_id);
        assert_eq!(second.total, 3);
    }

    #[tokio::test]
    async fn list_caps_page_size() {
        let store = MemoryJobStore::new();
        for i in 0..120 {
            store
                .create(&job(&format!("gdocs:{i}"), &[ChannelKind::Email]))
                .await
                .unwrap();
        }
        let page = store
            .list(&ListFilter {
                limit: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.jobs.len(), 100);
        assert_eq!(page.limit, 100);
        assert_eq!(page.total, 120);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_results_promote_exactly_once() {
        let store = Arc::new(MemoryJobStore::new());
        let j = job(
            "gdocs:a",
            &[
                ChannelKind::Email,
                ChannelKind::Web,
                ChannelKind::Social,
                ChannelKind::Twitter,
                ChannelKind::Linkedin,
                ChannelKind::Facebook,
            ],
        );
        store.create(&j).await.unwrap();
        let job_id = j.job_id;

        let handles: Vec<_> = ChannelKind::ALL
            .into_iter()
            .map(|channel| {
                let store = store.clone();
                tokio::spawn(async move {
                    let result = if channel == ChannelKind::Web {
                        ChannelResult::failure("corr", "down", ErrorClass::Transient, 3)
                    } else {
                        ChannelResult::success("corr", None, 1)
                    };
                    store.update_result(job_id, channel, result).await.unwrap()
                })
            })
            .collect();

        let mut statuses = Vec::new();
        for h in handles {
            statuses.push(h.await.unwrap());
        }
        let promoted = statuses.iter().filter(|s| s.is_terminal()).count();
        assert_eq!(promoted, 1);

        let stored = store.get(job_id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Partial);
        assert_eq!(stored.channel_results.len(), 6);
    }

    #[tokio::test]
    async fn reads_do_not_mutate() {
        let store = MemoryJobStore::new();
        let j = job("gdocs:a", &[ChannelKind::Email]);
        store.create(&j).await.unwrap();
        store
            .update_result(j.job_id, ChannelKind::Email, ChannelResult::success("corr", None, 1))
            .await
            .unwrap();
        let first = serde_json::to_vec(&store.get(j.job_id).await.unwrap()).unwrap();
        let second = serde_json::to_vec(&store.get(j.job_id).await.unwrap()).unwrap();
        assert_eq!(first, second);
    }
}
