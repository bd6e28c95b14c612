//! Point-in-time statistics over the job store.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::error::Result;
use crate::model::{ChannelKind, JobStatus, SyncJob};
use crate::store::JobStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub requested: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_jobs: u64,
    pub active_jobs: u64,
    pub status_breakdown: BTreeMap<JobStatus, u64>,
    pub channel_breakdown: BTreeMap<ChannelKind, ChannelStats>,
    /// completed / (completed + failed + partial).
    pub success_rate: f64,
    /// Seconds, over terminal jobs that have both timestamps.
    pub average_processing_time: f64,
    /// Latest job creation per document.
    pub last_sync_times: BTreeMap<String, DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn from_jobs(jobs: &[SyncJob], generated_at: DateTime<Utc>) -> Self {
        let mut status_breakdown: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        let mut channel_breakdown: BTreeMap<ChannelKind, ChannelStats> = BTreeMap::new();
        let mut last_sync_times: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
        let mut processing_secs = 0.0;
        let mut timed = 0u64;

        for job in jobs {
            *status_breakdown.entry(job.status).or_default() += 1;

            for channel in &job.channels {
                let stats = channel_breakdown.entry(*channel).or_default();
                stats.requested += 1;
                match job.channel_results.get(channel) {
                    Some(r) if r.is_success() => stats.succeeded += 1,
                    Some(_) => stats.failed += 1,
                    None => {}
                }
            }

            last_sync_times
                .entry(job.document_ref.clone())
                .and_modify(|at| *at = (*at).max(job.created_at))
                .or_insert(job.created_at);

            if let Some(elapsed) = job.processing_time() {
                processing_secs += elapsed.num_milliseconds().max(0) as f64 / 1000.0;
                timed += 1;
            }
        }

        let count = |s: JobStatus| status_breakdown.get(&s).copied().unwrap_or(0);
        let completed = count(JobStatus::Completed);
        let settled = completed + count(JobStatus::Failed) + count(JobStatus::Partial);
        let active = count(JobStatus::Pending) + count(JobStatus::InProgress);

        Self {
            total_jobs: jobs.len() as u64,
            active_jobs: active,
            success_rate: if settled == 0 {
                0.0
            } else {
                completed as f64 / settled as f64
            },
            average_processing_time: if timed == 0 {
                0.0
            } else {
                processing_secs / timed as f64
            },
            status_breakdown,
            channel_breakdown,
            last_sync_times,
            generated_at,
        }
    }
}

#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn JobStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    #[instrument(skip_all)]
    pub async fn snapshot(&self) -> Result<MetricsSnapshot> {
        let jobs = self.store.snapshot().await?;
        Ok(MetricsSnapshot::from_jobs(&jobs, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelResult, ErrorClass};
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn job(doc: &str, channels: &[ChannelKind]) -> SyncJob {
        SyncJob::new(doc, channels.iter().copied().collect::<BTreeSet<_>>(), "c", None, None)
    }

    fn settle(job: &mut SyncJob, ok: &[ChannelKind], secs: i64) {
        let at = job.started_at.unwrap() + Duration::seconds(secs);
        for channel in job.channels.clone() {
            let mut r = if ok.contains(&channel) {
                ChannelResult::success("c", None, 1)
            } else {
                ChannelResult::failure("c", "boom", ErrorClass::Permanent, 1)
            };
            r.recorded_at = at;
            job.apply_result(channel, r).unwrap();
        }
    }

    #[test]
    fn empty_store_reports_zeros() {
        let m = MetricsSnapshot::from_jobs(&[], Utc::now());
        assert_eq!(m.total_jobs, 0);
        assert_eq!(m.active_jobs, 0);
        assert_eq!(m.success_rate, 0.0);
        assert_eq!(m.average_processing_time, 0.0);
        assert_eq!(m.status_breakdown.len(), JobStatus::ALL.len());
        assert!(m.status_breakdown.values().all(|n| *n == 0));
        assert!(m.last_sync_times.is_empty());
    }

    #[test]
    fn rates_breakdowns_and_last_sync() {
        use ChannelKind::*;
        let mut a = job("gdocs:a", &[Email, Web]);
        settle(&mut a, &[Email, Web], 2);
        let mut b = job("gdocs:a", &[Email, Social]);
        settle(&mut b, &[Email], 4);
        let mut c = job("gdocs:b", &[Web]);
        settle(&mut c, &[], 6);
        let d = job("gdocs:c", &[Email]);
        let mut e = job("gdocs:c", &[Email]);
        e.status = JobStatus::Pending;
        e.started_at = None;
        e.cancel(Utc::now()).unwrap();

        let jobs = vec![a.clone(), b.clone(), c, d, e];
        let m = MetricsSnapshot::from_jobs(&jobs, Utc::now());

        assert_eq!(m.total_jobs, 5);
        assert_eq!(m.active_jobs, 1);
        assert_eq!(m.status_breakdown[&JobStatus::Completed], 1);
        assert_eq!(m.status_breakdown[&JobStatus::Partial], 1);
        assert_eq!(m.status_breakdown[&JobStatus::Failed], 1);
        assert_eq!(m.status_breakdown[&JobStatus::InProgress], 1);
        assert_eq!(m.status_breakdown[&JobStatus::Cancelled], 1);
        assert_eq!(m.status_breakdown[&JobStatus::Pending], 0);
        // cancelled jobs stay out of the denominator
        assert!((m.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((m.average_processing_time - 4.0).abs() < 1e-9);

        assert_eq!(
            m.channel_breakdown[&Email],
            ChannelStats {
                requested: 4,
                succeeded: 2,
                failed: 0
            }
        );
        assert_eq!(
            m.channel_breakdown[&Web],
            ChannelStats {
                requested: 2,
                succeeded: 1,
                failed: 1
            }
        );
        assert_eq!(m.channel_breakdown[&Social].failed, 1);

        assert_eq!(m.last_sync_times["gdocs:a"], a.created_at.max(b.created_at));
        assert_eq!(m.last_sync_times.len(), 3);
    }
}
