use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| SyncError::invalid(format!("`{}` is not a job id", s)))
    }
}

/// A delivery target. Social variants share the generic `social` behavior
/// but are tracked separately so one platform can fail on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Web,
    Social,
    Twitter,
    Linkedin,
    Facebook,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Email,
        ChannelKind::Web,
        ChannelKind::Social,
        ChannelKind::Twitter,
        ChannelKind::Linkedin,
        ChannelKind::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Web => "web",
            ChannelKind::Social => "social",
            ChannelKind::Twitter => "twitter",
            ChannelKind::Linkedin => "linkedin",
            ChannelKind::Facebook => "facebook",
        }
    }

    pub fn is_social(&self) -> bool {
        matches!(
            self,
            ChannelKind::Social | ChannelKind::Twitter | ChannelKind::Linkedin | ChannelKind::Facebook
        )
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        ChannelKind::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| SyncError::invalid(format!("unknown channel kind `{}`", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Partial,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Partial => "partial",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_status(s: &str) -> Option<JobStatus> {
        JobStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::parse_status(&s.trim().to_ascii_lowercase())
            .ok_or_else(|| SyncError::invalid(format!("unknown job status `{}`", s)))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Outcome> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }

    pub fn parse_class(s: &str) -> Option<ErrorClass> {
        match s {
            "transient" => Some(ErrorClass::Transient),
            "permanent" => Some(ErrorClass::Permanent),
            _ => None,
        }
    }
}

/// Outcome of one channel's dispatch, written once per attempt cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelResult {
    pub outcome: Outcome,
    pub delivery_ref: Option<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub attempts: u32,
    pub correlation_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl ChannelResult {
    pub fn success(correlation_id: &str, delivery_ref: Option<String>, attempts: u32) -> Self {
        Self {
            outcome: Outcome::Success,
            delivery_ref,
            error: None,
            error_class: None,
            attempts,
            correlation_id: correlation_id.to_string(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(
        correlation_id: &str,
        error: impl Into<String>,
        class: ErrorClass,
        attempts: u32,
    ) -> Self {
        Self {
            outcome: Outcome::Failure,
            delivery_ref: None,
            error: Some(error.into()),
            error_class: Some(class),
            attempts,
            correlation_id: correlation_id.to_string(),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// One request to publish a document to a set of channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncJob {
    pub job_id: JobId,
    pub document_ref: String,
    pub channels: BTreeSet<ChannelKind>,
    pub correlation_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub channel_results: BTreeMap<ChannelKind, ChannelResult>,
    pub parent_job_id: Option<JobId>,
}

impl SyncJob {
    /// Build a fresh job. Without a schedule the job starts out `in_progress`.
    pub fn new(
        document_ref: impl Into<String>,
        channels: BTreeSet<ChannelKind>,
        correlation_id: impl Into<String>,
        scheduled_for: Option<DateTime<Utc>>,
        parent_job_id: Option<JobId>,
    ) -> Self {
        let now = Utc::now();
        let (status, started_at) = match scheduled_for {
            Some(at) if at > now => (JobStatus::Pending, None),
            _ => (JobStatus::InProgress, Some(now)),
        };
        Self {
            job_id: JobId::new(),
            document_ref: document_ref.into(),
            channels,
            correlation_id: correlation_id.into(),
            status,
            created_at: now,
            scheduled_for,
            started_at,
            completed_at: None,
            channel_results: BTreeMap::new(),
            parent_job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn reject_write(&self) -> SyncError {
        SyncError::InvalidState {
            job_id: self.job_id,
            status: self.status,
        }
    }

    /// `pending -> in_progress`.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(self.reject_write());
        }
        self.status = JobStatus::InProgress;
        self.started_at = Some(at.max(self.created_at));
        Ok(())
    }

    /// `pending -> cancelled`.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != JobStatus::Pending {
            return Err(SyncError::NotCancellable {
                job_id: self.job_id,
                status: self.status,
            });
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(at.max(self.created_at));
        Ok(())
    }

    /// Record one channel's result and promote the job once every channel
    /// has reported. Returns the status after the write.
    pub fn apply_result(&mut self, channel: ChannelKind, result: ChannelResult) -> Result<JobStatus> {
        if self.status != JobStatus::InProgress {
            return Err(self.reject_write());
        }
        if !self.channels.contains(&channel) {
            return Err(SyncError::invalid(format!(
                "channel {} is not part of job {}",
                channel, self.job_id
            )));
        }
        let recorded_at = result.recorded_at;
        self.channel_results.insert(channel, result);

        if let Some(settled) = self.settled_status() {
            self.status = settled;
            let floor = self.started_at.unwrap_or(self.created_at);
            self.completed_at = Some(recorded_at.max(floor));
        }
        Ok(self.status)
    }

    /// Aggregate status implied by the recorded results, if every channel has one.
    pub fn settled_status(&self) -> Option<JobStatus> {
        if self.channels.iter().any(|c| !self.channel_results.contains_key(c)) {
            return None;
        }
        let successes = self
            .channel_results
            .values()
            .filter(|r| r.is_success())
            .count();
        Some(if successes == self.channels.len() {
            JobStatus::Completed
        } else if successes == 0 {
            JobStatus::Failed
        } else {
            JobStatus::Partial
        })
    }

    pub fn failed_channels(&self) -> BTreeSet<ChannelKind> {
        self.channel_results
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if self.is_terminal() => Some(end - start),
            _ => None,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            document_ref: self.document_ref.clone(),
            status: self.status,
            channels: self.channels.clone(),
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
            parent_job_id: self.parent_job_id,
        }
    }
}

/// List view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: JobId,
    pub document_ref: String,
    pub status: JobStatus,
    pub channels: BTreeSet<ChannelKind>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_job_id: Option<JobId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(channels: &[ChannelKind]) -> SyncJob {
        SyncJob::new(
            "gdocs:abc",
            channels.iter().copied().collect(),
            "corr-1",
            None,
            None,
        )
    }

    fn ok() -> ChannelResult {
        ChannelResult::success("corr-1", Some("d-1".into()), 1)
    }

    fn failed() -> ChannelResult {
        ChannelResult::failure("corr-1", "boom", ErrorClass::Permanent, 1)
    }

    #[test]
    fn channel_kind_parses_case_insensitively() {
        assert_eq!("Email".parse::<ChannelKind>().unwrap(), ChannelKind::Email);
        assert_eq!(" linkedin ".parse::<ChannelKind>().unwrap(), ChannelKind::Linkedin);
        assert!(matches!(
            "fax".parse::<ChannelKind>(),
            Err(SyncError::InvalidRequest(_))
        ));
    }

    #[test]
    fn unscheduled_job_starts_in_progress() {
        let j = job(&[ChannelKind::Email]);
        assert_eq!(j.status, JobStatus::InProgress);
        assert_eq!(j.started_at, Some(j.created_at));
    }

    #[test]
    fn future_job_starts_pending() {
        let at = Utc::now() + chrono::Duration::minutes(5);
        let j = SyncJob::new("gdocs:abc", [ChannelKind::Web].into(), "c", Some(at), None);
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.started_at.is_none());
    }

    #[test]
    fn stays_in_progress_until_every_channel_reports() {
        let mut j = job(&[ChannelKind::Email, ChannelKind::Web]);
        assert_eq!(j.apply_result(ChannelKind::Email, ok()).unwrap(), JobStatus::InProgress);
        assert!(j.completed_at.is_none());
        assert_eq!(j.apply_result(ChannelKind::Web, ok()).unwrap(), JobStatus::Completed);
        assert!(j.completed_at.is_some());
    }

    #[test]
    fn aggregate_status_matches_outcomes() {
        let mut all_fail = job(&[ChannelKind::Email, ChannelKind::Social]);
        all_fail.apply_result(ChannelKind::Email, failed()).unwrap();
        assert_eq!(all_fail.apply_result(ChannelKind::Social, failed()).unwrap(), JobStatus::Failed);

        let mut mixed = job(&[ChannelKind::Email, ChannelKind::Social]);
        mixed.apply_result(ChannelKind::Email, ok()).unwrap();
        assert_eq!(mixed.apply_result(ChannelKind::Social, failed()).unwrap(), JobStatus::Partial);
        assert_eq!(mixed.failed_channels(), [ChannelKind::Social].into());
    }

    #[test]
    fn terminal_job_rejects_writes() {
        let mut j = job(&[ChannelKind::Email]);
        j.apply_result(ChannelKind::Email, ok()).unwrap();
        let before = j.clone();
        let err = j.apply_result(ChannelKind::Email, failed()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { status: JobStatus::Completed, .. }));
        assert_eq!(j, before);
    }

    #[test]
    fn result_for_unrequested_channel_is_rejected() {
        let mut j = job(&[ChannelKind::Email]);
        let err = j.apply_result(ChannelKind::Web, ok()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
        assert!(j.channel_results.is_empty());
    }

    #[test]
    fn pending_job_cannot_take_results_but_can_cancel() {
        let at = Utc::now() + chrono::Duration::minutes(5);
        let mut j = SyncJob::new("gdocs:abc", [ChannelKind::Web].into(), "c", Some(at), None);
        assert!(matches!(
            j.apply_result(ChannelKind::Web, ok()),
            Err(SyncError::InvalidState { .. })
        ));
        j.cancel(Utc::now()).unwrap();
        assert_eq!(j.status, JobStatus::Cancelled);
        assert!(matches!(j.start(Utc::now()), Err(SyncError::InvalidState { .. })));
        assert!(matches!(j.cancel(Utc::now()), Err(SyncError::NotCancellable { .. })));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for st in JobStatus::ALL {
            assert_eq!(JobStatus::parse_status(st.as_str()), Some(st));
        }
        assert_eq!("IN_PROGRESS".parse::<JobStatus>().unwrap(), JobStatus::InProgress);
    }
}
