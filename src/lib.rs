//! Content relay: fans one marketing document out to email, web and social
//! channels, tracking every delivery as a job.
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod store;

pub use error::{Result, SyncError};
pub use metrics::{MetricsAggregator, MetricsSnapshot};
pub use model::{ChannelKind, ChannelResult, JobId, JobStatus, SyncJob};
pub use orchestrator::{JobReceipt, Orchestrator, OrchestratorSettings, SyncRequest};
pub use retry::{RetryCoordinator, RetryReceipt};
