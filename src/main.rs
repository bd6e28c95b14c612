use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use reqwest::Url;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use content_relay::config::{self, Config};
use content_relay::content::{FileFetcher, PlainRenderer};
use content_relay::dispatch::{DispatcherRegistry, WebhookDispatcher};
use content_relay::store::{ListFilter, SqliteJobStore};
use content_relay::{
    ChannelKind, JobId, JobStatus, MetricsAggregator, Orchestrator, RetryCoordinator, SyncRequest,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Publish marketing documents to email, web and social channels")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a document for delivery and wait for the job to finish
    Submit {
        /// Document reference, e.g. `file:posts/launch.md`
        document_ref: String,
        /// Target channels (repeatable or comma separated)
        #[arg(long = "channel", short, required = true, value_delimiter = ',')]
        channels: Vec<String>,
        #[arg(long)]
        correlation_id: Option<String>,
        /// RFC 3339 time to defer the job to
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Print the receipt and exit without waiting
        #[arg(long)]
        no_wait: bool,
    },
    /// Show one job with its channel results
    Get { job_id: JobId },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        channel: Option<ChannelKind>,
        #[arg(long)]
        limit: Option<u32>,
        /// 1-based page number
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Print aggregate statistics
    Metrics,
    /// Retry the failed channels of a failed or partial job
    Retry { job_id: JobId },
    /// Cancel a job that has not started yet
    Cancel { job_id: JobId },
    /// Run jobs left pending by an earlier invocation
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let store = Arc::new(SqliteJobStore::connect(&cfg.database_url()).await?);
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(FileFetcher::new(".")),
        Arc::new(PlainRenderer),
        build_dispatchers(&cfg)?,
        cfg.orchestrator_settings(),
    );

    match args.command {
        Command::Submit {
            document_ref,
            channels,
            correlation_id,
            at,
            no_wait,
        } => {
            let mut request = SyncRequest::new(document_ref, channels);
            request.correlation_id = correlation_id;
            request.scheduled_for = at;
            let receipt = orchestrator.submit(request).await?;
            if no_wait {
                print_json(&receipt)?;
            } else {
                print_json(&orchestrator.wait_for(receipt.job_id).await?)?;
            }
        }
        Command::Get { job_id } => print_json(&orchestrator.store().get(job_id).await?)?,
        Command::List {
            status,
            channel,
            limit,
            page,
        } => {
            let mut filter = ListFilter {
                status,
                channel,
                limit,
                offset: 0,
            };
            filter.offset = page.saturating_sub(1).saturating_mul(filter.effective_limit());
            print_json(&orchestrator.store().list(&filter).await?)?;
        }
        Command::Metrics => {
            let metrics = MetricsAggregator::new(store.clone());
            print_json(&metrics.snapshot().await?)?;
        }
        Command::Retry { job_id } => {
            let receipt = RetryCoordinator::new(orchestrator.clone()).retry(job_id).await?;
            print_json(&orchestrator.wait_for(receipt.job.job_id).await?)?;
        }
        Command::Cancel { job_id } => {
            orchestrator.cancel(job_id).await?;
            print_json(&orchestrator.store().get(job_id).await?)?;
        }
        Command::Resume => {
            let resumed = orchestrator.resume_pending().await?;
            info!(jobs = resumed.len(), "waiting for resumed jobs");
            let mut finished = Vec::with_capacity(resumed.len());
            for job_id in resumed {
                finished.push(orchestrator.wait_for(job_id).await?.summary());
            }
            print_json(&finished)?;
        }
    }

    Ok(())
}

fn build_dispatchers(cfg: &Config) -> Result<DispatcherRegistry> {
    let timeout = cfg.retry_policy().attempt_timeout;
    let mut registry = DispatcherRegistry::new();
    for (channel, endpoint) in &cfg.channels {
        let url = Url::parse(endpoint.endpoint.trim())
            .with_context(|| format!("invalid endpoint for channel {}", channel))?;
        let dispatcher = WebhookDispatcher::new(url, endpoint.token.clone(), timeout)?;
        registry = registry.register(*channel, Arc::new(dispatcher));
    }
    Ok(registry)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
