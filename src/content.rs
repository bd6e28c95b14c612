//! Source documents and per-channel payloads.
//!
//! Fetching and rendering are collaborators of the orchestrator. The local
//! implementations here cover `file:` documents and plain-text rendering; richer
//! sources plug in through [`DocumentFetcher`] and [`ContentRenderer`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{FetchError, RenderError, SyncError};
use crate::model::ChannelKind;

static DOCUMENT_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z][a-z0-9+.-]*):(\S+)$").expect("valid document ref regex"));

/// `scheme:identifier`, e.g. `gdocs:1AbC`, `notion:page-id`, `file:./post.md`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    scheme: String,
    id: String,
}

impl DocumentRef {
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let caps = DOCUMENT_REF.captures(raw.trim()).ok_or_else(|| {
            SyncError::invalid(format!("document_ref `{}` must look like scheme:identifier", raw))
        })?;
        Ok(Self {
            scheme: caps[1].to_string(),
            id: caps[2].to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub document_ref: String,
    pub title: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// What a channel dispatcher receives; serialized as-is by the webhook client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: ChannelKind,
    pub document_ref: String,
    pub correlation_id: String,
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub correlation_id: String,
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, document: &DocumentRef) -> Result<RawContent, FetchError>;
}

pub trait ContentRenderer: Send + Sync {
    fn render(
        &self,
        content: &RawContent,
        channel: ChannelKind,
        options: &RenderOptions,
    ) -> Result<ChannelPayload, RenderError>;
}

/// Reads `file:` documents relative to `root`. The first `# ` heading, if
/// any, becomes the title.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentFetcher for FileFetcher {
    async fn fetch(&self, document: &DocumentRef) -> Result<RawContent, FetchError> {
        if document.scheme() != "file" {
            return Err(FetchError::Unsupported(document.scheme().to_string()));
        }
        let path = self.root.join(document.id());
        debug!(path = %path.display(), "reading document");
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(document.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let title = text
            .lines()
            .find_map(|l| l.strip_prefix("# "))
            .map(|t| t.trim().to_string());
        let body = text
            .lines()
            .filter(|l| !l.starts_with("# "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();
        Ok(RawContent {
            document_ref: document.to_string(),
            title,
            body,
            fetched_at: Utc::now(),
        })
    }
}

/// Plain-text rendering: email gets a subject line, web the full body, social
/// variants a body cut to the platform's length limit.
#[derive(Debug, Clone, Default)]
pub struct PlainRenderer;

pub fn social_char_limit(channel: ChannelKind) -> Option<usize> {
    match channel {
        ChannelKind::Twitter => Some(280),
        ChannelKind::Linkedin => Some(3000),
        ChannelKind::Facebook | ChannelKind::Social => Some(2000),
        ChannelKind::Email | ChannelKind::Web => None,
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

impl ContentRenderer for PlainRenderer {
    fn render(
        &self,
        content: &RawContent,
        channel: ChannelKind,
        options: &RenderOptions,
    ) -> Result<ChannelPayload, RenderError> {
        if content.body.trim().is_empty() && content.title.is_none() {
            return Err(RenderError::Empty);
        }

        let (subject, body) = match channel {
            ChannelKind::Email => (
                Some(content.title.clone().unwrap_or_else(|| content.document_ref.clone())),
                content.body.clone(),
            ),
            ChannelKind::Web => (content.title.clone(), content.body.clone()),
            social => {
                let text = match &content.title {
                    Some(title) if !content.body.is_empty() => format!("{}\n\n{}", title, content.body),
                    Some(title) => title.clone(),
                    None => content.body.clone(),
                };
                let limit = social_char_limit(social).unwrap_or(usize::MAX);
                (None, truncate_chars(&text, limit))
            }
        };

        Ok(ChannelPayload {
            channel,
            document_ref: content.document_ref.clone(),
            correlation_id: options.correlation_id.clone(),
            subject,
            body,
        })
    }
}
