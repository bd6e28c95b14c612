use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::{ChannelDispatcher, Delivery};
use crate::content::ChannelPayload;
use crate::error::DispatchError;

/// Forwards rendered payloads as JSON to a channel's delivery endpoint
/// (mail relay, CMS hook, social scheduler) with bearer auth.
#[derive(Clone)]
pub struct WebhookDispatcher {
    http: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct DeliveryResponse {
    id: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(endpoint: Url, token: String, timeout: Duration) -> Result<Self, DispatchError> {
        let http = Client::builder()
            .user_agent(concat!("content-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::permanent(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    pub fn build_request(&self, payload: &ChannelPayload) -> Result<reqwest::Request, DispatchError> {
        self.http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-Correlation-Id", &payload.correlation_id)
            .header("Content-Type", "application/json")
            .json(payload)
            .build()
            .map_err(|e| DispatchError::permanent(format!("failed to build request: {}", e)))
    }
}

/// Retry classification of a non-success HTTP status.
pub fn classify_status(status: StatusCode, body: &str) -> DispatchError {
    let msg = format!("endpoint responded {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        DispatchError::Transient(msg)
    } else {
        DispatchError::Permanent(msg)
    }
}

fn classify_transport(err: reqwest::Error) -> DispatchError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        DispatchError::transient(format!("failed to reach endpoint: {}", err))
    } else {
        DispatchError::permanent(format!("request failed: {}", err))
    }
}

#[async_trait]
impl ChannelDispatcher for WebhookDispatcher {
    async fn dispatch(&self, payload: &ChannelPayload) -> Result<Delivery, DispatchError> {
        let request = self.build_request(payload)?;
        debug!(url = %request.url(), channel = %payload.channel, "sending delivery request");
        let res = self.http.execute(request).await.map_err(classify_transport)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = res.text().await.map_err(classify_transport)?;
        let reference = serde_json::from_str::<DeliveryResponse>(&body)
            .ok()
            .and_then(|r| r.id)
            .filter(|id| !id.trim().is_empty());
        Ok(Delivery { reference })
    }
}
