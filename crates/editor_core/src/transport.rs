use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use shared::{
    error::ApiError,
    protocol::{ActionBatch, MultiResponse, ServiceAction},
};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::EditorSettings;

pub const MULTI_REQUEST_PATH: &str = "service/multirequest";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid server url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Http(String),
    #[error("server responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode server response: {0}")]
    Decode(String),
    #[error("server returned {received} results for {sent} actions")]
    ResultCount { sent: usize, received: usize },
    #[error("{0}")]
    Api(ApiError),
}

/// Remote action execution. `multi_request` evaluates the batch as one transaction;
/// each response may carry its own error.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn multi_request(&self, batch: ActionBatch) -> Result<MultiResponse, TransportError>;

    async fn request(&self, action: ServiceAction) -> Result<Value, TransportError> {
        let response = self.multi_request(ActionBatch::single(action)).await?;
        let received = response.responses.len();
        let Some(single) = response.responses.into_iter().next() else {
            return Err(TransportError::ResultCount { sent: 1, received });
        };
        single.into_result().map_err(TransportError::Api)
    }
}

/// JSON over HTTP against the catalogue server's multi-request endpoint.
pub struct HttpTransport {
    http: Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(settings: &EditorSettings) -> Result<Self, TransportError> {
        let endpoint = endpoint_for(&settings.server_url)?;
        let http = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

pub fn endpoint_for(server_url: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUrl {
        url: server_url.to_string(),
        reason,
    };
    let mut base = Url::parse(server_url.trim()).map_err(|err| invalid(err.to_string()))?;
    if base.cannot_be_a_base() {
        return Err(invalid("url cannot be used as a base".into()));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(MULTI_REQUEST_PATH)
        .map_err(|err| invalid(err.to_string()))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn multi_request(&self, batch: ActionBatch) -> Result<MultiResponse, TransportError> {
        let sent = batch.len();
        debug!(endpoint = %self.endpoint, actions = sent, "sending multirequest");
        let res = self
            .http
            .post(self.endpoint.clone())
            .json(&batch)
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "multirequest rejected");
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let response: MultiResponse = res
            .json()
            .await
            .map_err(|err| TransportError::Decode(err.to_string()))?;
        if response.responses.len() != sent {
            return Err(TransportError::ResultCount {
                sent,
                received: response.responses.len(),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
