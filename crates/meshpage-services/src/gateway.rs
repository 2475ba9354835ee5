//! Paging gateway client.
//!
//! The gateway contract is a single JSON POST with HTTP basic auth:
//!
//!   {"text": "...", "callSignNames": ["..."], "transmitterGroupNames": ["..."], "emergency": false}
//!
//! Only a 200 response counts as delivered. Every other outcome is reported
//! as a `GatewayError` and left to the forwarder's retry policy.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of one paging call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingRequest {
    pub text: String,
    pub call_sign_names: Vec<String>,
    pub transmitter_group_names: Vec<String>,
    pub emergency: bool,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway returned status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway connection failed: {0}")]
    Connect(String),
    #[error("gateway request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Something that can deliver a page. One call is one attempt; retries
/// live in the forwarder.
pub trait PagingGateway: Send + Sync {
    fn deliver<'a>(&'a self, request: &'a PagingRequest) -> BoxFuture<'a, Result<(), GatewayError>>;
}

/// reqwest-backed gateway for DAPNET-style HTTP APIs.
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl HttpGateway {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            username: username.into(),
            password: password.into(),
        })
    }
}

impl PagingGateway for HttpGateway {
    fn deliver<'a>(&'a self, request: &'a PagingRequest) -> BoxFuture<'a, Result<(), GatewayError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .basic_auth(&self.username, Some(&self.password))
                .json(request)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::OK {
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::Status {
                code: status.as_u16(),
                body,
            })
        })
    }
}
