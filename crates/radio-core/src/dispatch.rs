//! Delivery of job requests to workers.
//!
//! In [`DispatchMode::Reply`] the job request travels back to whoever sent the
//! offer, as the synchronous response, and nothing else happens. In
//! [`DispatchMode::Forward`] the broker also POSTs it to a configured worker.
//! The broker runs forwarding in the background, so the result leg and the
//! dispatch leg stay decoupled.

use crate::error::{Error, Result};
use crate::protocol::JobRequest;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// How job requests reach workers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Return the job request to the offer's caller.
    #[default]
    Reply,
    /// Send the job request to a worker endpoint.
    Forward,
}

/// Sends job requests onward.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Deliver `request`. An error means the worker never received it.
    async fn dispatch(&self, request: &JobRequest) -> Result<()>;

    fn mode(&self) -> DispatchMode;
}

/// Dispatcher for the synchronous reply flow; delivery is the HTTP response.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyDispatcher;

#[async_trait]
impl Dispatcher for ReplyDispatcher {
    async fn dispatch(&self, request: &JobRequest) -> Result<()> {
        debug!("Job request {} is delivered in the offer response", request.id);
        Ok(())
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Reply
    }
}

/// POSTs job requests as JSON to a worker endpoint.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    http_client: Client,
    worker_url: String,
}

impl HttpDispatcher {
    /// Create a dispatcher whose requests give up after `timeout`.
    pub fn new(worker_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DispatchFailure(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            worker_url: worker_url.into(),
        })
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &JobRequest) -> Result<()> {
        let response = self
            .http_client
            .post(&self.worker_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() { "timed out" } else { "unreachable" };
                Error::DispatchFailure(format!("Worker {} {}: {}", self.worker_url, kind, e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::DispatchFailure(format!(
                "Worker rejected job {} ({}): {}",
                request.id, status, error_text
            )));
        }

        info!("Dispatched job {} to {}", request.id, self.worker_url);
        Ok(())
    }

    fn mode(&self) -> DispatchMode {
        DispatchMode::Forward
    }
}
