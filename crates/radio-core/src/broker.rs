//! The broker: the request/response handshake on top of the correlator.
//!
//! Offers come in, get verified and turned into jobs, and a job request goes
//! back out. Results come in later, get decoded and stored against the job
//! they name, and an acknowledgement goes back out.

use crate::blob::{BlobStore, DiskBlobStore};
use crate::config::BrokerConfig;
use crate::correlator::JobCorrelator;
use crate::decoder::{self, AudioResult, Message};
use crate::dispatch::{DispatchMode, Dispatcher, HttpDispatcher, ReplyDispatcher};
use crate::error::{Error, Result};
use crate::job::{JobResult, JobView, ResultPayload};
use crate::protocol::{Acknowledgement, Envelope, JobRequest, OutboundMessage, ServiceOffer};
use crate::retry::RetryPolicy;
use crate::store::{MemoryStore, StoreStats};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const AUDIO_RESPONSE_MESSAGE: &str = "Audio response received";
const AUDIO_FILE_MESSAGE: &str = "Audio file saved";
const JSON_RESULT_MESSAGE: &str = "JSON result received";

/// Composes decoding, correlation, blob storage and dispatch.
pub struct Broker {
    correlator: Arc<JobCorrelator>,
    blobs: Arc<dyn BlobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    retry: RetryPolicy,
    completed_ttl: Option<Duration>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("correlator", &self.correlator)
            .field("dispatch_mode", &self.dispatcher.mode())
            .field("retry", &self.retry)
            .field("completed_ttl", &self.completed_ttl)
            .finish()
    }
}

impl Broker {
    pub fn new(
        correlator: Arc<JobCorrelator>,
        blobs: Arc<dyn BlobStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let retry = correlator.settings().retry;
        Self {
            correlator,
            blobs,
            dispatcher,
            retry,
            completed_ttl: None,
        }
    }

    /// Keep finished jobs for `ttl` before [`evict_expired`](Self::evict_expired) drops them.
    pub fn with_completed_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.completed_ttl = ttl;
        self
    }

    /// Build a broker with an in-memory job store and an on-disk blob store.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(MemoryStore::new());
        let correlator = Arc::new(JobCorrelator::new(store, config.correlator_settings()));
        let blobs = Arc::new(DiskBlobStore::new(config.storage.blob_dir.clone()));

        let dispatcher: Arc<dyn Dispatcher> = match config.dispatch.mode {
            DispatchMode::Reply => Arc::new(ReplyDispatcher),
            DispatchMode::Forward => {
                let worker_url = config.dispatch.worker_url.as_deref().ok_or_else(|| {
                    Error::InvalidConfig("Forward dispatch requires a worker URL".to_string())
                })?;
                Arc::new(HttpDispatcher::new(worker_url, config.dispatch_timeout())?)
            }
        };

        info!(
            "Broker configured: dispatch={:?}, overwrite={:?}, blob_dir={}",
            config.dispatch.mode,
            config.overwrite_policy,
            config.storage.blob_dir.display()
        );

        Ok(Self::new(correlator, blobs, dispatcher).with_completed_ttl(config.completed_ttl()))
    }

    pub fn correlator(&self) -> &Arc<JobCorrelator> {
        &self.correlator
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.dispatcher.mode()
    }

    /// Handle a payload from the offer channel.
    ///
    /// Offers are answered with a [`JobRequest`]; results carrying `audio_url`
    /// or raw audio bytes are stored and acknowledged.
    pub async fn handle_inbound(&self, raw: &[u8], envelope: &Envelope) -> Result<OutboundMessage> {
        match decoder::decode_with_hint(raw, envelope.content_type.as_deref()) {
            Message::ServiceOffer(offer) => self
                .accept_offer(offer, envelope.idempotency_key.as_deref())
                .await
                .map(OutboundMessage::JobRequest),
            Message::AudioResult(AudioResult::Json(map)) => {
                debug!("Received audio response: {:?}", map);
                self.store_result(AudioResult::Json(map), envelope, AUDIO_RESPONSE_MESSAGE)
                    .await
                    .map(OutboundMessage::Acknowledgement)
            }
            Message::AudioResult(result) => self
                .store_result(result, envelope, AUDIO_FILE_MESSAGE)
                .await
                .map(OutboundMessage::Acknowledgement),
            Message::Malformed(reason) => {
                warn!("Rejected inbound payload: {}", reason);
                Err(Error::Malformed(reason))
            }
        }
    }

    /// Handle a payload from the result channel. Any JSON object counts as a result.
    pub async fn handle_result(&self, raw: &[u8], envelope: &Envelope) -> Result<Acknowledgement> {
        match decoder::decode_result(raw, envelope.content_type.as_deref()) {
            Message::AudioResult(AudioResult::Json(map)) => {
                self.store_result(AudioResult::Json(map), envelope, JSON_RESULT_MESSAGE)
                    .await
            }
            Message::AudioResult(result) => {
                self.store_result(result, envelope, AUDIO_FILE_MESSAGE).await
            }
            Message::ServiceOffer(_) => Err(Error::Malformed(
                "Service offers are not accepted on the result channel".to_string(),
            )),
            Message::Malformed(reason) => {
                warn!("Rejected result payload: {}", reason);
                Err(Error::Malformed(reason))
            }
        }
    }

    async fn accept_offer(
        &self,
        offer: ServiceOffer,
        idempotency_key: Option<&str>,
    ) -> Result<JobRequest> {
        let admission = self
            .correlator
            .accept_offer_with_key(offer, idempotency_key)
            .await?;
        if admission.replayed {
            return Ok(admission.request);
        }

        let request = admission.request;
        match self.dispatcher.mode() {
            DispatchMode::Reply => {
                if let Err(e) = self.dispatcher.dispatch(&request).await {
                    self.record_dispatch_failure(request.id, &e).await;
                    return Err(e);
                }
            }
            DispatchMode::Forward => {
                let correlator = Arc::clone(&self.correlator);
                let dispatcher = Arc::clone(&self.dispatcher);
                let forwarded = request.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.dispatch(&forwarded).await {
                        if let Err(mark_err) =
                            correlator.mark_failed(forwarded.id, e.to_string()).await
                        {
                            error!("Failed to mark job {} as failed: {}", forwarded.id, mark_err);
                        }
                    }
                });
            }
        }

        Ok(request)
    }

    async fn record_dispatch_failure(&self, job_id: Uuid, cause: &Error) {
        if let Err(e) = self.correlator.mark_failed(job_id, cause.to_string()).await {
            error!("Failed to mark job {} as failed: {}", job_id, e);
        }
    }

    async fn store_result(
        &self,
        result: AudioResult,
        envelope: &Envelope,
        message: &str,
    ) -> Result<Acknowledgement> {
        let job_id = resolve_job_id(&result, envelope)?;

        let (payload, filename) = match result {
            AudioResult::Json(map) => (ResultPayload::Json(map), None),
            AudioResult::Binary { bytes, extension } => {
                // Nothing is written for a job that would reject the result.
                self.correlator.ensure_accepts_result(job_id).await?;

                let size = bytes.len();
                let handle = self
                    .retry
                    .run("write blob", || {
                        self.blobs.write(&job_id, &extension, bytes.clone())
                    })
                    .await?;
                info!("Saved audio file {} for job {}", handle, job_id);

                let payload = ResultPayload::Binary {
                    handle: handle.clone(),
                    extension,
                    size,
                };
                (payload, Some(handle))
            }
        };

        let job = match self
            .correlator
            .correlate_result(job_id, JobResult::new(payload))
            .await
        {
            Ok(job) => job,
            Err(e) => {
                // The job kept another result; drop the bytes written for this one.
                if let Some(handle) = &filename {
                    self.discard_blob(handle).await;
                }
                return Err(e);
            }
        };

        Ok(Acknowledgement {
            message: message.to_string(),
            id: job.job_id,
            state: job.state,
            filename,
        })
    }

    async fn discard_blob(&self, handle: &str) {
        match self.blobs.delete(handle).await {
            Ok(()) => debug!("Discarded rejected audio file {}", handle),
            Err(e) => warn!("Failed to discard rejected audio file {}: {}", handle, e),
        }
    }

    /// The stored audio bytes of a job's binary result, with their extension.
    ///
    /// `None` when the job has no result yet or its result is JSON.
    pub async fn fetch_binary_result(&self, job_id: Uuid) -> Result<Option<(Bytes, String)>> {
        let job = self.correlator.get(job_id).await?;
        let Some(ResultPayload::Binary { handle, extension, .. }) =
            job.result.map(|result| result.payload)
        else {
            return Ok(None);
        };

        let bytes = self
            .retry
            .run("read blob", || self.blobs.read(&handle))
            .await?;
        Ok(Some((bytes, extension)))
    }

    /// Read-only projection of a job for polling.
    pub async fn get_job(&self, job_id: Uuid) -> Result<JobView> {
        let job = self.correlator.get(job_id).await?;
        Ok(JobView::from(&job))
    }

    /// Jobs still waiting for a result, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<JobView>> {
        let snapshot = self.correlator.list_pending().await?;
        Ok(snapshot.iter().map(JobView::from).collect())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.correlator.stats().await
    }

    /// Drop finished jobs older than the configured TTL. No TTL keeps everything.
    pub async fn evict_expired(&self) -> Result<usize> {
        let Some(ttl) = self.completed_ttl else {
            return Ok(0);
        };
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidConfig(format!("Retention TTL out of range: {}", e)))?;
        self.correlator.evict_finished_before(Utc::now() - ttl).await
    }
}

/// The job a result belongs to: its `id` field, or the envelope's job id.
fn resolve_job_id(result: &AudioResult, envelope: &Envelope) -> Result<Uuid> {
    match (result.embedded_job_id(), envelope.job_id) {
        (Some(Ok(embedded)), Some(header)) if embedded != header => Err(Error::Malformed(format!(
            "Result id {} does not match job id header {}",
            embedded, header
        ))),
        (Some(Ok(embedded)), _) => Ok(embedded),
        (Some(Err(_)), Some(header)) => Ok(header),
        (Some(Err(e)), None) => Err(e),
        (None, Some(header)) => Ok(header),
        (None, None) => Err(Error::Malformed(
            "Binary result requires a job id header".to_string(),
        )),
    }
}
