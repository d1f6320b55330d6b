//! Protocol definitions for the Radio broker.
//!
//! This module defines the wire shapes exchanged with providers and workers:
//! the signed [`ServiceOffer`] a provider announces, the [`JobRequest`] the
//! broker emits in return, and the acknowledgements sent for results.

use crate::job::JobState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Feature flags a provider declares in its offer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub receipt_analysis: bool,
    pub data_processing: bool,
    pub data_storage: bool,
}

/// The signed part of a service offer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceOfferData {
    /// Message discriminator, always `"service_offer"` for accepted offers.
    #[serde(rename = "type")]
    pub kind: String,
    /// ISO-8601 timestamp set by the provider.
    pub timestamp: String,
    /// Provider identifier.
    pub provider: String,
    pub capabilities: Capabilities,
    /// Fields outside the known schema. Kept so that the canonical encoding
    /// covers everything the provider signed.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ServiceOfferData {
    /// Build offer data stamped with the current time.
    pub fn new(provider: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            kind: constants::SERVICE_OFFER_TYPE.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            provider: provider.into(),
            capabilities,
            extra: BTreeMap::new(),
        }
    }
}

/// A capability announcement signed by the provider's key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceOffer {
    pub data: ServiceOfferData,
    /// Base58-encoded signature over the canonical encoding of `data`.
    pub signature: String,
    /// Base58-encoded public key of the signer.
    pub pubkey: String,
}

/// The job request the broker sends back for an accepted offer.
///
/// `id` is the correlation id: workers must echo it when delivering the result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub script: String,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

impl JobRequest {
    pub fn new(id: Uuid, script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            id,
            voice_id: None,
            kind: constants::RECEIPT_REQUEST_TYPE.to_string(),
        }
    }
}

/// Acknowledgement returned once a result has been stored against its job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    pub message: String,
    pub id: Uuid,
    pub state: JobState,
    /// Storage handle of a binary result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Everything the broker can answer on the ingress channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutboundMessage {
    JobRequest(JobRequest),
    Acknowledgement(Acknowledgement),
}

/// Envelope metadata the transport hands over together with a raw payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Content-type hint, e.g. `audio/mpeg`.
    pub content_type: Option<String>,
    /// Correlation id supplied out-of-band (binary results).
    pub job_id: Option<Uuid>,
    /// Caller-chosen key that makes offer acceptance idempotent.
    pub idempotency_key: Option<String>,
}

impl Envelope {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Protocol constants.
pub mod constants {
    /// `data.type` value identifying a service offer.
    pub const SERVICE_OFFER_TYPE: &str = "service_offer";

    /// `type` value of the job requests the broker emits.
    pub const RECEIPT_REQUEST_TYPE: &str = "receipt_request";

    /// Script sent to workers when none is configured.
    pub const DEFAULT_SCRIPT: &str = "hello from Anthony at FXN";

    /// Field of a JSON result that carries the job id.
    pub const RESULT_ID_FIELD: &str = "id";

    /// Field that marks a JSON message as an audio result.
    pub const AUDIO_URL_FIELD: &str = "audio_url";

    /// Header carrying the job id of a binary result.
    pub const JOB_ID_HEADER: &str = "x-job-id";

    /// Header carrying an idempotency key for offers.
    pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

    /// Tolerated clock skew for offer timestamps (in seconds).
    pub const CLOCK_SKEW_TOLERANCE_SECS: u64 = 300;

    /// Media extension assumed when nothing identifies a binary result.
    pub const DEFAULT_MEDIA_EXTENSION: &str = "mp3";
}
