//! # Radio Core
//!
//! This crate provides the core of the Radio job broker: providers announce
//! their capabilities with signed service offers, the broker turns each
//! accepted offer into a job, and workers later deliver results that are
//! correlated back to that job by id.
//!
//! ## Architecture Overview
//!
//! A job passes through two decoupled legs:
//!
//! - **Offer leg**: a signed offer is verified and allocated a job; a job
//!   request carrying the job id goes back out
//! - **Result leg**: a JSON or binary result naming the job id is stored
//!   against that job and acknowledged
//!
//! ## Core Components
//!
//! ### Signature Verification ([`signing`], [`canonical`])
//!
//! - Canonical sorted-key JSON encoding of the signed `data` object
//! - Ed25519 and secp256k1 ECDSA signatures, base58 on the wire
//! - Optional offer freshness checks
//!
//! ### Offer Decoding ([`decoder`])
//!
//! Classifies raw payloads into service offers, JSON or binary audio
//! results, and malformed input.
//!
//! ### Job Correlation ([`correlator`], [`job`])
//!
//! - Fresh 128-bit random job ids
//! - `Pending → Dispatched → Completed | Failed` lifecycle
//! - First-write-wins result policy, configurable to replace
//! - Optional idempotency keys for offer submission
//!
//! ### Storage ([`store`], [`blob`])
//!
//! - [`ResultStore`] with an in-memory, per-job locked implementation
//! - [`BlobStore`] for binary results, so jobs only keep a handle
//!
//! ### Orchestration ([`broker`], [`dispatch`])
//!
//! [`Broker`] composes the components above behind `handle_inbound`,
//! `handle_result` and `get_job`.
//!
//! ## Usage Examples
//!
//! ### Signing an Offer
//!
//! ```rust
//! use radio_core::{Capabilities, OfferSigner, ServiceOfferData, SignatureScheme, VerificationConfig};
//!
//! let signer = OfferSigner::generate(SignatureScheme::Ed25519);
//! let offer = signer.sign_offer(ServiceOfferData::new("acme", Capabilities::default()))?;
//!
//! radio_core::signing::verify_offer(&offer, &VerificationConfig::default())?;
//! # Ok::<(), radio_core::Error>(())
//! ```
//!
//! ### Running the Handshake
//!
//! ```rust
//! use radio_core::{Broker, BrokerConfig, Envelope, OutboundMessage};
//! # use radio_core::{Capabilities, OfferSigner, ServiceOfferData, SignatureScheme};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! # let signer = OfferSigner::generate(SignatureScheme::Ed25519);
//! # let offer = signer.sign_offer(ServiceOfferData::new("acme", Capabilities::default()))?;
//! # let raw_offer = serde_json::to_vec(&offer)?;
//! let broker = Broker::from_config(&BrokerConfig::default())?;
//!
//! let OutboundMessage::JobRequest(request) =
//!     broker.handle_inbound(&raw_offer, &Envelope::default()).await?
//! else {
//!     unreachable!()
//! };
//!
//! let job = broker.get_job(request.id).await?;
//! println!("job {} is {}", job.id, job.state);
//! # Ok::<(), radio_core::Error>(())
//! # }).unwrap();
//! ```

pub mod blob;
pub mod broker;
pub mod canonical;
pub mod config;
pub mod correlator;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod protocol;
pub mod retry;
pub mod signing;
pub mod store;

pub use blob::{BlobStore, DiskBlobStore, MemoryBlobStore};
pub use broker::Broker;
pub use config::{BrokerConfig, DispatchConfig, RetentionConfig, StorageConfig};
pub use correlator::{Admission, CorrelatorSettings, JobCorrelator};
pub use decoder::{decode, AudioResult, Message};
pub use dispatch::{DispatchMode, Dispatcher, HttpDispatcher, ReplyDispatcher};
pub use error::{Error, Result};
pub use job::{Job, JobResult, JobState, JobView, OverwritePolicy, ResultPayload};
pub use protocol::{
    Acknowledgement, Capabilities, Envelope, JobRequest, OutboundMessage, ServiceOffer,
    ServiceOfferData,
};
pub use retry::RetryPolicy;
pub use signing::{OfferSigner, SignatureScheme, VerificationConfig};
pub use store::{JobSnapshot, MemoryStore, ResultStore, StoreStats};
