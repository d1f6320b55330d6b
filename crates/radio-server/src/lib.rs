//! Radio Broker Server - HTTP transport for the Radio job broker
//!
//! This crate exposes the broker core over HTTP:
//! 1. Providers POST signed service offers and receive a job request carrying a job id
//! 2. Workers POST results (JSON with an `id`, or raw audio with an `X-Job-Id` header)
//! 3. Anyone can poll a job by id until it is completed or failed

pub mod config;
pub mod error;
pub mod http;
pub mod state;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
