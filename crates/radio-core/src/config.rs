//! Broker configuration.

use crate::correlator::CorrelatorSettings;
use crate::dispatch::DispatchMode;
use crate::error::{Error, Result};
use crate::job::OverwritePolicy;
use crate::protocol::constants::DEFAULT_SCRIPT;
use crate::retry::RetryPolicy;
use crate::signing::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the broker core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Script sent to workers in every job request
    pub script: String,

    /// What to do with a second result for a completed job
    pub overwrite_policy: OverwritePolicy,

    /// Offer verification settings
    pub verification: VerificationConfig,

    /// Job retention settings
    pub retention: RetentionConfig,

    /// How job requests reach workers
    pub dispatch: DispatchConfig,

    /// Binary result storage
    pub storage: StorageConfig,
}

/// Job retention configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Seconds a finished job stays queryable; unset keeps jobs forever
    pub completed_ttl_secs: Option<u64>,

    /// Interval between eviction sweeps in seconds
    pub sweep_interval_secs: u64,
}

/// Dispatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// `reply` returns the job request to the caller, `forward` also POSTs it to `worker_url`
    pub mode: DispatchMode,

    /// Worker endpoint used in `forward` mode
    pub worker_url: Option<String>,

    /// Timeout for a single forward attempt in seconds
    pub timeout_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for binary results
    pub blob_dir: PathBuf,

    /// Retries for transient storage failures
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub retry_base_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            script: DEFAULT_SCRIPT.to_string(),
            overwrite_policy: OverwritePolicy::Reject,
            verification: VerificationConfig::permissive(),
            retention: RetentionConfig {
                completed_ttl_secs: None,
                sweep_interval_secs: 300,
            },
            dispatch: DispatchConfig {
                mode: DispatchMode::Reply,
                worker_url: None,
                timeout_secs: 30,
            },
            storage: StorageConfig {
                blob_dir: PathBuf::from("results"),
                max_retries: 3,
                retry_base_ms: 50,
            },
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.script.trim().is_empty() {
            return Err(config_error("Script must not be empty"));
        }

        if self.dispatch.mode == DispatchMode::Forward {
            match self.dispatch.worker_url.as_deref() {
                None | Some("") => {
                    return Err(config_error("Forward dispatch requires dispatch.worker_url"))
                }
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    return Err(config_error("dispatch.worker_url must be an http(s) URL"))
                }
                Some(_) => {}
            }
        }

        if self.dispatch.timeout_secs == 0 {
            return Err(config_error("Dispatch timeout must be greater than 0"));
        }

        if self.retention.sweep_interval_secs == 0 {
            return Err(config_error("Sweep interval must be greater than 0"));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.storage.max_retries,
            Duration::from_millis(self.storage.retry_base_ms),
        )
    }

    pub fn correlator_settings(&self) -> CorrelatorSettings {
        CorrelatorSettings {
            script: self.script.clone(),
            overwrite: self.overwrite_policy,
            verification: self.verification.clone(),
            retry: self.retry_policy(),
        }
    }

    pub fn completed_ttl(&self) -> Option<Duration> {
        self.retention.completed_ttl_secs.map(Duration::from_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.timeout_secs)
    }
}

fn config_error(message: &str) -> Error {
    Error::InvalidConfig(message.to_string())
}
