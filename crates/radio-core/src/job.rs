//! Job records and their lifecycle.
//!
//! A [`Job`] is created for every accepted offer and moves through
//! `Pending -> Dispatched -> Completed | Failed`. All state changes go through
//! [`Job::apply`], which refuses to skip or reverse a step, so the store can
//! apply updates atomically without knowing the rules.

use crate::error::{Error, Result};
use crate::protocol::ServiceOffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Dispatched,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Dispatched => "dispatched",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` accept no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `next` directly follows this state.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Dispatched)
                | (JobState::Dispatched, JobState::Completed)
                | (JobState::Dispatched, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "dispatched" => Ok(JobState::Dispatched),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(Error::Malformed(format!("Unknown job state: {}", other))),
        }
    }
}

/// What happens when a result arrives for a job that already completed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// First write wins; later deliveries fail with `AlreadyCompleted`.
    #[default]
    Reject,
    /// Last write wins for completed jobs. Failed jobs still reject.
    Replace,
}

/// Stored form of a worker's result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum ResultPayload {
    /// A JSON mapping delivered by the worker.
    Json(Map<String, Value>),
    /// A binary payload persisted in the blob store; only its handle is kept.
    Binary {
        handle: String,
        extension: String,
        size: usize,
    },
}

/// A result attached to a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobResult {
    pub payload: ResultPayload,
    pub received_at: DateTime<Utc>,
}

impl JobResult {
    pub fn new(payload: ResultPayload) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }
}

/// A mutation applied to a stored job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// The job request left the broker.
    Dispatched,
    /// A result arrived for the job.
    Complete {
        result: JobResult,
        overwrite: OverwritePolicy,
    },
    /// The dispatch leg failed or timed out.
    Fail { reason: String },
}

/// The broker's record correlating one offer to one eventual result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: Uuid,
    /// Snapshot of the offer that created this job.
    pub offer: ServiceOffer,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub script: String,
    pub result: Option<JobResult>,
    /// Reason recorded when the job failed.
    pub failure: Option<String>,
    pub idempotency_key: Option<String>,
}

impl Job {
    /// Create a `Pending` job with a fresh random id.
    pub fn new(offer: ServiceOffer, script: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            offer,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            script: script.into(),
            result: None,
            failure: None,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Apply an update, enforcing the lifecycle. On error the job is untouched.
    pub fn apply(&mut self, update: JobUpdate) -> Result<()> {
        match update {
            JobUpdate::Dispatched => {
                self.transition(JobState::Dispatched)?;
            }
            JobUpdate::Complete { result, overwrite } => {
                if self.state == JobState::Completed && overwrite == OverwritePolicy::Replace {
                    self.result = Some(result);
                    self.updated_at = Utc::now();
                    return Ok(());
                }
                self.transition(JobState::Completed)?;
                self.result = Some(result);
            }
            JobUpdate::Fail { reason } => {
                self.transition(JobState::Failed)?;
                self.failure = Some(reason);
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: JobState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::AlreadyCompleted {
                job_id: self.job_id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                job_id: self.job_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// When the job reached its terminal state, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.is_terminal().then_some(self.updated_at)
    }
}

/// Read-only projection of a job for external polling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobView {
    pub id: Uuid,
    pub state: JobState,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.job_id,
            state: job.state,
            provider: job.offer.data.provider.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            result: job.result.clone(),
            failure: job.failure.clone(),
        }
    }
}
