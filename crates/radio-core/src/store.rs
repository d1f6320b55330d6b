//! Job storage.
//!
//! [`ResultStore`] is the only shared mutable state in the broker. Updates go
//! through [`ResultStore::update`], which applies a [`JobUpdate`] atomically
//! for one job id; readers only ever see whole jobs, before or after an update.
//!
//! [`MemoryStore`] keeps jobs in a sharded [`DashMap`], so writers to one job
//! never block readers or writers of jobs living in other shards.

use crate::error::{Error, Result};
use crate::job::{Job, JobState, JobUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Backing store for job records.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` if the id is taken.
    async fn insert(&self, job: Job) -> Result<()>;

    /// Fetch a job by id. `None` means the id is unknown.
    async fn get(&self, job_id: &Uuid) -> Result<Option<Job>>;

    /// Store a job, replacing any previous record with the same id.
    async fn put(&self, job: Job) -> Result<()>;

    /// Apply `update` to the stored job and return the new record.
    async fn update(&self, job_id: &Uuid, update: JobUpdate) -> Result<Job>;

    /// Snapshot of every job still waiting for a result.
    async fn list_pending(&self) -> Result<JobSnapshot>;

    /// Remove terminal jobs that finished before `cutoff`, returning them.
    async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Counts per state.
    async fn stats(&self) -> Result<StoreStats>;
}

/// A point-in-time copy of a set of jobs.
///
/// Iterating never observes later writes, and the snapshot can be iterated
/// any number of times.
#[derive(Debug, Clone, Default)]
pub struct JobSnapshot {
    jobs: Arc<[Job]>,
}

impl JobSnapshot {
    pub fn new(mut jobs: Vec<Job>) -> Self {
        jobs.sort_by_key(|job| job.created_at);
        Self { jobs: jobs.into() }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl<'a> IntoIterator for &'a JobSnapshot {
    type Item = &'a Job;
    type IntoIter = std::slice::Iter<'a, Job>;

    fn into_iter(self) -> Self::IntoIter {
        self.jobs.iter()
    }
}

/// Statistics about the current store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StoreStats {
    fn record(&mut self, state: JobState) {
        self.total += 1;
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Dispatched => self.dispatched += 1,
            JobState::Completed => self.completed += 1,
            JobState::Failed => self.failed += 1,
        }
    }
}

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: DashMap<Uuid, Job>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert(&self, job: Job) -> Result<()> {
        match self.jobs.entry(job.job_id) {
            Entry::Occupied(_) => Err(Error::DuplicateJob(job.job_id)),
            Entry::Vacant(slot) => {
                debug!("Stored new job {}", job.job_id);
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: &Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, job: Job) -> Result<()> {
        self.jobs.insert(job.job_id, job);
        Ok(())
    }

    async fn update(&self, job_id: &Uuid, update: JobUpdate) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or(Error::JobNotFound(*job_id))?;

        entry.apply(update)?;
        debug!("Job {} is now {}", job_id, entry.state);
        Ok(entry.clone())
    }

    async fn list_pending(&self) -> Result<JobSnapshot> {
        let jobs = self
            .jobs
            .iter()
            .filter(|entry| !entry.state.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        Ok(JobSnapshot::new(jobs))
    }

    async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let expired: Vec<Uuid> = self
            .jobs
            .iter()
            .filter(|entry| entry.finished_at().is_some_and(|at| at < cutoff))
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for job_id in expired {
            // Re-check under the entry lock: the job cannot leave a terminal
            // state, but it may have been replaced in the meantime.
            if let Some((_, job)) = self
                .jobs
                .remove_if(&job_id, |_, job| job.finished_at().is_some_and(|at| at < cutoff))
            {
                evicted.push(job);
            }
        }
        Ok(evicted)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for entry in self.jobs.iter() {
            stats.record(entry.state);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::sample_offer;
    use crate::job::{JobResult, OverwritePolicy, ResultPayload};
    use chrono::Duration;
    use serde_json::Map;

    fn dispatched_job() -> Job {
        let mut job = Job::new(sample_offer(), "script");
        job.apply(JobUpdate::Dispatched).unwrap();
        job
    }

    fn complete() -> JobUpdate {
        JobUpdate::Complete {
            result: JobResult::new(ResultPayload::Json(Map::new())),
            overwrite: OverwritePolicy::Reject,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let job = Job::new(sample_offer(), "script");
        let id = job.job_id;

        store.insert(job.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), Some(job));
        assert_eq!(store.get(&Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let job = Job::new(sample_offer(), "script");

        store.insert(job.clone()).await.unwrap();
        assert!(matches!(store.insert(job).await, Err(Error::DuplicateJob(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_job_is_distinct_from_unknown() {
        let store = MemoryStore::new();
        let job = dispatched_job();
        let id = job.job_id;
        store.put(job).await.unwrap();

        let found = store.get(&id).await.unwrap().unwrap();
        assert_eq!(found.state, JobState::Dispatched);
        assert!(found.result.is_none());
        assert!(store.get(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_is_all_or_nothing() {
        let store = MemoryStore::new();
        let job = dispatched_job();
        let id = job.job_id;
        store.insert(job).await.unwrap();

        let updated = store.update(&id, complete()).await.unwrap();
        assert_eq!(updated.state, JobState::Completed);

        let before = store.get(&id).await.unwrap().unwrap();
        assert!(matches!(
            store.update(&id, complete()).await,
            Err(Error::AlreadyCompleted { .. })
        ));
        assert_eq!(store.get(&id).await.unwrap().unwrap(), before);

        assert!(matches!(
            store.update(&Uuid::new_v4(), complete()).await,
            Err(Error::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_pending_is_a_snapshot() {
        let store = MemoryStore::new();
        let first = dispatched_job();
        let second = dispatched_job();
        let first_id = first.job_id;
        store.insert(first).await.unwrap();
        store.insert(second).await.unwrap();

        let snapshot = store.list_pending().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        store.update(&first_id, complete()).await.unwrap();
        store.insert(dispatched_job()).await.unwrap();

        // Restartable and unaffected by later writes.
        assert_eq!(snapshot.iter().count(), 2);
        assert!((&snapshot).into_iter().all(|job| job.state == JobState::Dispatched));
        assert_eq!(store.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_evict_finished_before() {
        let store = MemoryStore::new();
        let done = dispatched_job();
        let done_id = done.job_id;
        let open = dispatched_job();
        let open_id = open.job_id;
        store.insert(done).await.unwrap();
        store.insert(open).await.unwrap();
        store.update(&done_id, complete()).await.unwrap();

        let evicted = store
            .evict_finished_before(Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(evicted.is_empty());

        let evicted = store
            .evict_finished_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].job_id, done_id);
        assert!(store.get(&done_id).await.unwrap().is_none());
        assert!(store.get(&open_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let store = MemoryStore::new();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());

        store.insert(Job::new(sample_offer(), "s")).await.unwrap();
        let job = dispatched_job();
        let id = job.job_id;
        store.insert(job).await.unwrap();
        store.insert(dispatched_job()).await.unwrap();
        store.update(&id, complete()).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_concurrent_updates_to_one_job() {
        let store = Arc::new(MemoryStore::new());
        let job = dispatched_job();
        let id = job.job_id;
        store.insert(job).await.unwrap();

        let mut handles = vec![];
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.update(&id, complete()).await }));
        }

        let outcomes = futures::future::join_all(handles).await;
        let successes = outcomes
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|outcome| outcome.is_ok())
            .count();

        assert_eq!(successes, 1);
    }
}
