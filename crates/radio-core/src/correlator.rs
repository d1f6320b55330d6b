//! Offer acceptance and result correlation.
//!
//! The [`JobCorrelator`] turns a verified offer into a [`Job`] and a
//! [`JobRequest`] carrying the job id, and later attaches results to the job
//! named by that id. The job id is the only link between the two legs.

use crate::error::{Error, Result};
use crate::job::{Job, JobResult, JobUpdate, OverwritePolicy};
use crate::protocol::{JobRequest, ServiceOffer};
use crate::retry::RetryPolicy;
use crate::signing::{verify_offer, VerificationConfig};
use crate::store::{JobSnapshot, ResultStore, StoreStats};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings for a [`JobCorrelator`].
#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Script placed in every job request.
    pub script: String,
    pub overwrite: OverwritePolicy,
    pub verification: VerificationConfig,
    /// Retry policy for transient store failures.
    pub retry: RetryPolicy,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            script: crate::protocol::constants::DEFAULT_SCRIPT.to_string(),
            overwrite: OverwritePolicy::default(),
            verification: VerificationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of accepting an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub request: JobRequest,
    /// The idempotency key matched an earlier offer; no new job was created.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Pending,
    Ready,
    Abandoned,
}

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    signature: String,
    job_id: Uuid,
    registration: watch::Receiver<Registration>,
}

/// Holds an idempotency key while its job is being stored.
///
/// Dropped unsettled (the registration failed or the caller went away), it
/// frees the key and wakes the callers waiting on it.
struct Reservation<'a> {
    idempotency: &'a DashMap<String, IdempotencyRecord>,
    key: &'a str,
    job_id: Uuid,
    sender: watch::Sender<Registration>,
    settled: bool,
}

enum Claim<'a> {
    Existing {
        job_id: Uuid,
        registration: watch::Receiver<Registration>,
    },
    Reserved(Job, Reservation<'a>),
}

impl Reservation<'_> {
    fn settle(&mut self) {
        self.settled = true;
        self.sender.send_replace(Registration::Ready);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let job_id = self.job_id;
        self.idempotency
            .remove_if(self.key, |_, record| record.job_id == job_id);
        self.sender.send_replace(Registration::Abandoned);
    }
}

/// Creates jobs for accepted offers and matches results back to them.
pub struct JobCorrelator {
    store: Arc<dyn ResultStore>,
    settings: CorrelatorSettings,
    idempotency: DashMap<String, IdempotencyRecord>,
}

impl std::fmt::Debug for JobCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCorrelator")
            .field("settings", &self.settings)
            .field("idempotency_keys", &self.idempotency.len())
            .finish()
    }
}

impl JobCorrelator {
    pub fn new(store: Arc<dyn ResultStore>, settings: CorrelatorSettings) -> Self {
        Self {
            store,
            settings,
            idempotency: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    /// Verify `offer` and create a dispatched job for it.
    ///
    /// Every call with a valid offer creates a new job, even for an identical
    /// offer. On `SignatureInvalid` no job exists afterwards.
    pub async fn accept_offer(&self, offer: ServiceOffer) -> Result<JobRequest> {
        self.accept_offer_with_key(offer, None)
            .await
            .map(|admission| admission.request)
    }

    /// Like [`accept_offer`](Self::accept_offer), deduplicated by a caller-chosen key.
    ///
    /// A repeated key with the same signature returns the first job request again.
    /// A repeated key with a different signature is an `IdempotencyConflict`.
    pub async fn accept_offer_with_key(
        &self,
        offer: ServiceOffer,
        idempotency_key: Option<&str>,
    ) -> Result<Admission> {
        if let Err(e) = verify_offer(&offer, &self.settings.verification) {
            warn!("Rejected offer from provider {}: {}", offer.data.provider, e);
            return Err(e);
        }

        let Some(key) = idempotency_key else {
            let job = Job::new(offer, self.settings.script.clone());
            return self.admit(job, None).await;
        };

        loop {
            let claim = match self.idempotency.entry(key.to_string()) {
                Entry::Occupied(existing) => {
                    let record = existing.get();
                    if record.signature != offer.signature {
                        return Err(Error::IdempotencyConflict(key.to_string()));
                    }
                    Claim::Existing {
                        job_id: record.job_id,
                        registration: record.registration.clone(),
                    }
                }
                Entry::Vacant(slot) => {
                    let job = Job::new(offer.clone(), self.settings.script.clone())
                        .with_idempotency_key(Some(key.to_string()));
                    let (sender, registration) = watch::channel(Registration::Pending);
                    slot.insert(IdempotencyRecord {
                        signature: offer.signature.clone(),
                        job_id: job.job_id,
                        registration,
                    });
                    let reservation = Reservation {
                        idempotency: &self.idempotency,
                        key,
                        job_id: job.job_id,
                        sender,
                        settled: false,
                    };
                    Claim::Reserved(job, reservation)
                }
            };

            let (job_id, mut registration) = match claim {
                Claim::Reserved(job, reservation) => {
                    return self.admit(job, Some(reservation)).await;
                }
                Claim::Existing {
                    job_id,
                    registration,
                } => (job_id, registration),
            };

            let outcome = registration
                .wait_for(|state| *state != Registration::Pending)
                .await
                .map(|state| *state);
            if let Ok(Registration::Ready) = outcome {
                debug!("Idempotent replay of key {} -> job {}", key, job_id);
                return Ok(Admission {
                    request: JobRequest::new(job_id, self.settings.script.clone()),
                    replayed: true,
                });
            }

            // The first caller gave up; the key is free again.
            self.idempotency
                .remove_if(key, |_, record| record.job_id == job_id);
            debug!("Registration of job {} under key {} was abandoned", job_id, key);
        }
    }

    /// Store `job` and move it to `Dispatched`. A held reservation is settled
    /// only once the job can be read back, so same-key callers never replay
    /// an id that does not exist.
    async fn admit(&self, job: Job, reservation: Option<Reservation<'_>>) -> Result<Admission> {
        let provider = job.offer.data.provider.clone();
        let job_id = job.job_id;

        self.register(job).await?;
        if let Some(mut reservation) = reservation {
            reservation.settle();
        }

        info!("Accepted offer from provider {} as job {}", provider, job_id);
        Ok(Admission {
            request: JobRequest::new(job_id, self.settings.script.clone()),
            replayed: false,
        })
    }

    async fn register(&self, job: Job) -> Result<()> {
        let job_id = job.job_id;
        self.settings
            .retry
            .run("insert job", || self.store.insert(job.clone()))
            .await?;
        self.update(job_id, JobUpdate::Dispatched).await?;
        Ok(())
    }

    /// Attach `result` to the job, completing it.
    pub async fn correlate_result(&self, job_id: Uuid, result: JobResult) -> Result<Job> {
        let job = self
            .update(
                job_id,
                JobUpdate::Complete {
                    result,
                    overwrite: self.settings.overwrite,
                },
            )
            .await?;
        info!("Stored result for job {}", job_id);
        Ok(job)
    }

    /// Record that the dispatch leg of a job failed.
    pub async fn mark_failed(&self, job_id: Uuid, reason: impl Into<String>) -> Result<Job> {
        let reason = reason.into();
        warn!("Job {} failed: {}", job_id, reason);
        self.update(job_id, JobUpdate::Fail { reason }).await
    }

    /// Check that a result may still be attached to the job, without changing it.
    pub async fn ensure_accepts_result(&self, job_id: Uuid) -> Result<Job> {
        let job = self.get(job_id).await?;
        let mut trial = job.clone();
        trial.apply(JobUpdate::Complete {
            result: JobResult::new(crate::job::ResultPayload::Json(Default::default())),
            overwrite: self.settings.overwrite,
        })?;
        Ok(job)
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<Job> {
        self.settings
            .retry
            .run("update job", || self.store.update(&job_id, update.clone()))
            .await
    }

    /// Fetch a job. Unknown ids are `JobNotFound`.
    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.settings
            .retry
            .run("get job", || self.store.get(&job_id))
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }

    pub async fn list_pending(&self) -> Result<JobSnapshot> {
        self.store.list_pending().await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Drop terminal jobs finished before `cutoff`, with their idempotency keys.
    pub async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let evicted = self.store.evict_finished_before(cutoff).await?;
        for job in &evicted {
            if let Some(key) = &job.idempotency_key {
                self.idempotency
                    .remove_if(key, |_, record| record.job_id == job.job_id);
            }
        }
        if !evicted.is_empty() {
            info!("Evicted {} finished jobs", evicted.len());
        }
        Ok(evicted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, ResultPayload};
    use crate::protocol::{Capabilities, ServiceOfferData};
    use crate::signing::{OfferSigner, SignatureScheme};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashSet;

    fn signed_offer(signer: &OfferSigner) -> ServiceOffer {
        signer
            .sign_offer(ServiceOfferData::new(
                "acme",
                Capabilities {
                    receipt_analysis: true,
                    data_processing: false,
                    data_storage: true,
                },
            ))
            .unwrap()
    }

    fn correlator() -> (JobCorrelator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let correlator = JobCorrelator::new(store.clone(), CorrelatorSettings::default());
        (correlator, store)
    }

    fn audio_result(url: &str) -> JobResult {
        JobResult::new(ResultPayload::Json(
            json!({"audio_url": url}).as_object().cloned().unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_accept_offer_creates_dispatched_job() {
        let (correlator, store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);

        let request = correlator.accept_offer(signed_offer(&signer)).await.unwrap();
        assert_eq!(request.kind, "receipt_request");
        assert_eq!(request.script, "hello from Anthony at FXN");
        assert!(request.voice_id.is_none());

        let job = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dispatched);
        assert_eq!(job.offer.data.provider, "acme");
    }

    #[tokio::test]
    async fn test_invalid_signature_creates_no_job() {
        let (correlator, store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Secp256k1);
        let mut offer = signed_offer(&signer);
        offer.data.provider = "mallory".to_string();

        let result = correlator.accept_offer(offer).await;
        assert!(matches!(result, Err(Error::SignatureInvalid(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_same_offer_twice_creates_two_jobs() {
        let (correlator, store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let first = correlator.accept_offer(offer.clone()).await.unwrap();
        let second = correlator.accept_offer(offer).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_job_ids_are_fresh() {
        let (correlator, _store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let request = correlator.accept_offer(offer.clone()).await.unwrap();
            assert!(seen.insert(request.id));
        }
    }

    #[tokio::test]
    async fn test_idempotency_key() {
        let (correlator, store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let first = correlator
            .accept_offer_with_key(offer.clone(), Some("retry-1"))
            .await
            .unwrap();
        let replay = correlator
            .accept_offer_with_key(offer, Some("retry-1"))
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(first.request, replay.request);
        assert_eq!(store.len(), 1);

        let other = signed_offer(&OfferSigner::generate(SignatureScheme::Ed25519));
        let conflict = correlator.accept_offer_with_key(other, Some("retry-1")).await;
        assert!(matches!(conflict, Err(Error::IdempotencyConflict(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_correlate_result_first_write_wins() {
        let (correlator, _store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let request = correlator.accept_offer(signed_offer(&signer)).await.unwrap();

        let job = correlator
            .correlate_result(request.id, audio_result("http://x/first.mp3"))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Completed);
        let stored = job.result.clone();

        let second = correlator
            .correlate_result(request.id, audio_result("http://x/second.mp3"))
            .await;
        assert!(matches!(second, Err(Error::AlreadyCompleted { .. })));
        assert_eq!(correlator.get(request.id).await.unwrap().result, stored);
    }

    #[tokio::test]
    async fn test_replace_policy() {
        let store = Arc::new(MemoryStore::new());
        let settings = CorrelatorSettings {
            overwrite: OverwritePolicy::Replace,
            ..CorrelatorSettings::default()
        };
        let correlator = JobCorrelator::new(store, settings);
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let request = correlator.accept_offer(signed_offer(&signer)).await.unwrap();

        correlator
            .correlate_result(request.id, audio_result("first"))
            .await
            .unwrap();
        let job = correlator
            .correlate_result(request.id, audio_result("second"))
            .await
            .unwrap();

        match &job.result.unwrap().payload {
            ResultPayload::Json(map) => assert_eq!(map["audio_url"], "second"),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (correlator, _store) = correlator();
        let id = Uuid::new_v4();

        assert!(matches!(
            correlator.correlate_result(id, audio_result("x")).await,
            Err(Error::JobNotFound(missing)) if missing == id
        ));
        assert!(matches!(correlator.get(id).await, Err(Error::JobNotFound(_))));
        assert!(matches!(
            correlator.ensure_accepts_result(id).await,
            Err(Error::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_job_rejects_results() {
        let (correlator, _store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let request = correlator.accept_offer(signed_offer(&signer)).await.unwrap();

        let failed = correlator.mark_failed(request.id, "worker unreachable").await.unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.failure.as_deref(), Some("worker unreachable"));

        assert!(matches!(
            correlator.ensure_accepts_result(request.id).await,
            Err(Error::AlreadyCompleted { state: JobState::Failed, .. })
        ));
        assert!(matches!(
            correlator.correlate_result(request.id, audio_result("late")).await,
            Err(Error::AlreadyCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_eviction_releases_idempotency_key() {
        let (correlator, store) = correlator();
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let first = correlator
            .accept_offer_with_key(offer.clone(), Some("k"))
            .await
            .unwrap();
        correlator
            .correlate_result(first.request.id, audio_result("x"))
            .await
            .unwrap();

        let evicted = correlator
            .evict_finished_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(evicted, 1);
        assert!(store.is_empty());

        let again = correlator.accept_offer_with_key(offer, Some("k")).await.unwrap();
        assert!(!again.replayed);
        assert_ne!(again.request.id, first.request.id);
    }

    #[tokio::test]
    async fn test_concurrent_offers() {
        let (correlator, store) = correlator();
        let correlator = Arc::new(correlator);
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let mut handles = vec![];
        for _ in 0..32 {
            let correlator = Arc::clone(&correlator);
            let offer = offer.clone();
            handles.push(tokio::spawn(async move { correlator.accept_offer(offer).await }));
        }

        let ids: HashSet<Uuid> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().id)
            .collect();

        assert_eq!(ids.len(), 32);
        assert_eq!(store.len(), 32);
    }

    /// Delays `insert`, and optionally fails the first one, to widen the
    /// window between reserving an idempotency key and storing the job.
    struct SlowInsertStore {
        inner: MemoryStore,
        delay: std::time::Duration,
        fail_first: std::sync::atomic::AtomicBool,
    }

    impl SlowInsertStore {
        fn new(delay_ms: u64, fail_first: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                delay: std::time::Duration::from_millis(delay_ms),
                fail_first: std::sync::atomic::AtomicBool::new(fail_first),
            }
        }
    }

    #[async_trait::async_trait]
    impl ResultStore for SlowInsertStore {
        async fn insert(&self, job: Job) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            if self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::StorageFailure("insert timed out".to_string()));
            }
            self.inner.insert(job).await
        }

        async fn get(&self, job_id: &Uuid) -> Result<Option<Job>> {
            self.inner.get(job_id).await
        }

        async fn put(&self, job: Job) -> Result<()> {
            self.inner.put(job).await
        }

        async fn update(&self, job_id: &Uuid, update: JobUpdate) -> Result<Job> {
            self.inner.update(job_id, update).await
        }

        async fn list_pending(&self) -> Result<JobSnapshot> {
            self.inner.list_pending().await
        }

        async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
            self.inner.evict_finished_before(cutoff).await
        }

        async fn stats(&self) -> Result<StoreStats> {
            self.inner.stats().await
        }
    }

    fn slow_correlator(fail_first: bool) -> JobCorrelator {
        let settings = CorrelatorSettings {
            retry: RetryPolicy::none(),
            ..CorrelatorSettings::default()
        };
        JobCorrelator::new(Arc::new(SlowInsertStore::new(50, fail_first)), settings)
    }

    #[tokio::test]
    async fn test_replay_waits_for_registration() {
        let correlator = slow_correlator(false);
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let (first, (second, lookup)) = tokio::join!(
            correlator.accept_offer_with_key(offer.clone(), Some("slow-key")),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                let second = correlator
                    .accept_offer_with_key(offer.clone(), Some("slow-key"))
                    .await
                    .unwrap();
                let lookup = correlator.get(second.request.id).await;
                (second, lookup)
            }
        );

        let first = first.unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.request.id, first.request.id);
        assert_eq!(lookup.unwrap().state, JobState::Dispatched);
    }

    #[tokio::test]
    async fn test_failed_registration_frees_key_for_waiters() {
        let correlator = slow_correlator(true);
        let signer = OfferSigner::generate(SignatureScheme::Ed25519);
        let offer = signed_offer(&signer);

        let (first, second) = tokio::join!(
            correlator.accept_offer_with_key(offer.clone(), Some("flaky-key")),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                correlator
                    .accept_offer_with_key(offer.clone(), Some("flaky-key"))
                    .await
            }
        );

        assert!(matches!(first, Err(Error::StorageFailure(_))));
        let second = second.unwrap();
        assert!(!second.replayed);
        assert_eq!(
            correlator.get(second.request.id).await.unwrap().state,
            JobState::Dispatched
        );

        // The key now belongs to the job that was stored.
        let third = correlator
            .accept_offer_with_key(offer, Some("flaky-key"))
            .await
            .unwrap();
        assert!(third.replayed);
        assert_eq!(third.request.id, second.request.id);
    }
}
