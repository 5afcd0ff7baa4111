use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use waypoint_core::{
    CompletionStatus, DirectionsResult, GeocodingResult, ImagingResult, Job, JobId, JobStatus,
    MessageId, NewJob, Slot, WeatherResult,
};

use super::{CompletionClaim, InsertOutcome, JobStore, JobStoreError, decide_claim};

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    completion_claimed_by: Option<MessageId>,
    completion_published: bool,
}

/// In-memory job record store.
///
/// Intended for tests/dev. Each update takes the write lock for the whole map,
/// which makes every field update atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, StoredJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, StoredJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, StoredJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Apply `f` to the job if present; returns the matched count.
    fn update<F>(&self, job_id: JobId, f: F) -> Result<u64, JobStoreError>
    where
        F: FnOnce(&mut StoredJob),
    {
        let mut jobs = self.write()?;
        match jobs.get_mut(&job_id) {
            Some(stored) => {
                f(stored);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn ensure_indexes(&self) -> Result<(), JobStoreError> {
        // The map key is the unique index.
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.job_id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        jobs.insert(
            job.job_id,
            StoredJob {
                job: Job::accepted(job),
                completion_claimed_by: None,
                completion_published: false,
            },
        );
        Ok(InsertOutcome::Inserted)
    }

    async fn get_job_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).map(|s| s.job.clone()))
    }

    async fn get_job_completion_status(
        &self,
        job_id: JobId,
    ) -> Result<Option<CompletionStatus>, JobStoreError> {
        Ok(self.read()?.get(&job_id).map(|s| s.job.completion_status()))
    }

    async fn update_geocoding_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: GeocodingResult,
    ) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| s.job.geocoding = Slot::reported(successful, result))
    }

    async fn update_directions_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: DirectionsResult,
    ) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| s.job.directions = Slot::reported(successful, result))
    }

    async fn update_weather_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: WeatherResult,
    ) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| s.job.weather = Slot::reported(successful, result))
    }

    async fn update_imaging_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: ImagingResult,
    ) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| s.job.imaging = Slot::reported(successful, result))
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| {
            if s.job.status.accepts(status) {
                s.job.status = status;
                s.job.additional_information = details;
            }
        })
    }

    async fn find_job_by_idempotency_key(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let window = chrono::Duration::from_std(window)
            .map_err(|e| JobStoreError::Storage(format!("invalid idempotency window: {e}")))?;
        let cutoff = Utc::now() - window;

        Ok(self
            .read()?
            .values()
            .filter(|s| s.job.idempotency_key.as_deref() == Some(key))
            .filter(|s| s.job.created_at >= cutoff)
            .max_by_key(|s| s.job.created_at)
            .map(|s| s.job.clone()))
    }

    async fn claim_completion(
        &self,
        job_id: JobId,
        claimant: MessageId,
    ) -> Result<Option<CompletionClaim>, JobStoreError> {
        let mut jobs = self.write()?;
        Ok(jobs.get_mut(&job_id).map(|s| {
            decide_claim(&mut s.completion_claimed_by, s.completion_published, claimant)
        }))
    }

    async fn mark_completion_published(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        self.update(job_id, |s| s.completion_published = true)
    }

    async fn delete_job_by_id(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        Ok(self.write()?.remove(&job_id).map_or(0, |_| 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypoint_core::{CoordinateOutcome, Coordinates, IDEMPOTENCY_WINDOW};

    fn new_job(key: Option<&str>) -> NewJob {
        NewJob {
            job_id: JobId::new(),
            idempotency_key: key.map(str::to_string),
            starting_address: "A".to_string(),
            destination_address: "B".to_string(),
            email: "someone@example.com".to_string(),
            created_at: Utc::now(),
        }
    }

    fn ok_directions() -> DirectionsResult {
        DirectionsResult {
            successful: true,
            travel_time_seconds: Some(600),
            distance_km: Some(12.5),
            steps: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_and_starts_accepted() {
        let store = InMemoryJobStore::new();
        let job = new_job(None);
        let id = job.job_id;

        assert_eq!(store.insert_job(job.clone()).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_job(job).await.unwrap(), InsertOutcome::AlreadyExists);

        let stored = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Accepted);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn updates_report_zero_matches_for_unknown_jobs() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();

        assert_eq!(store.update_directions_slot(id, true, ok_directions()).await.unwrap(), 0);
        let geo = GeocodingResult::new(
            CoordinateOutcome::resolved(Coordinates::new(1.0, 1.0)),
            CoordinateOutcome::resolved(Coordinates::new(2.0, 2.0)),
        );
        assert_eq!(store.update_geocoding_slot(id, true, geo).await.unwrap(), 0);
        assert_eq!(store.get_job_completion_status(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn slot_updates_are_field_scoped_and_idempotent() {
        let store = InMemoryJobStore::new();
        let job = new_job(None);
        let id = job.job_id;
        store.insert_job(job).await.unwrap();

        store.update_directions_slot(id, true, ok_directions()).await.unwrap();
        store
            .update_weather_slot(id, false, WeatherResult::failed("provider timeout"))
            .await
            .unwrap();
        assert_eq!(store.update_directions_slot(id, true, ok_directions()).await.unwrap(), 1);

        let status = store.get_job_completion_status(id).await.unwrap().unwrap();
        assert!(status.directions_done && status.weather_done && !status.imaging_done);

        let stored = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.directions.result, Some(ok_directions()));
        assert_eq!(stored.weather.successful, Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_branch_writers_do_not_clobber_each_other() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = new_job(None);
        let id = job.job_id;
        store.insert_job(job).await.unwrap();

        let s1 = store.clone();
        let s2 = store.clone();
        let s3 = store.clone();
        let (a, b, c) = tokio::join!(
            tokio::spawn(async move { s1.update_directions_slot(id, true, ok_directions()).await }),
            tokio::spawn(async move {
                s2.update_weather_slot(id, true, WeatherResult::failed("unused")).await
            }),
            tokio::spawn(async move {
                s3.update_imaging_slot(id, true, ImagingResult::failed("unused")).await
            }),
        );
        assert_eq!(a.unwrap().unwrap() + b.unwrap().unwrap() + c.unwrap().unwrap(), 3);

        let status = store.get_job_completion_status(id).await.unwrap().unwrap();
        assert!(status.is_fully_reported());
    }

    #[tokio::test]
    async fn terminal_status_survives_late_progress_update() {
        let store = InMemoryJobStore::new();
        let job = new_job(None);
        let id = job.job_id;
        store.insert_job(job).await.unwrap();

        store
            .update_status(id, JobStatus::Complete, Some("Job completed successfully".to_string()))
            .await
            .unwrap();
        let matched = store
            .update_status(id, JobStatus::Processing, Some("Geocoding locations".to_string()))
            .await
            .unwrap();
        assert_eq!(matched, 1);

        let stored = store.get_job_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.additional_information.as_deref(), Some("Job completed successfully"));
    }

    #[tokio::test]
    async fn idempotency_key_lookup_honours_window() {
        let store = InMemoryJobStore::new();
        let fresh = new_job(Some("order-42"));
        let mut stale = new_job(Some("order-7"));
        stale.created_at = Utc::now() - chrono::Duration::days(8);
        let fresh_id = fresh.job_id;
        store.insert_job(fresh).await.unwrap();
        store.insert_job(stale).await.unwrap();

        let found = store
            .find_job_by_idempotency_key("order-42", IDEMPOTENCY_WINDOW)
            .await
            .unwrap();
        assert_eq!(found.map(|j| j.job_id), Some(fresh_id));

        assert!(store
            .find_job_by_idempotency_key("order-7", IDEMPOTENCY_WINDOW)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn completion_claim_is_single_owner_until_published() {
        let store = InMemoryJobStore::new();
        let job = new_job(None);
        let id = job.job_id;
        store.insert_job(job).await.unwrap();
        let (a, b) = (MessageId::new(), MessageId::new());

        assert_eq!(store.claim_completion(id, a).await.unwrap(), Some(CompletionClaim::Acquired));
        assert_eq!(
            store.claim_completion(id, b).await.unwrap(),
            Some(CompletionClaim::HeldElsewhere)
        );
        assert_eq!(store.mark_completion_published(id).await.unwrap(), 1);
        assert_eq!(
            store.claim_completion(id, a).await.unwrap(),
            Some(CompletionClaim::AlreadyPublished)
        );
        assert_eq!(store.claim_completion(JobId::new(), a).await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_reports_matches() {
        let store = InMemoryJobStore::new();
        let job = new_job(None);
        let id = job.job_id;
        store.insert_job(job).await.unwrap();

        assert_eq!(store.delete_job_by_id(id).await.unwrap(), 1);
        assert_eq!(store.delete_job_by_id(id).await.unwrap(), 0);
        assert!(store.is_empty());
    }
}
