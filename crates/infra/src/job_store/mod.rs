//! Job record store: the single source of truth for a job's partial progress.
//!
//! Every mutation is a field-scoped update of one job record. Update methods
//! return the number of records matched so callers can tell "job not found"
//! apart from "value already set".

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use waypoint_core::{
    CommandError, CompletionStatus, DirectionsResult, GeocodingResult, ImagingResult, Job, JobId,
    JobStatus, MessageId, NewJob, WeatherResult,
};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt job record {job_id}: {message}")]
    Corrupt { job_id: JobId, message: String },
}

impl From<JobStoreError> for CommandError {
    fn from(err: JobStoreError) -> Self {
        CommandError::infrastructure(err.to_string())
    }
}

/// Result of `insert_job`. Inserting an existing id is a no-op.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Result of trying to become the single publisher of a job's terminal notifications.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionClaim {
    /// The claimant owns the publication (first claim, or a redelivery of the owner).
    Acquired,
    /// Terminal notifications were already published.
    AlreadyPublished,
    /// Another delivery owns the publication.
    HeldElsewhere,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Make sure the unique job id index exists. Idempotent and safe across processes.
    async fn ensure_indexes(&self) -> Result<(), JobStoreError>;

    async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError>;

    async fn get_job_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Which branch slots are set, or `None` when the job is unknown.
    async fn get_job_completion_status(
        &self,
        job_id: JobId,
    ) -> Result<Option<CompletionStatus>, JobStoreError>;

    async fn update_geocoding_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: GeocodingResult,
    ) -> Result<u64, JobStoreError>;

    async fn update_directions_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: DirectionsResult,
    ) -> Result<u64, JobStoreError>;

    async fn update_weather_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: WeatherResult,
    ) -> Result<u64, JobStoreError>;

    async fn update_imaging_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: ImagingResult,
    ) -> Result<u64, JobStoreError>;

    /// Set `status` and `additional_information`.
    ///
    /// A terminal status is never replaced by a non-terminal one; such an
    /// update still counts as matched.
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<u64, JobStoreError>;

    /// Job created with `key` no longer than `window` ago.
    async fn find_job_by_idempotency_key(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Atomic compare-and-set on the job's completion claim. `None` when the job is unknown.
    async fn claim_completion(
        &self,
        job_id: JobId,
        claimant: MessageId,
    ) -> Result<Option<CompletionClaim>, JobStoreError>;

    async fn mark_completion_published(&self, job_id: JobId) -> Result<u64, JobStoreError>;

    /// Maintenance/compensation only; never called by the saga.
    async fn delete_job_by_id(&self, job_id: JobId) -> Result<u64, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn ensure_indexes(&self) -> Result<(), JobStoreError> {
        (**self).ensure_indexes().await
    }

    async fn insert_job(&self, job: NewJob) -> Result<InsertOutcome, JobStoreError> {
        (**self).insert_job(job).await
    }

    async fn get_job_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get_job_by_id(job_id).await
    }

    async fn get_job_completion_status(
        &self,
        job_id: JobId,
    ) -> Result<Option<CompletionStatus>, JobStoreError> {
        (**self).get_job_completion_status(job_id).await
    }

    async fn update_geocoding_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: GeocodingResult,
    ) -> Result<u64, JobStoreError> {
        (**self).update_geocoding_slot(job_id, successful, result).await
    }

    async fn update_directions_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: DirectionsResult,
    ) -> Result<u64, JobStoreError> {
        (**self).update_directions_slot(job_id, successful, result).await
    }

    async fn update_weather_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: WeatherResult,
    ) -> Result<u64, JobStoreError> {
        (**self).update_weather_slot(job_id, successful, result).await
    }

    async fn update_imaging_slot(
        &self,
        job_id: JobId,
        successful: bool,
        result: ImagingResult,
    ) -> Result<u64, JobStoreError> {
        (**self).update_imaging_slot(job_id, successful, result).await
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        details: Option<String>,
    ) -> Result<u64, JobStoreError> {
        (**self).update_status(job_id, status, details).await
    }

    async fn find_job_by_idempotency_key(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).find_job_by_idempotency_key(key, window).await
    }

    async fn claim_completion(
        &self,
        job_id: JobId,
        claimant: MessageId,
    ) -> Result<Option<CompletionClaim>, JobStoreError> {
        (**self).claim_completion(job_id, claimant).await
    }

    async fn mark_completion_published(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        (**self).mark_completion_published(job_id).await
    }

    async fn delete_job_by_id(&self, job_id: JobId) -> Result<u64, JobStoreError> {
        (**self).delete_job_by_id(job_id).await
    }
}

/// Decide a completion claim from the record's current claim state.
pub(crate) fn decide_claim(
    claimed_by: &mut Option<MessageId>,
    published: bool,
    claimant: MessageId,
) -> CompletionClaim {
    if published {
        return CompletionClaim::AlreadyPublished;
    }
    if claimed_by.is_some_and(|owner| owner != claimant) {
        return CompletionClaim::HeldElsewhere;
    }
    *claimed_by = Some(claimant);
    CompletionClaim::Acquired
}
