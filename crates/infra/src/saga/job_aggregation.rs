//! Job aggregation saga.
//!
//! Drives a job from creation through geocoding and the three parallel
//! branches (directions, weather, imaging) to exactly one terminal
//! notification. All progress lives in the job store; the saga itself holds
//! no per-job state, so any number of orchestrator instances may run it.
//!
//! Flow:
//! 1. `JobCreated` → insert job, announce "Geocoding locations"
//! 2. `GeocodingComplete` → record coordinates; fan out `LocationsReady`,
//!    or fail the job right away when an address did not resolve
//! 3. branch complete → record the slot; once all three are set, publish the
//!    terminal status and `ProcessingComplete`
//! 4. `JobStatusUpdate` → project the status onto the job record

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use waypoint_core::{
    CommandError, CommandResult, GeocodingResult, IDEMPOTENCY_WINDOW, Job, JobId, JobOutcome,
    JobStatus, MessageId, NewJob,
};
use waypoint_events::{
    CommandBus, JobStatusUpdate, LocationsReady, Message, MessagePublisher, ProcessingComplete,
    publish_message,
};

use crate::job_store::{CompletionClaim, InsertOutcome, JobStore};

use super::commands::{
    ApplyJobStatusUpdate, CreateJob, NotifyJobStatusUpdate, NotifyProcessingComplete, SagaCommand,
    UpdateDirectionsResult, UpdateGeocodingResult, UpdateImagingResult, UpdateWeatherResult,
};

pub const GEOCODING_STARTED: &str = "Geocoding locations";

pub struct JobAggregationSaga<S, P> {
    store: S,
    publisher: P,
}

impl<S, P> JobAggregationSaga<S, P>
where
    S: JobStore,
    P: MessagePublisher,
{
    pub fn new(store: S, publisher: P) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Insert the job record and announce that geocoding has started.
    ///
    /// A key already used by another job inside [`IDEMPOTENCY_WINDOW`] makes
    /// this a logged no-op. The lookup and the insert are separate store
    /// calls, so two creations racing with the same key and different job ids
    /// can both insert. Strict key uniqueness belongs to whatever publishes
    /// `JobCreated`; this check only absorbs sequential retries.
    #[instrument(skip_all, fields(job_id = %cmd.job_id))]
    pub async fn create_job(&self, cmd: CreateJob) -> CommandResult {
        require_job_id(cmd.job_id)?;
        for (field, value) in [
            ("starting address", &cmd.starting_address),
            ("destination address", &cmd.destination_address),
            ("email", &cmd.email),
        ] {
            if value.trim().is_empty() {
                warn!(field, "rejecting job with empty field");
                return Err(CommandError::validation(format!("{field} is empty")));
            }
        }

        if let Some(key) = cmd.idempotency_key.as_deref() {
            if let Some(existing) = self
                .store
                .find_job_by_idempotency_key(key, IDEMPOTENCY_WINDOW)
                .await?
            {
                if existing.job_id != cmd.job_id {
                    warn!(
                        existing_job_id = %existing.job_id,
                        "idempotency key already used by another job; ignoring creation"
                    );
                    return Ok(());
                }
            }
        }

        let job_id = cmd.job_id;
        let outcome = self
            .store
            .insert_job(NewJob {
                job_id,
                idempotency_key: cmd.idempotency_key,
                starting_address: cmd.starting_address,
                destination_address: cmd.destination_address,
                email: cmd.email,
                created_at: cmd.created_at,
            })
            .await?;

        match outcome {
            InsertOutcome::Inserted => info!("job created"),
            InsertOutcome::AlreadyExists => debug!("job already exists"),
        }

        // Published on both paths so a redelivery after a failed publish still announces.
        self.notify_job_status_update(NotifyJobStatusUpdate {
            job_id,
            status: JobStatus::Processing,
            details: Some(GEOCODING_STARTED.to_string()),
        })
        .await
    }

    #[instrument(skip_all, fields(job_id = %cmd.job_id))]
    pub async fn update_geocoding_result(&self, cmd: UpdateGeocodingResult) -> CommandResult {
        require_job_id(cmd.job_id)?;
        let (Some(starting), Some(destination)) = (cmd.starting, cmd.destination) else {
            return Err(CommandError::validation(
                "geocoding result must carry both starting and destination outcomes",
            ));
        };

        let result = GeocodingResult::new(starting, destination);
        let successful = result.is_successful();
        let coordinates = (result.starting.coordinates, result.destination.coordinates);

        let matched = self
            .store
            .update_geocoding_slot(cmd.job_id, successful, result)
            .await?;
        if matched == 0 {
            return Err(CommandError::job_not_yet_available(cmd.job_id));
        }

        let job = self.load_job(cmd.job_id).await?;

        if !successful {
            info!("geocoding failed; skipping branches");
            let outcome = job.outcome().ok_or_else(|| {
                CommandError::unexpected("geocoding failure recorded but job is not terminal")
            })?;
            return self.complete(&job, outcome, cmd.delivery_id).await;
        }

        let (Some(starting_coordinates), Some(destination_coordinates)) = coordinates else {
            return Err(CommandError::unexpected(
                "successful geocoding result is missing coordinates",
            ));
        };

        self.publish(&LocationsReady {
            job_id: job.job_id,
            starting_address: job.starting_address,
            starting_coordinates,
            destination_address: job.destination_address,
            destination_coordinates,
        })
        .await?;
        info!("locations ready; branches dispatched");
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %cmd.job_id))]
    pub async fn update_directions_result(&self, cmd: UpdateDirectionsResult) -> CommandResult {
        require_job_id(cmd.job_id)?;
        let result = cmd
            .directions
            .ok_or_else(|| CommandError::validation("directions result is missing"))?;

        let matched = self
            .store
            .update_directions_slot(cmd.job_id, result.successful, result)
            .await?;
        self.after_branch_reported(cmd.job_id, matched, cmd.delivery_id)
            .await
    }

    #[instrument(skip_all, fields(job_id = %cmd.job_id))]
    pub async fn update_weather_result(&self, cmd: UpdateWeatherResult) -> CommandResult {
        require_job_id(cmd.job_id)?;
        let result = cmd
            .weather
            .ok_or_else(|| CommandError::validation("weather result is missing"))?;

        let matched = self
            .store
            .update_weather_slot(cmd.job_id, result.successful, result)
            .await?;
        self.after_branch_reported(cmd.job_id, matched, cmd.delivery_id)
            .await
    }

    #[instrument(skip_all, fields(job_id = %cmd.job_id))]
    pub async fn update_imaging_result(&self, cmd: UpdateImagingResult) -> CommandResult {
        require_job_id(cmd.job_id)?;
        let result = cmd
            .imaging
            .ok_or_else(|| CommandError::validation("imaging result is missing"))?;

        let matched = self
            .store
            .update_imaging_slot(cmd.job_id, result.successful, result)
            .await?;
        self.after_branch_reported(cmd.job_id, matched, cmd.delivery_id)
            .await
    }

    pub async fn notify_processing_complete(&self, cmd: NotifyProcessingComplete) -> CommandResult {
        self.publish(&ProcessingComplete {
            job_id: cmd.job_id,
            email: cmd.email,
            starting_address: cmd.starting_address,
            destination_address: cmd.destination_address,
            directions: cmd.directions,
            weather: cmd.weather,
            imaging: cmd.imaging,
        })
        .await
    }

    pub async fn notify_job_status_update(&self, cmd: NotifyJobStatusUpdate) -> CommandResult {
        self.publish(&JobStatusUpdate {
            job_id: cmd.job_id,
            status: cmd.status,
            details: cmd.details,
        })
        .await
    }

    #[instrument(skip_all, fields(job_id = %cmd.job_id, status = %cmd.status))]
    pub async fn apply_job_status_update(&self, cmd: ApplyJobStatusUpdate) -> CommandResult {
        require_job_id(cmd.job_id)?;
        let matched = self
            .store
            .update_status(cmd.job_id, cmd.status, cmd.details)
            .await?;
        if matched == 0 {
            return Err(CommandError::job_not_yet_available(cmd.job_id));
        }
        debug!("status projected");
        Ok(())
    }

    async fn after_branch_reported(
        &self,
        job_id: JobId,
        matched: u64,
        delivery_id: MessageId,
    ) -> CommandResult {
        if matched == 0 {
            return Err(CommandError::job_not_yet_available(job_id));
        }

        let status = self
            .store
            .get_job_completion_status(job_id)
            .await?
            .ok_or_else(|| CommandError::job_not_yet_available(job_id))?;
        if !status.is_fully_reported() {
            debug!(reported = status.reported_count(), "waiting for remaining branches");
            return Ok(());
        }

        let job = self.load_job(job_id).await?;
        let outcome = job.outcome().ok_or_else(|| {
            CommandError::unexpected("all branches reported but job is not terminal")
        })?;
        self.complete(&job, outcome, delivery_id).await
    }

    /// Publish the terminal status and the final notification, once per job.
    async fn complete(&self, job: &Job, outcome: JobOutcome, delivery_id: MessageId) -> CommandResult {
        let claim = self
            .store
            .claim_completion(job.job_id, delivery_id)
            .await?
            .ok_or_else(|| CommandError::job_not_yet_available(job.job_id))?;

        match claim {
            CompletionClaim::Acquired => {}
            CompletionClaim::AlreadyPublished => {
                debug!("terminal notifications already published");
                return Ok(());
            }
            CompletionClaim::HeldElsewhere => {
                debug!("terminal notifications owned by another delivery");
                return Ok(());
            }
        }

        self.notify_job_status_update(NotifyJobStatusUpdate {
            job_id: job.job_id,
            status: outcome.status(),
            details: Some(outcome.summary()),
        })
        .await?;

        let (directions, weather, imaging) = job.branch_results_or_failed();
        self.notify_processing_complete(NotifyProcessingComplete {
            job_id: job.job_id,
            email: job.email.clone(),
            starting_address: job.starting_address.clone(),
            destination_address: job.destination_address.clone(),
            directions,
            weather,
            imaging,
        })
        .await?;

        self.store.mark_completion_published(job.job_id).await?;
        info!(
            status = %outcome.status(),
            failed_branches = outcome.failed_branches.len(),
            "job finished"
        );
        Ok(())
    }

    async fn load_job(&self, job_id: JobId) -> Result<Job, CommandError> {
        self.store
            .get_job_by_id(job_id)
            .await?
            .ok_or_else(|| CommandError::job_not_yet_available(job_id))
    }

    async fn publish<M: Message>(&self, message: &M) -> CommandResult {
        publish_message(&self.publisher, message)
            .await
            .map(|_| ())
            .map_err(|e| {
                CommandError::infrastructure(format!("failed to publish {}: {e}", M::MESSAGE_TYPE))
            })
    }
}

fn require_job_id(job_id: JobId) -> CommandResult {
    if job_id.is_nil() {
        return Err(CommandError::validation("job id is empty"));
    }
    Ok(())
}

#[async_trait]
impl<S, P> CommandBus<SagaCommand> for JobAggregationSaga<S, P>
where
    S: JobStore,
    P: MessagePublisher,
{
    async fn send(&self, command: SagaCommand) -> CommandResult {
        match command {
            SagaCommand::CreateJob(c) => self.create_job(c).await,
            SagaCommand::UpdateGeocodingResult(c) => self.update_geocoding_result(c).await,
            SagaCommand::UpdateDirectionsResult(c) => self.update_directions_result(c).await,
            SagaCommand::UpdateWeatherResult(c) => self.update_weather_result(c).await,
            SagaCommand::UpdateImagingResult(c) => self.update_imaging_result(c).await,
            SagaCommand::NotifyProcessingComplete(c) => self.notify_processing_complete(c).await,
            SagaCommand::NotifyJobStatusUpdate(c) => self.notify_job_status_update(c).await,
            SagaCommand::ApplyJobStatusUpdate(c) => self.apply_job_status_update(c).await,
        }
    }
}
