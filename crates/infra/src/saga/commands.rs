//! Commands handled by the job aggregation saga.
//!
//! Commands derived from fan-in messages carry `delivery_id`, the publication
//! id of the message that produced them. It stays the same across
//! redeliveries and identifies the claimant of a job's terminal notifications.

use chrono::{DateTime, Utc};

use waypoint_core::{
    CoordinateOutcome, DirectionsResult, ImagingResult, JobId, JobStatus, MessageId, WeatherResult,
};
use waypoint_events::{
    Command, DirectionsComplete, GeocodingComplete, ImagingComplete, JobCreated, JobStatusUpdate,
    WeatherComplete,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateJob {
    pub job_id: JobId,
    pub idempotency_key: Option<String>,
    pub starting_address: String,
    pub destination_address: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl From<JobCreated> for CreateJob {
    fn from(m: JobCreated) -> Self {
        Self {
            job_id: m.job_id,
            idempotency_key: m.idempotency_key,
            starting_address: m.starting_address,
            destination_address: m.destination_address,
            email: m.email,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateGeocodingResult {
    pub job_id: JobId,
    pub starting: Option<CoordinateOutcome>,
    pub destination: Option<CoordinateOutcome>,
    pub delivery_id: MessageId,
}

impl UpdateGeocodingResult {
    pub fn from_message(m: GeocodingComplete, delivery_id: MessageId) -> Self {
        Self {
            job_id: m.job_id,
            starting: m.starting_coordinates,
            destination: m.destination_coordinates,
            delivery_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDirectionsResult {
    pub job_id: JobId,
    pub directions: Option<DirectionsResult>,
    pub delivery_id: MessageId,
}

impl UpdateDirectionsResult {
    pub fn from_message(m: DirectionsComplete, delivery_id: MessageId) -> Self {
        Self {
            job_id: m.job_id,
            directions: m.directions,
            delivery_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWeatherResult {
    pub job_id: JobId,
    pub weather: Option<WeatherResult>,
    pub delivery_id: MessageId,
}

impl UpdateWeatherResult {
    pub fn from_message(m: WeatherComplete, delivery_id: MessageId) -> Self {
        Self {
            job_id: m.job_id,
            weather: m.weather,
            delivery_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateImagingResult {
    pub job_id: JobId,
    pub imaging: Option<ImagingResult>,
    pub delivery_id: MessageId,
}

impl UpdateImagingResult {
    pub fn from_message(m: ImagingComplete, delivery_id: MessageId) -> Self {
        Self {
            job_id: m.job_id,
            imaging: m.imaging,
            delivery_id,
        }
    }
}

/// Publish the final notification for the email worker.
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyProcessingComplete {
    pub job_id: JobId,
    pub email: String,
    pub starting_address: String,
    pub destination_address: String,
    pub directions: DirectionsResult,
    pub weather: WeatherResult,
    pub imaging: ImagingResult,
}

/// Publish a status change for the public status API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyJobStatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub details: Option<String>,
}

/// Write a published status change onto the job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyJobStatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub details: Option<String>,
}

impl From<JobStatusUpdate> for ApplyJobStatusUpdate {
    fn from(m: JobStatusUpdate) -> Self {
        Self {
            job_id: m.job_id,
            status: m.status,
            details: m.details,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SagaCommand {
    CreateJob(CreateJob),
    UpdateGeocodingResult(UpdateGeocodingResult),
    UpdateDirectionsResult(UpdateDirectionsResult),
    UpdateWeatherResult(UpdateWeatherResult),
    UpdateImagingResult(UpdateImagingResult),
    NotifyProcessingComplete(NotifyProcessingComplete),
    NotifyJobStatusUpdate(NotifyJobStatusUpdate),
    ApplyJobStatusUpdate(ApplyJobStatusUpdate),
}

impl Command for SagaCommand {
    fn command_type(&self) -> &'static str {
        match self {
            SagaCommand::CreateJob(_) => "CreateJob",
            SagaCommand::UpdateGeocodingResult(_) => "UpdateGeocodingResult",
            SagaCommand::UpdateDirectionsResult(_) => "UpdateDirectionsResult",
            SagaCommand::UpdateWeatherResult(_) => "UpdateWeatherResult",
            SagaCommand::UpdateImagingResult(_) => "UpdateImagingResult",
            SagaCommand::NotifyProcessingComplete(_) => "NotifyProcessingComplete",
            SagaCommand::NotifyJobStatusUpdate(_) => "NotifyJobStatusUpdate",
            SagaCommand::ApplyJobStatusUpdate(_) => "ApplyJobStatusUpdate",
        }
    }

    fn correlation_id(&self) -> JobId {
        match self {
            SagaCommand::CreateJob(c) => c.job_id,
            SagaCommand::UpdateGeocodingResult(c) => c.job_id,
            SagaCommand::UpdateDirectionsResult(c) => c.job_id,
            SagaCommand::UpdateWeatherResult(c) => c.job_id,
            SagaCommand::UpdateImagingResult(c) => c.job_id,
            SagaCommand::NotifyProcessingComplete(c) => c.job_id,
            SagaCommand::NotifyJobStatusUpdate(c) => c.job_id,
            SagaCommand::ApplyJobStatusUpdate(c) => c.job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_keep_the_job_id_and_delivery_id() {
        let job_id = JobId::new();
        let delivery_id = MessageId::new();

        let cmd = UpdateWeatherResult::from_message(
            WeatherComplete {
                job_id,
                weather: Some(WeatherResult::failed("provider timeout")),
            },
            delivery_id,
        );
        assert_eq!(cmd.delivery_id, delivery_id);

        let cmd = SagaCommand::UpdateWeatherResult(cmd);
        assert_eq!(cmd.command_type(), "UpdateWeatherResult");
        assert_eq!(cmd.correlation_id(), job_id);
    }
}
