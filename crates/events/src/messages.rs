//! Wire messages consumed and published by the orchestrator.
//!
//! Only the fields the saga needs are modelled. Optional payloads stay
//! optional on the wire so that a malformed producer is detected by the
//! handler guards instead of by the deserializer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypoint_core::{
    CoordinateOutcome, Coordinates, DirectionsResult, ImagingResult, JobId, JobStatus,
    WeatherResult,
};

use crate::Message;

/// Emitted by the creation path once a job request has been accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreated {
    pub job_id: JobId,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub starting_address: String,
    pub destination_address: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodingComplete {
    pub job_id: JobId,
    #[serde(default)]
    pub starting_coordinates: Option<CoordinateOutcome>,
    #[serde(default)]
    pub destination_coordinates: Option<CoordinateOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionsComplete {
    pub job_id: JobId,
    #[serde(default)]
    pub directions: Option<DirectionsResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherComplete {
    pub job_id: JobId,
    #[serde(default)]
    pub weather: Option<WeatherResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingComplete {
    pub job_id: JobId,
    #[serde(default)]
    pub imaging: Option<ImagingResult>,
}

/// Fan-out trigger consumed independently by the directions, weather and
/// imaging workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationsReady {
    pub job_id: JobId,
    pub starting_address: String,
    pub starting_coordinates: Coordinates,
    pub destination_address: String,
    pub destination_coordinates: Coordinates,
}

/// Lightweight status change (public status API cache invalidation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Terminal notification consumed by the email worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingComplete {
    pub job_id: JobId,
    pub email: String,
    pub starting_address: String,
    pub destination_address: String,
    pub directions: DirectionsResult,
    pub weather: WeatherResult,
    pub imaging: ImagingResult,
}

macro_rules! impl_message {
    ($t:ty, $name:literal) => {
        impl Message for $t {
            const MESSAGE_TYPE: &'static str = $name;

            fn correlation_id(&self) -> JobId {
                self.job_id
            }
        }
    };
}

impl_message!(JobCreated, "job.created");
impl_message!(GeocodingComplete, "geocoding.complete");
impl_message!(DirectionsComplete, "directions.complete");
impl_message!(WeatherComplete, "weather.complete");
impl_message!(ImagingComplete, "imaging.complete");
impl_message!(LocationsReady, "locations.ready");
impl_message!(JobStatusUpdate, "job.status_update");
impl_message!(ProcessingComplete, "processing.complete");
