//! `waypoint-core`: domain building blocks for the directions job saga.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod job;
pub mod results;

pub use error::{CommandError, CommandResult, ErrorKind};
pub use id::{JobId, MessageId};
pub use job::{
    Branch, CompletionStatus, FailedBranch, IDEMPOTENCY_WINDOW, Job, JobOutcome, JobStatus,
    NewJob, Slot,
};
pub use results::{
    CoordinateOutcome, Coordinates, DirectionsResult, GeocodingResult, ImagingResult, RouteStep,
    WeatherForecast, WeatherResult,
};
