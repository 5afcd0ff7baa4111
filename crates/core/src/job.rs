//! The job record: the aggregate root of the aggregation saga.
//!
//! A job is inserted once, then filled in slot by slot as events arrive from
//! independently scheduled workers. Completion is derived from which slots are
//! set, never from the informational `status` field.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::results::{DirectionsResult, GeocodingResult, ImagingResult, WeatherResult};

/// How long an idempotency key keeps pointing at the job it created.
pub const IDEMPOTENCY_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Informational status shown by the public status API.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Accepted,
    Processing,
    Failed,
    Complete,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Accepted => "Accepted",
            JobStatus::Processing => "Processing",
            JobStatus::Failed => "Failed",
            JobStatus::Complete => "Complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Accepted" => Some(JobStatus::Accepted),
            "Processing" => Some(JobStatus::Processing),
            "Failed" => Some(JobStatus::Failed),
            "Complete" => Some(JobStatus::Complete),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Complete)
    }

    /// Whether a status notification carrying `next` may overwrite `self`.
    ///
    /// Notifications can arrive out of order; a terminal status is never
    /// replaced by a non-terminal one.
    pub fn accepts(self, next: JobStatus) -> bool {
        !self.is_terminal() || next.is_terminal()
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the three downstream workers that report back into the same job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Directions,
    Weather,
    Imaging,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Directions, Branch::Weather, Branch::Imaging];

    pub fn name(self) -> &'static str {
        match self {
            Branch::Directions => "directions",
            Branch::Weather => "weather",
            Branch::Imaging => "imaging",
        }
    }
}

/// A reported-or-not slot. Unset means "not yet reported".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot<T> {
    pub successful: Option<bool>,
    pub result: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            successful: None,
            result: None,
        }
    }
}

impl<T> Slot<T> {
    pub fn reported(successful: bool, result: T) -> Self {
        Self {
            successful: Some(successful),
            result: Some(result),
        }
    }

    pub fn is_set(&self) -> bool {
        self.successful.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.successful == Some(true)
    }
}

/// Which branch slots are set, as read back from the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionStatus {
    pub directions_done: bool,
    pub weather_done: bool,
    pub imaging_done: bool,
}

impl CompletionStatus {
    pub fn is_done(&self, branch: Branch) -> bool {
        match branch {
            Branch::Directions => self.directions_done,
            Branch::Weather => self.weather_done,
            Branch::Imaging => self.imaging_done,
        }
    }

    pub fn reported_count(&self) -> usize {
        Branch::ALL.iter().filter(|b| self.is_done(**b)).count()
    }

    pub fn is_fully_reported(&self) -> bool {
        self.reported_count() == Branch::ALL.len()
    }
}

/// Request inputs captured when the job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub job_id: JobId,
    pub idempotency_key: Option<String>,
    pub starting_address: String,
    pub destination_address: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,

    pub starting_address: String,
    pub destination_address: String,
    pub email: String,

    pub status: JobStatus,
    pub additional_information: Option<String>,

    pub geocoding: Slot<GeocodingResult>,
    pub directions: Slot<DirectionsResult>,
    pub weather: Slot<WeatherResult>,
    pub imaging: Slot<ImagingResult>,
}

impl Job {
    /// A freshly inserted job: `Accepted`, every slot unset.
    pub fn accepted(new_job: NewJob) -> Self {
        Self {
            job_id: new_job.job_id,
            idempotency_key: new_job.idempotency_key,
            created_at: new_job.created_at,
            starting_address: new_job.starting_address,
            destination_address: new_job.destination_address,
            email: new_job.email,
            status: JobStatus::Accepted,
            additional_information: None,
            geocoding: Slot::default(),
            directions: Slot::default(),
            weather: Slot::default(),
            imaging: Slot::default(),
        }
    }

    pub fn completion_status(&self) -> CompletionStatus {
        CompletionStatus {
            directions_done: self.directions.is_set(),
            weather_done: self.weather.is_set(),
            imaging_done: self.imaging.is_set(),
        }
    }

    fn branch_slot_succeeded(&self, branch: Branch) -> bool {
        match branch {
            Branch::Directions => self.directions.succeeded(),
            Branch::Weather => self.weather.succeeded(),
            Branch::Imaging => self.imaging.succeeded(),
        }
    }

    fn branch_error(&self, branch: Branch) -> Option<&str> {
        match branch {
            Branch::Directions => self.directions.result.as_ref().and_then(|r| r.error.as_deref()),
            Branch::Weather => self.weather.result.as_ref().and_then(|r| r.error.as_deref()),
            Branch::Imaging => self.imaging.result.as_ref().and_then(|r| r.error.as_deref()),
        }
    }

    /// Terminal outcome, if the job is terminal.
    ///
    /// Terminal means geocoding failed (branches never dispatched) or all three
    /// branch slots are set.
    pub fn outcome(&self) -> Option<JobOutcome> {
        if self.geocoding.successful == Some(false) {
            let explanation = self
                .geocoding
                .result
                .as_ref()
                .map(GeocodingResult::failure_explanation)
                .unwrap_or_else(|| "Geocoding failed".to_string());
            return Some(JobOutcome {
                successful: false,
                geocoding_failure: Some(explanation),
                failed_branches: Vec::new(),
            });
        }

        if !self.completion_status().is_fully_reported() {
            return None;
        }

        let failed_branches = Branch::ALL
            .into_iter()
            .filter(|b| !self.branch_slot_succeeded(*b))
            .map(|b| FailedBranch {
                branch: b,
                error: self.branch_error(b).map(str::to_string),
            })
            .collect::<Vec<_>>();

        Some(JobOutcome {
            successful: failed_branches.is_empty(),
            geocoding_failure: None,
            failed_branches,
        })
    }

    /// Branch payloads for the final notification; unset slots degrade to
    /// their error-carrying empty form.
    pub fn branch_results_or_failed(&self) -> (DirectionsResult, WeatherResult, ImagingResult) {
        let reason = match self.geocoding.successful {
            Some(false) => "not requested: geocoding failed",
            _ => "no result reported",
        };
        (
            self.directions
                .result
                .clone()
                .unwrap_or_else(|| DirectionsResult::failed(reason)),
            self.weather
                .result
                .clone()
                .unwrap_or_else(|| WeatherResult::failed(reason)),
            self.imaging
                .result
                .clone()
                .unwrap_or_else(|| ImagingResult::failed(reason)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBranch {
    pub branch: Branch,
    pub error: Option<String>,
}

/// Overall result of a terminal job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub successful: bool,
    pub geocoding_failure: Option<String>,
    pub failed_branches: Vec<FailedBranch>,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        if self.successful {
            JobStatus::Complete
        } else {
            JobStatus::Failed
        }
    }

    /// Human-readable summary for the status notification.
    pub fn summary(&self) -> String {
        if let Some(geo) = &self.geocoding_failure {
            return geo.clone();
        }
        if self.successful {
            return "Job completed successfully".to_string();
        }

        let parts = self
            .failed_branches
            .iter()
            .map(|f| match &f.error {
                Some(e) => format!("{} ({e})", f.branch.name()),
                None => f.branch.name().to_string(),
            })
            .collect::<Vec<_>>();
        format!("Processing failed for: {}", parts.join(", "))
    }
}
