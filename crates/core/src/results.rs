//! Payloads reported by the geocoding worker and the three branch workers.
//!
//! Every payload has an "error-carrying empty form" (`failed`) so a missing or
//! failed branch can still be rendered into the final notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Outcome of resolving one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinateOutcome {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CoordinateOutcome {
    pub fn resolved(coordinates: Coordinates) -> Self {
        Self {
            successful: true,
            coordinates: Some(coordinates),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            successful: false,
            coordinates: None,
            error: Some(error.into()),
        }
    }

    /// A success flag without coordinates is not usable downstream.
    pub fn is_usable(&self) -> bool {
        self.successful && self.coordinates.is_some()
    }
}

/// Combined geocoding payload stored in the job's geocoding slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodingResult {
    pub starting: CoordinateOutcome,
    pub destination: CoordinateOutcome,
}

impl GeocodingResult {
    pub fn new(starting: CoordinateOutcome, destination: CoordinateOutcome) -> Self {
        Self {
            starting,
            destination,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.starting.is_usable() && self.destination.is_usable()
    }

    /// Explanation of which side(s) failed to resolve.
    pub fn failure_explanation(&self) -> String {
        let mut parts = Vec::new();
        for (label, outcome) in [
            ("starting address", &self.starting),
            ("destination address", &self.destination),
        ] {
            if !outcome.is_usable() {
                let reason = outcome
                    .error
                    .as_deref()
                    .unwrap_or("no coordinates returned");
                parts.push(format!("{label}: {reason}"));
            }
        }
        if parts.is_empty() {
            "geocoding succeeded".to_string()
        } else {
            format!("Geocoding failed ({})", parts.join("; "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStep {
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionsResult {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_time_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<RouteStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DirectionsResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            successful: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherForecast {
    pub valid_at: DateTime<Utc>,
    pub summary: String,
    pub temperature_c: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precipitation_chance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherResult {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<WeatherForecast>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WeatherResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            successful: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingResult {
    pub successful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImagingResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            successful: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
