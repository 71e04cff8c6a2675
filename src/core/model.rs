use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MonitorError;
use super::proximity;

pub type MarkerId = String;

/// Unvalidated reading as handed over by a position provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

/// A validated position. Only obtainable through [`Position::new`] or
/// [`Position::from_reading`], so coordinates are always finite and in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    latitude: f64,
    longitude: f64,
    observed_at: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, observed_at: DateTime<Utc>) -> Result<Self, MonitorError> {
        validate_coordinates(latitude, longitude)?;
        Ok(Self {
            latitude,
            longitude,
            observed_at,
        })
    }

    pub fn from_reading(reading: &RawReading) -> Result<Self, MonitorError> {
        Self::new(reading.latitude, reading.longitude, reading.observed_at)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), MonitorError> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return Err(MonitorError::InvalidReading(format!(
            "non-numeric coordinates ({}, {})",
            latitude, longitude
        )));
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(MonitorError::InvalidReading(format!(
            "coordinates out of range ({}, {})",
            latitude, longitude
        )));
    }
    Ok(())
}

/// Requested fix quality. Balanced trades precision for availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    High,
    Balanced,
}

/// Parameters for a single position request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRequest {
    pub accuracy: Accuracy,
    pub timeout: Duration,
    /// A cached fix younger than this may be returned.
    pub maximum_age: Duration,
}

/// Thresholds for the continuous position stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchConfig {
    pub accuracy: Accuracy,
    pub min_interval: Duration,
    pub min_distance_m: f64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            min_interval: Duration::from_secs(10),
            min_distance_m: 50.0,
        }
    }
}

impl WatchConfig {
    /// True when `next` is both far enough in time and in space from the
    /// last delivered position.
    pub fn admits(&self, previous: &Position, next: &Position) -> bool {
        let elapsed = next.observed_at() - previous.observed_at();
        let elapsed = elapsed.to_std().unwrap_or(Duration::ZERO);
        let moved_m = proximity::haversine_km(previous, next.latitude(), next.longitude()) * 1000.0;
        elapsed >= self.min_interval && moved_m >= self.min_distance_m
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStatus {
    Safe,
    Unsafe,
}

/// A curated point location as published by the marker feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub status: MarkerStatus,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Marker {
    pub fn is_unsafe(&self) -> bool {
        self.status == MarkerStatus::Unsafe
    }

    pub fn has_valid_coordinates(&self) -> bool {
        validate_coordinates(self.latitude, self.longitude).is_ok()
    }
}

/// Nearest unsafe marker inside the geofence radius.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DangerZone {
    pub marker: Marker,
    pub distance_km: f64,
}

impl DangerZone {
    pub fn distance_m(&self) -> f64 {
        self.distance_km * 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopped,
}
