use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use super::model::{Accuracy, FixRequest, WatchConfig};

/// Monitoring settings - persisted in settings.json
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    /// Geofence radius in kilometres
    pub geofence_radius_km: f64,
    /// Minimum time between two alerts for the same zone
    pub cooldown_seconds: u64,
    pub sample_attempts: u32,
    pub sample_timeout_ms: u64,
    /// Linear backoff base: attempt N waits N * this before retrying
    pub sample_backoff_ms: u64,
    pub fix_max_age_ms: u64,
    pub watch_interval_seconds: u64,
    pub watch_distance_meters: f64,
    /// Pause between staged permission requests
    pub permission_stage_delay_ms: u64,
    pub request_background: bool,
    pub request_notifications: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            geofence_radius_km: 0.5,
            cooldown_seconds: 300,
            sample_attempts: 3,
            sample_timeout_ms: 15_000,
            sample_backoff_ms: 1_000,
            fix_max_age_ms: 10_000,
            watch_interval_seconds: 10,
            watch_distance_meters: 50.0,
            permission_stage_delay_ms: 1_500,
            request_background: false,
            request_notifications: true,
        }
    }
}

impl MonitorSettings {
    pub fn cooldown(&self) -> TimeDelta {
        i64::try_from(self.cooldown_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_millis(self.sample_timeout_ms)
    }

    pub fn sample_backoff(&self) -> Duration {
        Duration::from_millis(self.sample_backoff_ms)
    }

    pub fn permission_stage_delay(&self) -> Duration {
        Duration::from_millis(self.permission_stage_delay_ms)
    }

    pub fn fix_request(&self, accuracy: Accuracy) -> FixRequest {
        FixRequest {
            accuracy,
            timeout: self.sample_timeout(),
            maximum_age: Duration::from_millis(self.fix_max_age_ms),
        }
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            accuracy: Accuracy::High,
            min_interval: Duration::from_secs(self.watch_interval_seconds),
            min_distance_m: self.watch_distance_meters,
        }
    }
}

pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            config_path: config_dir.join("settings.json"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Missing or unreadable settings fall back to defaults.
    pub fn load(&self) -> MonitorSettings {
        if self.config_path.exists() {
            match fs::read_to_string(&self.config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => return settings,
                    Err(e) => log::warn!("Ignoring malformed {:?}: {}", self.config_path, e),
                },
                Err(e) => log::warn!("Failed to read {:?}: {}", self.config_path, e),
            }
        }
        MonitorSettings::default()
    }

    pub fn save(&self, settings: &MonitorSettings) -> io::Result<()> {
        // Ensure directory exists
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.config_path, content)
    }
}
