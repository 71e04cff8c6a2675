// Alert debouncer - per-zone cooldown tracking.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::core::model::MarkerId;

/// Default cooldown between two alerts for the same zone.
pub const DEFAULT_COOLDOWN: TimeDelta = TimeDelta::minutes(5);

/// Cooldown gate keyed by zone id. A zone that never alerted always passes.
pub struct AlertDebouncer {
    cooldown: TimeDelta,
    /// Last fire time per zone
    last_alerted: HashMap<MarkerId, DateTime<Utc>>,
}

impl AlertDebouncer {
    pub fn new(cooldown: TimeDelta) -> Self {
        Self {
            cooldown,
            last_alerted: HashMap::new(),
        }
    }

    pub fn should_alert(&self, zone_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_alerted.get(zone_id) {
            Some(last) => now.signed_duration_since(*last) >= self.cooldown,
            None => true,
        }
    }

    pub fn record_alert(&mut self, zone_id: &str, now: DateTime<Utc>) {
        self.last_alerted.insert(zone_id.to_string(), now);
    }

    /// Check and record in one step. Returns true if the caller should alert.
    pub fn try_acquire(&mut self, zone_id: &str, now: DateTime<Utc>) -> bool {
        if !self.should_alert(zone_id, now) {
            return false;
        }
        self.record_alert(zone_id, now);
        true
    }

    pub fn last_alerted(&self, zone_id: &str) -> Option<DateTime<Utc>> {
        self.last_alerted.get(zone_id).copied()
    }

    pub fn cooldown(&self) -> TimeDelta {
        self.cooldown
    }

    pub fn tracked_zones(&self) -> usize {
        self.last_alerted.len()
    }
}

impl Default for AlertDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
