// Alert payload types handed to the external sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::model::{DangerZone, MarkerId, Position};

pub const ALERT_TITLE: &str = "Unsafe Area Detected";
pub const AUDIT_KIND: &str = "Unsafe Zone Entry";
const DEFAULT_ADVICE: &str = "Please stay cautious.";

/// Metadata attached to a notification so the host app can route a tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub marker_id: MarkerId,
    pub distance_m: u32,
}

/// Notification for one danger-zone entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneAlert {
    pub title: String,
    pub body: String,
    pub metadata: AlertMetadata,
}

impl ZoneAlert {
    pub fn for_zone(zone: &DangerZone) -> Self {
        let distance_m = rounded_meters(zone);
        let advice = zone
            .marker
            .note
            .as_deref()
            .filter(|note| !note.trim().is_empty())
            .unwrap_or(DEFAULT_ADVICE);

        Self {
            title: ALERT_TITLE.to_string(),
            body: format!("You are {}m from an unsafe zone. {}", distance_m, advice),
            metadata: AlertMetadata {
                kind: "danger_zone".to_string(),
                marker_id: zone.marker.id.clone(),
                distance_m,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Persisted record of a danger-zone entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: String,
    pub message: String,
    pub marker_id: MarkerId,
    pub latitude: f64,
    pub longitude: f64,
    pub address: String,
    pub severity: Severity,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn zone_entry(zone: &DangerZone, position: &Position, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind: AUDIT_KIND.to_string(),
            message: format!(
                "Entered within {}m of marked unsafe area",
                rounded_meters(zone)
            ),
            marker_id: zone.marker.id.clone(),
            latitude: position.latitude(),
            longitude: position.longitude(),
            address: "Current Location".to_string(),
            severity: Severity::High,
            occurred_at,
        }
    }
}

fn rounded_meters(zone: &DangerZone) -> u32 {
    zone.distance_m().round().max(0.0) as u32
}
