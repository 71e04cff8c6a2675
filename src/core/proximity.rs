//! Great-circle proximity between a position and unsafe-zone markers.
//!
//! Pure functions only: the evaluator has no state and reads nothing but its
//! arguments, so it can be exercised directly in tests.

use super::model::{DangerZone, Marker, Position};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default geofence radius in kilometres.
pub const DEFAULT_RADIUS_KM: f64 = 0.5;

/// Haversine distance in kilometres from `from` to the given coordinates.
pub fn haversine_km(from: &Position, latitude: f64, longitude: f64) -> f64 {
    let d_lat = (latitude - from.latitude()).to_radians();
    let d_lon = (longitude - from.longitude()).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + from.latitude().to_radians().cos()
            * latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);

    // Clamp guards against a > 1.0 from rounding near antipodes
    let c = 2.0 * a.min(1.0).sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_KM * c
}

/// Returns the nearest marker within `radius_km`, ties going to the smaller id.
pub fn evaluate(position: &Position, markers: &[Marker], radius_km: f64) -> Option<DangerZone> {
    if !radius_km.is_finite() || radius_km < 0.0 {
        return None;
    }

    let mut best: Option<(&Marker, f64)> = None;
    for marker in markers {
        let distance = haversine_km(position, marker.latitude, marker.longitude);
        if distance.is_nan() || distance > radius_km {
            continue;
        }
        best = match best {
            Some((current, current_distance))
                if current_distance < distance
                    || (current_distance == distance && current.id <= marker.id) =>
            {
                Some((current, current_distance))
            }
            _ => Some((marker, distance)),
        };
    }

    best.map(|(marker, distance_km)| DangerZone {
        marker: marker.clone(),
        distance_km,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::MarkerStatus;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn pos(lat: f64, lon: f64) -> Position {
        Position::new(lat, lon, now()).unwrap()
    }

    fn marker(id: &str, lat: f64, lon: f64) -> Marker {
        Marker {
            id: id.to_string(),
            status: MarkerStatus::Unsafe,
            latitude: lat,
            longitude: lon,
            note: None,
        }
    }

    #[test]
    fn test_bangalore_scenario() {
        let here = pos(12.9716, 77.5946);
        let markers = vec![marker("m1", 12.9720, 77.5950)];

        let zone = evaluate(&here, &markers, 0.5).expect("marker within 0.5km");
        assert_eq!(zone.marker.id, "m1");
        assert!((zone.distance_km - 0.062).abs() < 0.002, "got {}", zone.distance_km);

        assert!(evaluate(&here, &markers, 0.05).is_none());
    }

    #[test]
    fn test_empty_markers() {
        assert!(evaluate(&pos(0.0, 0.0), &[], DEFAULT_RADIUS_KM).is_none());
    }

    #[test]
    fn test_nearest_wins() {
        let here = pos(12.9716, 77.5946);
        let markers = vec![
            marker("far", 12.9740, 77.5970),
            marker("near", 12.9718, 77.5947),
            marker("outside", 13.5, 78.0),
        ];
        let zone = evaluate(&here, &markers, 0.5).unwrap();
        assert_eq!(zone.marker.id, "near");
    }

    #[test]
    fn test_tie_break_smaller_id() {
        let here = pos(10.0, 10.0);
        // Same coordinates, so distances are bit-identical
        let markers = vec![
            marker("zeta", 10.001, 10.001),
            marker("alpha", 10.001, 10.001),
            marker("mid", 10.001, 10.001),
        ];
        assert_eq!(evaluate(&here, &markers, 1.0).unwrap().marker.id, "alpha");

        let reversed: Vec<Marker> = markers.into_iter().rev().collect();
        assert_eq!(evaluate(&here, &reversed, 1.0).unwrap().marker.id, "alpha");
    }

    #[test]
    fn test_radius_is_inclusive() {
        let here = pos(0.0, 0.0);
        let m = marker("edge", 0.0, 0.001);
        let d = haversine_km(&here, m.latitude, m.longitude);
        assert!(evaluate(&here, &[m], d).is_some());
    }

    #[test]
    fn test_invalid_radius() {
        let here = pos(0.0, 0.0);
        let markers = vec![marker("m", 0.0, 0.0)];
        assert!(evaluate(&here, &markers, -1.0).is_none());
        assert!(evaluate(&here, &markers, f64::NAN).is_none());
    }

    #[test]
    fn test_zero_distance() {
        let here = pos(45.0, 7.0);
        assert_eq!(haversine_km(&here, 45.0, 7.0), 0.0);
    }

    fn coords() -> impl Strategy<Value = (f64, f64)> {
        (-89.0f64..89.0, -179.0f64..179.0)
    }

    proptest! {
        #[test]
        fn prop_zone_iff_marker_within_radius(
            origin in coords(),
            offsets in prop::collection::vec((-0.02f64..0.02, -0.02f64..0.02), 0..12),
            radius in 0.0f64..3.0,
        ) {
            let here = pos(origin.0, origin.1);
            let markers: Vec<Marker> = offsets
                .iter()
                .enumerate()
                .map(|(i, (dlat, dlon))| marker(&format!("m{:02}", i), origin.0 + dlat, origin.1 + dlon))
                .collect();

            let distances: Vec<f64> = markers
                .iter()
                .map(|m| haversine_km(&here, m.latitude, m.longitude))
                .collect();
            let qualifying: Vec<f64> = distances.iter().copied().filter(|d| *d <= radius).collect();

            match evaluate(&here, &markers, radius) {
                Some(zone) => {
                    prop_assert!(!qualifying.is_empty());
                    prop_assert!(zone.distance_km <= radius);
                    let min = qualifying.iter().copied().fold(f64::INFINITY, f64::min);
                    prop_assert_eq!(zone.distance_km, min);
                }
                None => prop_assert!(qualifying.is_empty()),
            }
        }
    }
}
