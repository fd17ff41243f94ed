//! GeoIndex (C2): in-memory spatial index over sensors and shelters,
//! published as copy-on-write snapshots.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::model::{Sensor, Shelter};

const EARTH_RADIUS_M: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

/// Haversine great-circle distance in meters, accurate to <0.5% for radii
/// up to 100 km.
pub fn haversine_m(a: Point, b: Point) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

#[derive(Debug, Clone)]
struct GeoSnapshot {
    sensors: Vec<Sensor>,
    shelters: Vec<Shelter>,
}

pub struct GeoIndex {
    snapshot: ArcSwap<GeoSnapshot>,
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoIndex {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(GeoSnapshot {
                sensors: Vec::new(),
                shelters: Vec::new(),
            }),
        }
    }

    /// Atomically publishes a new view of the world. Called by StateStore
    /// after any sensor/shelter mutation.
    pub fn publish(&self, sensors: Vec<Sensor>, shelters: Vec<Shelter>) {
        self.snapshot.store(Arc::new(GeoSnapshot { sensors, shelters }));
    }

    pub fn within_radius_shelters(
        &self,
        center: Point,
        radius_m: f64,
        predicate: impl Fn(&Shelter) -> bool,
    ) -> Vec<(Shelter, f64)> {
        let snap = self.snapshot.load();
        let mut out: Vec<(Shelter, f64)> = snap
            .shelters
            .iter()
            .filter(|s| predicate(s))
            .map(|s| {
                let d = haversine_m(center, Point { lat: s.lat, lon: s.lon });
                (s.clone(), d)
            })
            .filter(|(_, d)| *d <= radius_m)
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    pub fn k_nearest_shelters(
        &self,
        center: Point,
        k: usize,
        predicate: impl Fn(&Shelter) -> bool,
    ) -> Vec<(Shelter, f64)> {
        let snap = self.snapshot.load();
        let mut out: Vec<(Shelter, f64)> = snap
            .shelters
            .iter()
            .filter(|s| predicate(s))
            .map(|s| {
                let d = haversine_m(center, Point { lat: s.lat, lon: s.lon });
                (s.clone(), d)
            })
            .collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out.truncate(k);
        out
    }

    pub fn sensor_location(&self, sensor_id: i64) -> Option<Point> {
        let snap = self.snapshot.load();
        snap.sensors
            .iter()
            .find(|s| s.id == sensor_id)
            .map(|s| Point { lat: s.lat, lon: s.lon })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SensorKind, SensorState, ShelterState};

    fn shelter(id: i64, lat: f64, lon: f64, current: i64, max: i64) -> Shelter {
        Shelter {
            id,
            name: format!("shelter-{id}"),
            kind: "general".into(),
            state: ShelterState::Available,
            capacity_max: max,
            capacity_current: current,
            has_medical: false,
            has_hvac: false,
            contact: None,
            lat,
            lon,
            version: 0,
        }
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = Point { lat: 40.42, lon: -3.70 };
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn k_nearest_sorts_ascending_and_respects_predicate() {
        let idx = GeoIndex::new();
        idx.publish(
            Vec::new(),
            vec![
                shelter(1, 40.43, -3.69, 0, 10),
                shelter(2, 40.50, -3.60, 10, 10),
                shelter(3, 40.421, -3.701, 0, 10),
            ],
        );
        let center = Point { lat: 40.42, lon: -3.70 };
        let nearest = idx.k_nearest_shelters(center, 2, |s| s.has_capacity());
        assert_eq!(nearest.len(), 2);
        assert_eq!(nearest[0].0.id, 3);
        assert_eq!(nearest[1].0.id, 1);
    }

    #[test]
    fn within_radius_excludes_far_shelters() {
        let idx = GeoIndex::new();
        idx.publish(Vec::new(), vec![shelter(1, 41.0, -3.70, 0, 10)]);
        let center = Point { lat: 40.42, lon: -3.70 };
        let hits = idx.within_radius_shelters(center, 1_000.0, |s| s.has_capacity());
        assert!(hits.is_empty());
    }

    #[test]
    fn sensor_location_looks_up_by_id() {
        let idx = GeoIndex::new();
        idx.publish(
            vec![Sensor {
                id: 7,
                name: "s7".into(),
                kind: SensorKind::Temperature,
                state: SensorState::Active,
                unit: "C".into(),
                lat: 1.0,
                lon: 2.0,
                precision: 0.1,
                range_min: -40.0,
                range_max: 80.0,
                strict_range: false,
                sample_period_seconds: 60,
            }],
            Vec::new(),
        );
        assert_eq!(idx.sensor_location(7), Some(Point { lat: 1.0, lon: 2.0 }));
        assert_eq!(idx.sensor_location(99), None);
    }
}
