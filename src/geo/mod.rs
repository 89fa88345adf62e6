pub mod directory;

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::DirectoryError;
use crate::geo::directory::CourierDirectory;
use crate::models::courier::{Courier, GeoPoint};

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub courier_id: Uuid,
    pub location: GeoPoint,
    pub distance_km: f64,
}

struct Ranked(Candidate);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .distance_km
            .total_cmp(&other.0.distance_km)
            .then_with(|| self.0.courier_id.cmp(&other.0.courier_id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

/// Nearest-first candidates. Ordering work is paid per `next()`, so a
/// caller that only needs the closest courier never sorts the whole set.
pub struct Candidates {
    heap: BinaryHeap<Reverse<Ranked>>,
}

impl Candidates {
    pub fn rank<I>(couriers: I, origin: &GeoPoint, radius_km: f64, excluded: &BTreeSet<Uuid>) -> Self
    where
        I: IntoIterator<Item = Courier>,
    {
        let heap = couriers
            .into_iter()
            .filter(|courier| courier.is_available() && !excluded.contains(&courier.id))
            .filter_map(|courier| {
                let distance_km = haversine_km(origin, &courier.location);
                (distance_km <= radius_km).then_some(Reverse(Ranked(Candidate {
                    courier_id: courier.id,
                    location: courier.location,
                    distance_km,
                })))
            })
            .collect();

        Self { heap }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Iterator for Candidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        self.heap.pop().map(|Reverse(Ranked(candidate))| candidate)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), Some(self.heap.len()))
    }
}

/// Radius queries over the courier directory. Holds no lock of its own.
#[derive(Clone)]
pub struct GeoIndex {
    directory: Arc<dyn CourierDirectory>,
}

impl GeoIndex {
    pub fn new(directory: Arc<dyn CourierDirectory>) -> Self {
        Self { directory }
    }

    pub async fn candidates(
        &self,
        origin: &GeoPoint,
        radius_km: f64,
        excluded: &BTreeSet<Uuid>,
    ) -> Result<Candidates, DirectoryError> {
        let couriers = self.directory.available_couriers().await?;
        Ok(Candidates::rank(couriers, origin, radius_km, excluded))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{Candidates, GeoIndex, haversine_km};
    use crate::geo::directory::InMemoryCourierDirectory;
    use crate::models::courier::{Courier, CourierStatus, GeoPoint};

    fn courier(id_seed: u128, lat: f64, lng: f64, status: CourierStatus) -> Courier {
        Courier {
            id: Uuid::from_u128(id_seed),
            name: "test-courier".to_string(),
            location: GeoPoint { lat, lng },
            status,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn longitude_degrees_shrink_near_the_poles() {
        // One degree of longitude at 80N is ~19 km, not the ~111 km a planar
        // lat/lng distance would report.
        let a = GeoPoint { lat: 80.0, lng: 10.0 };
        let b = GeoPoint { lat: 80.0, lng: 11.0 };
        let distance = haversine_km(&a, &b);
        assert!((distance - 19.3).abs() < 0.5);
    }

    #[test]
    fn candidates_are_nearest_first_within_radius() {
        let origin = GeoPoint {
            lat: 52.52,
            lng: 13.405,
        };
        let couriers = vec![
            courier(1, 52.54, 13.405, CourierStatus::Available), // ~2.2 km
            courier(2, 52.521, 13.405, CourierStatus::Available), // ~0.1 km
            courier(3, 52.70, 13.405, CourierStatus::Available), // ~20 km
        ];

        let ids: Vec<u128> = Candidates::rank(couriers, &origin, 5.0, &BTreeSet::new())
            .map(|c| c.courier_id.as_u128())
            .collect();

        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn unavailable_and_excluded_couriers_are_skipped() {
        let origin = GeoPoint {
            lat: 52.52,
            lng: 13.405,
        };
        let couriers = vec![
            courier(1, 52.521, 13.405, CourierStatus::Busy),
            courier(2, 52.522, 13.405, CourierStatus::Offline),
            courier(3, 52.523, 13.405, CourierStatus::Available),
            courier(4, 52.524, 13.405, CourierStatus::Available),
        ];
        let excluded = BTreeSet::from([Uuid::from_u128(3)]);

        let mut candidates = Candidates::rank(couriers, &origin, 5.0, &excluded);
        assert_eq!(candidates.next().map(|c| c.courier_id.as_u128()), Some(4));
        assert!(candidates.next().is_none());
    }

    #[tokio::test]
    async fn empty_directory_yields_no_candidates() {
        let index = GeoIndex::new(Arc::new(InMemoryCourierDirectory::new()));
        let origin = GeoPoint { lat: 0.0, lng: 0.0 };

        let candidates = index
            .candidates(&origin, 5.0, &BTreeSet::new())
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
