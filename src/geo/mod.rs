use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

const EARTH_RADIUS_KM: f64 = 6_371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLeg {
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub geometry: Vec<GeoPoint>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub computed_at: DateTime<Utc>,
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteLeg, AppError>;
}

/// Straight-line estimator used when no external routing service is wired in.
pub struct HaversineRouter {
    pub speed_mps: f64,
}

impl HaversineRouter {
    pub fn new(speed_mps: f64) -> Self {
        Self { speed_mps }
    }
}

#[async_trait]
impl RouteProvider for HaversineRouter {
    async fn route(&self, origin: GeoPoint, destination: GeoPoint) -> Result<RouteLeg, AppError> {
        if !origin.is_finite() || !destination.is_finite() {
            return Err(AppError::Validation(
                "route endpoints must be finite coordinates".to_string(),
            ));
        }

        let distance_meters = haversine_km(&origin, &destination) * 1_000.0;
        let speed = self.speed_mps.max(0.1);

        Ok(RouteLeg {
            origin,
            destination,
            geometry: vec![origin, destination],
            distance_meters,
            duration_seconds: distance_meters / speed,
            computed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{GeoPoint, HaversineRouter, RouteProvider, haversine_km};

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

    #[tokio::test]
    async fn estimator_duration_scales_with_speed() {
        let a = GeoPoint { lat: 52.51, lng: 13.39 };
        let b = GeoPoint { lat: 52.54, lng: 13.42 };

        let slow = HaversineRouter::new(5.0).route(a, b).await.unwrap();
        let fast = HaversineRouter::new(10.0).route(a, b).await.unwrap();

        assert!(slow.distance_meters > 0.0);
        assert!((slow.duration_seconds / fast.duration_seconds - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn estimator_rejects_non_finite_coordinates() {
        let a = GeoPoint { lat: f64::NAN, lng: 13.39 };
        let b = GeoPoint { lat: 52.54, lng: 13.42 };

        let result = HaversineRouter::new(5.0).route(a, b).await;
        assert!(result.is_err());
    }
}
