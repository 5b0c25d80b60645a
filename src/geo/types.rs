use crate::error::AppError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MIN_INTERVAL_MS: i64 = 3_000;
pub const DEFAULT_MIN_DISTANCE_METERS: f64 = 5.0;
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeolocationError {
    #[error("location permission denied; allow location access to share delivery progress")]
    PermissionDenied,
    #[error("location unavailable; check that location services are enabled")]
    Unavailable,
    #[error("timed out waiting for a location fix; move to an open area and restart tracking")]
    Timeout,
}

/// A reading as delivered by the device position source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
    pub timestamp_ms: i64,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64, timestamp_ms: i64) -> Self {
        Self {
            lat,
            lng,
            heading: None,
            timestamp_ms,
        }
    }
}

impl TryFrom<RawPosition> for LocationSample {
    type Error = AppError;

    fn try_from(value: RawPosition) -> Result<Self, Self::Error> {
        if !value.lat.is_finite()
            || !value.lng.is_finite()
            || !(-90.0..=90.0).contains(&value.lat)
            || !(-180.0..=180.0).contains(&value.lng)
        {
            return Err(AppError::InvalidArgument(
                "position must have finite, in-range coordinates".to_string(),
            ));
        }

        Ok(Self {
            lat: value.lat,
            lng: value.lng,
            heading: value.heading.filter(|heading| heading.is_finite()),
            timestamp_ms: value.timestamp_ms,
        })
    }
}

/// Options the position source is started with: high accuracy and no cached fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub maximum_age_ms: u64,
    pub timeout_ms: Option<u64>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            maximum_age_ms: 0,
            timeout_ms: None,
        }
    }
}

/// Great-circle distance in meters on a spherical Earth.
pub fn haversine_meters(from_lat: f64, from_lng: f64, to_lat: f64, to_lng: f64) -> f64 {
    let phi1 = from_lat.to_radians();
    let phi2 = to_lat.to_radians();
    let delta_phi = (to_lat - from_lat).to_radians();
    let delta_lambda = (to_lng - from_lng).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}
