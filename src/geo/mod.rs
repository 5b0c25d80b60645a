pub mod throttle;
pub mod types;

pub use throttle::{GeoThrottle, GeoThrottleStatus, LocationSink, PositionSource, ThrottleGate};
pub use types::{
    haversine_meters, GeolocationError, LocationSample, RawPosition, WatchOptions,
    DEFAULT_MIN_DISTANCE_METERS, DEFAULT_MIN_INTERVAL_MS,
};
