use crate::error::AppError;
use crate::events::{EventBus, IntakeEvent};
use crate::geo::types::{
    haversine_meters, GeolocationError, LocationSample, RawPosition, WatchOptions,
    DEFAULT_MIN_DISTANCE_METERS, DEFAULT_MIN_INTERVAL_MS,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Continuous device position stream.
pub trait PositionSource: Send + Sync {
    fn watch(
        &self,
        options: WatchOptions,
    ) -> BoxStream<'static, Result<RawPosition, GeolocationError>>;
}

/// Transport that delivers accepted samples.
#[async_trait]
pub trait LocationSink: Send + Sync {
    async fn report(&self, sample: LocationSample) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct ThrottleGate {
    min_interval_ms: i64,
    min_distance_meters: f64,
    last_sent_at_ms: Option<i64>,
    last_sent_position: Option<(f64, f64)>,
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL_MS, DEFAULT_MIN_DISTANCE_METERS)
    }
}

impl ThrottleGate {
    pub fn new(min_interval_ms: i64, min_distance_meters: f64) -> Self {
        Self {
            min_interval_ms: min_interval_ms.max(0),
            min_distance_meters: min_distance_meters.max(0.0),
            last_sent_at_ms: None,
            last_sent_position: None,
        }
    }

    /// Returns `true` when the sample passes both gates, recording it as the
    /// last sent sample.
    pub fn offer(&mut self, sample: &LocationSample) -> bool {
        if let Some(last_sent_at_ms) = self.last_sent_at_ms {
            if sample.timestamp_ms.saturating_sub(last_sent_at_ms) < self.min_interval_ms {
                return false;
            }
        }

        if let Some((last_lat, last_lng)) = self.last_sent_position {
            let moved = haversine_meters(last_lat, last_lng, sample.lat, sample.lng);
            if moved < self.min_distance_meters {
                return false;
            }
        }

        self.last_sent_at_ms = Some(sample.timestamp_ms);
        self.last_sent_position = Some((sample.lat, sample.lng));
        true
    }

    pub fn reset(&mut self) {
        self.last_sent_at_ms = None;
        self.last_sent_position = None;
    }

    pub fn last_sent_at_ms(&self) -> Option<i64> {
        self.last_sent_at_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoThrottleStatus {
    Idle,
    Watching,
    Failed(GeolocationError),
}

struct WatchHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

/// Owns one watch on a [`PositionSource`] and forwards gated samples to a
/// [`LocationSink`]. Source errors end the watch; it is not retried until
/// [`GeoThrottle::start`] is called again.
pub struct GeoThrottle {
    source: Arc<dyn PositionSource>,
    sink: Arc<dyn LocationSink>,
    bus: EventBus,
    options: WatchOptions,
    gate: Arc<Mutex<ThrottleGate>>,
    status: Arc<Mutex<GeoThrottleStatus>>,
    watch: Option<WatchHandle>,
}

impl GeoThrottle {
    pub fn new(
        source: Arc<dyn PositionSource>,
        sink: Arc<dyn LocationSink>,
        gate: ThrottleGate,
        bus: EventBus,
    ) -> Self {
        Self {
            source,
            sink,
            bus,
            options: WatchOptions::default(),
            gate: Arc::new(Mutex::new(gate)),
            status: Arc::new(Mutex::new(GeoThrottleStatus::Idle)),
            watch: None,
        }
    }

    pub fn status(&self) -> GeoThrottleStatus {
        self.status.lock().clone()
    }

    pub fn is_watching(&self) -> bool {
        let running = self
            .watch
            .as_ref()
            .is_some_and(|watch| !watch.join_handle.is_finished());
        running && matches!(*self.status.lock(), GeoThrottleStatus::Watching)
    }

    /// Starts watching. Returns `false` without side effects when a watch is
    /// already running.
    pub fn start(&mut self) -> bool {
        if self.is_watching() {
            return false;
        }

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let stream = self.source.watch(self.options);
        let sink = Arc::clone(&self.sink);
        let gate = Arc::clone(&self.gate);
        let status = Arc::clone(&self.status);
        let bus = self.bus.clone();

        *self.status.lock() = GeoThrottleStatus::Watching;
        let join_handle = tokio::spawn(async move {
            run_watch(stream, sink, gate, status, bus, task_token).await;
        });

        self.watch = Some(WatchHandle {
            cancellation_token,
            join_handle,
        });
        true
    }

    /// Ends the watch and forgets the last sent sample. Safe to call when idle.
    pub async fn stop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.cancellation_token.cancel();
            let _ = watch.join_handle.await;
        }
        self.gate.lock().reset();
        *self.status.lock() = GeoThrottleStatus::Idle;
    }
}

impl Drop for GeoThrottle {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.cancellation_token.cancel();
        }
    }
}

async fn run_watch(
    mut stream: BoxStream<'static, Result<RawPosition, GeolocationError>>,
    sink: Arc<dyn LocationSink>,
    gate: Arc<Mutex<ThrottleGate>>,
    status: Arc<Mutex<GeoThrottleStatus>>,
    bus: EventBus,
    cancel_token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = stream.next() => next,
        };

        let raw = match next {
            Some(Ok(raw)) => raw,
            Some(Err(failure)) => {
                error!(error = %failure, "position source failed, location reporting stopped");
                *status.lock() = GeoThrottleStatus::Failed(failure.clone());
                bus.publish(IntakeEvent::GeolocationFailed {
                    message: failure.to_string(),
                });
                break;
            }
            None => break,
        };

        let Ok(sample) = LocationSample::try_from(raw) else {
            continue;
        };

        let accepted = !cancel_token.is_cancelled() && gate.lock().offer(&sample);
        if !accepted {
            continue;
        }

        if let Err(failure) = sink.report(sample).await {
            warn!(error = %failure, "failed to deliver location sample");
            continue;
        }
        bus.publish(IntakeEvent::LocationReported(sample));
    }
}
