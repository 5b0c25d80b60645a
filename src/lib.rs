pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod geo;
pub mod orders;
pub mod realtime;
pub mod state;

#[cfg(test)]
mod testing;

use clock::WallClock;
use config::IntakeConfig;
use coordinator::IntakeCoordinator;
use error::AppError;
use events::{EventBus, IntakeEvent};
use orders::api::HttpOrderApi;
use realtime::ws::WsConnector;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .try_init();
}

/// Runs order intake for the restaurant behind the configured credentials
/// until `shutdown` resolves.
pub async fn run(config: IntakeConfig, shutdown: impl Future<Output = ()>) -> Result<(), AppError> {
    let api = HttpOrderApi::new(
        Client::new(),
        config.api_base_url.clone(),
        config.auth_token.clone(),
    );
    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let coordinator = IntakeCoordinator::start(
        config,
        Arc::new(api),
        Arc::new(WsConnector),
        bus,
        WallClock::default(),
    )
    .await?;
    info!(
        restaurant_id = %coordinator.restaurant().id,
        restaurant = coordinator.restaurant().name.as_deref().unwrap_or_default(),
        "watching for orders"
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

fn log_event(event: &IntakeEvent) {
    match event {
        IntakeEvent::ChannelStatus(status) => info!(
            state = ?status.state,
            attempt = status.reconnect_attempt,
            reason = status.reason.as_deref().unwrap_or_default(),
            "push channel"
        ),
        IntakeEvent::WindowOpened {
            order_id,
            source,
            prep_minutes,
            ..
        } => info!(order_id = %order_id, ?source, prep_minutes, "order awaiting decision"),
        IntakeEvent::Expired { order_id, closed } => {
            warn!(order_id = %order_id, closed, "decision window expired")
        }
        IntakeEvent::DecisionFailed { order_id, message } => {
            warn!(order_id = %order_id, message = %message, "decision failed")
        }
        IntakeEvent::BucketsRefreshed { counts } => tracing::debug!(?counts, "order buckets"),
        IntakeEvent::Countdown { .. } => {}
        other => tracing::debug!(event = ?other, "intake event"),
    }
}
