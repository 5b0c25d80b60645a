use crate::config::IntakeConfig;
use crate::events::EventBus;
use crate::orders::dedup::NotificationDeduplicator;
use crate::orders::intake::OrderIntakeController;
use crate::orders::lifecycle::OrderLifecycleTracker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TaskHandle {
    pub name: &'static str,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

/// Shared stores of one intake session. Every background task holds a clone
/// of the `Arc` and checks `liveness` before mutating anything after an await.
pub struct IntakeState {
    pub started_at: Instant,
    pub bus: EventBus,
    pub intake: Arc<Mutex<OrderIntakeController>>,
    pub lifecycle: Arc<Mutex<OrderLifecycleTracker>>,
    pub status_refresh: Notify,
    pub liveness: CancellationToken,
}

impl IntakeState {
    pub fn new(config: &IntakeConfig, bus: EventBus) -> Self {
        let mut intake = OrderIntakeController::new(
            NotificationDeduplicator::new(),
            config.decision_window_ms,
            config.expiry_policy,
        );
        intake.set_muted(config.muted);

        Self {
            started_at: Instant::now(),
            bus,
            intake: Arc::new(Mutex::new(intake)),
            lifecycle: Arc::new(Mutex::new(OrderLifecycleTracker::new(
                config.auto_ready_grace_ms,
            ))),
            status_refresh: Notify::new(),
            liveness: CancellationToken::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.liveness.is_cancelled()
    }
}
