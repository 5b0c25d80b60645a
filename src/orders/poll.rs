use crate::error::AppError;
use crate::events::{EventBus, IntakeEvent};
use crate::orders::api::OrderApi;
use crate::orders::intake::{
    Admission, DecisionOutcome, NotificationSource, OrderIntakeController, PendingNotification,
};
use crate::orders::types::{Order, OrderStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub admitted: Option<String>,
    pub duplicates: usize,
    pub deferred: usize,
    pub superseded: Option<(String, OrderStatus)>,
}

/// Runs the admission half of a poll. Must be called without any await
/// between reading the snapshot and touching the controller.
pub fn admit_from_snapshot(
    intake: &mut OrderIntakeController,
    snapshot: &[Order],
    now_ms: i64,
) -> PollReport {
    let mut report = PollReport {
        superseded: intake
            .supersede_from_snapshot(snapshot)
            .map(|(order, status)| (order.order_id, status)),
        ..PollReport::default()
    };

    let confirmed = snapshot
        .iter()
        .filter(|order| order.status == OrderStatus::Confirmed);
    for order in confirmed {
        if report.admitted.is_some() || !intake.is_idle() {
            if intake.dedup().has_seen_order(order) {
                report.duplicates += 1;
            } else {
                report.deferred += 1;
            }
            continue;
        }

        let admission = intake.offer(PendingNotification {
            order: order.clone(),
            received_at_ms: now_ms,
            source: NotificationSource::Poll,
        });
        match admission {
            Admission::Opened => report.admitted = Some(order.order_id.clone()),
            Admission::Duplicate => report.duplicates += 1,
            Admission::Busy => report.deferred += 1,
            Admission::NotConfirmed => {}
        }
    }

    report
}

/// Fallback source for new orders while the push channel is down or lagging.
pub struct PollFallback {
    api: Arc<dyn OrderApi>,
    intake: Arc<Mutex<OrderIntakeController>>,
    bus: EventBus,
}

impl PollFallback {
    pub fn new(
        api: Arc<dyn OrderApi>,
        intake: Arc<Mutex<OrderIntakeController>>,
        bus: EventBus,
    ) -> Self {
        Self { api, intake, bus }
    }

    /// Fetches the order list and admits at most one new confirmed order.
    /// Returns `Ok(None)` when the owner was torn down mid-fetch.
    pub async fn poll_once(
        &self,
        now_ms: impl FnOnce() -> i64,
        liveness: &CancellationToken,
    ) -> Result<Option<PollReport>, AppError> {
        let snapshot = match self.api.get_orders().await {
            Ok(orders) => orders,
            Err(error) if error.is_benign_empty() => {
                debug!(%error, "order poll returned no orders");
                Vec::new()
            }
            Err(error) => return Err(error),
        };

        if liveness.is_cancelled() {
            return Ok(None);
        }

        let (report, opened) = {
            let mut intake = self.intake.lock();
            let report = admit_from_snapshot(&mut intake, &snapshot, now_ms());
            let opened = intake
                .window()
                .filter(|_| report.admitted.is_some())
                .map(|window| IntakeEvent::WindowOpened {
                    order_id: window.order.order_id.clone(),
                    source: window.source,
                    deadline_ms: window.deadline_ms,
                    prep_minutes: window.prep_minutes,
                });
            let alarm = intake.alarm_active();
            (report, opened.map(|event| (event, alarm)))
        };

        if let Some((order_id, status)) = report.superseded.clone() {
            self.bus.publish(IntakeEvent::Decided {
                order_id,
                outcome: DecisionOutcome::Superseded { status },
            });
            self.bus.publish(IntakeEvent::AlarmStopped);
        }
        if let Some((event, alarm)) = opened {
            self.bus.publish(event);
            if alarm {
                self.bus.publish(IntakeEvent::AlarmStarted);
            }
        }

        Ok(Some(report))
    }
}
