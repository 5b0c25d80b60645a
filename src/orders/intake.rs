use crate::error::AppError;
use crate::orders::dedup::NotificationDeduplicator;
use crate::orders::types::{Order, OrderStatus, RejectReason, MIN_PREP_MINUTES};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DECISION_WINDOW_MS: i64 = 240_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Push,
    Poll,
}

#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub order: Order,
    pub received_at_ms: i64,
    pub source: NotificationSource,
}

/// What happens when the decision deadline passes without an operator action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Close the window and go idle; the order stays confirmed server-side.
    #[default]
    Dismiss,
    /// Keep the window open at zero remaining until the operator decides.
    Hold,
}

impl ExpiryPolicy {
    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dismiss" => Ok(Self::Dismiss),
            "hold" => Ok(Self::Hold),
            other => Err(AppError::InvalidArgument(format!(
                "unknown expiry policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct DecisionWindow {
    pub order: Order,
    pub source: NotificationSource,
    pub opened_at_ms: i64,
    pub deadline_ms: i64,
    pub prep_minutes: u32,
    pub expired: bool,
    pub in_flight: Option<DecisionAction>,
    pub last_error: Option<String>,
    pub retained_reason: Option<RejectReason>,
}

impl DecisionWindow {
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.deadline_ms.saturating_sub(now_ms).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Opened,
    Duplicate,
    /// Another window is open. The order is not recorded, so a later poll
    /// picks it up once the operator is free.
    Busy,
    NotConfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Accepted { prep_minutes: u32 },
    Rejected { reason: RejectReason },
    Expired,
    Superseded { status: OrderStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Counting { order_id: String, remaining_ms: i64 },
    Expired { order_id: String, closed: bool },
}

#[derive(Debug, Clone)]
pub struct AcceptRequest {
    pub order_id: String,
    pub prep_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct RejectRequest {
    pub order_id: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone)]
pub struct AcceptedOrder {
    pub order: Order,
    pub prep_minutes: u32,
    pub accepted_at_ms: i64,
}

/// Owns the single active decision window.
///
/// `idle -> pending -> {accepted | rejected | expired | superseded} -> idle`.
/// Network calls happen outside: `begin_*` hands out a request and marks the
/// window busy, `finish_*` applies the result.
#[derive(Debug)]
pub struct OrderIntakeController {
    dedup: NotificationDeduplicator,
    window: Option<DecisionWindow>,
    window_ms: i64,
    expiry_policy: ExpiryPolicy,
    muted: bool,
}

impl OrderIntakeController {
    pub fn new(dedup: NotificationDeduplicator, window_ms: i64, expiry_policy: ExpiryPolicy) -> Self {
        Self {
            dedup,
            window: None,
            window_ms,
            expiry_policy,
            muted: false,
        }
    }

    pub fn dedup(&self) -> &NotificationDeduplicator {
        &self.dedup
    }

    pub fn window(&self) -> Option<&DecisionWindow> {
        self.window.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.window.is_none()
    }

    /// Single admission point for both push and poll candidates. Runs without
    /// suspension so the dedup check and the window opening are one step.
    pub fn offer(&mut self, notification: PendingNotification) -> Admission {
        if notification.order.status != OrderStatus::Confirmed {
            return Admission::NotConfirmed;
        }
        if self.dedup.has_seen_order(&notification.order) {
            return Admission::Duplicate;
        }
        if self.window.is_some() {
            return Admission::Busy;
        }
        if !self.dedup.mark_order_seen(&notification.order) {
            return Admission::Duplicate;
        }

        let prep_minutes = notification.order.prep_minutes_or_default();
        self.window = Some(DecisionWindow {
            order: notification.order,
            source: notification.source,
            opened_at_ms: notification.received_at_ms,
            deadline_ms: notification.received_at_ms.saturating_add(self.window_ms),
            prep_minutes,
            expired: false,
            in_flight: None,
            last_error: None,
            retained_reason: None,
        });
        Admission::Opened
    }

    /// Remaining time is always derived from the stored deadline so a
    /// suspended timer cannot drift from the real deadline.
    pub fn tick(&mut self, now_ms: i64) -> TickOutcome {
        let Some(window) = self.window.as_mut() else {
            return TickOutcome::Idle;
        };

        let remaining_ms = window.remaining_ms(now_ms);
        if remaining_ms > 0 || window.expired || window.in_flight.is_some() {
            return TickOutcome::Counting {
                order_id: window.order.order_id.clone(),
                remaining_ms,
            };
        }

        window.expired = true;
        let order_id = window.order.order_id.clone();
        let closed = match self.expiry_policy {
            ExpiryPolicy::Dismiss => {
                self.window = None;
                true
            }
            ExpiryPolicy::Hold => false,
        };
        TickOutcome::Expired { order_id, closed }
    }

    pub fn set_prep_minutes(&mut self, prep_minutes: u32) -> Result<u32, AppError> {
        if prep_minutes < MIN_PREP_MINUTES {
            return Err(AppError::InvalidArgument(format!(
                "prep time must be at least {MIN_PREP_MINUTES} minute"
            )));
        }
        let window = self.pending_mut()?;
        window.prep_minutes = prep_minutes;
        Ok(prep_minutes)
    }

    pub fn adjust_prep_minutes(&mut self, delta: i32) -> Result<u32, AppError> {
        let window = self.pending_mut()?;
        let adjusted = i64::from(window.prep_minutes) + i64::from(delta);
        window.prep_minutes = adjusted.clamp(i64::from(MIN_PREP_MINUTES), i64::from(u32::MAX)) as u32;
        Ok(window.prep_minutes)
    }

    pub fn begin_accept(&mut self, prep_minutes: Option<u32>) -> Result<AcceptRequest, AppError> {
        if let Some(prep_minutes) = prep_minutes {
            self.set_prep_minutes(prep_minutes)?;
        }
        let window = self.idle_window_mut()?;
        window.in_flight = Some(DecisionAction::Accept);
        Ok(AcceptRequest {
            order_id: window.order.order_id.clone(),
            prep_minutes: window.prep_minutes,
        })
    }

    /// On failure the window stays pending so the operator can retry; the
    /// order is not recorded again.
    pub fn finish_accept(
        &mut self,
        request: &AcceptRequest,
        result: Result<(), AppError>,
        now_ms: i64,
    ) -> Result<AcceptedOrder, AppError> {
        let window = self.in_flight_window_mut(&request.order_id, DecisionAction::Accept)?;
        window.in_flight = None;
        if let Err(error) = result {
            window.last_error = Some(error.to_string());
            return Err(error);
        }

        let window = self.close()?;
        Ok(AcceptedOrder {
            order: window.order,
            prep_minutes: request.prep_minutes,
            accepted_at_ms: now_ms,
        })
    }

    pub fn begin_reject(&mut self, reason: Option<RejectReason>) -> Result<RejectRequest, AppError> {
        let window = self.idle_window_mut()?;
        let reason = reason
            .or_else(|| window.retained_reason.clone())
            .ok_or_else(|| AppError::InvalidArgument("a rejection reason is required".to_string()))?;
        window.retained_reason = Some(reason.clone());
        window.in_flight = Some(DecisionAction::Reject);
        Ok(RejectRequest {
            order_id: window.order.order_id.clone(),
            reason,
        })
    }

    /// On failure the reason is retained so a retry does not need it again.
    pub fn finish_reject(
        &mut self,
        request: &RejectRequest,
        result: Result<(), AppError>,
    ) -> Result<Order, AppError> {
        let window = self.in_flight_window_mut(&request.order_id, DecisionAction::Reject)?;
        window.in_flight = None;
        if let Err(error) = result {
            window.last_error = Some(error.to_string());
            return Err(error);
        }

        Ok(self.close()?.order)
    }

    /// Closes the window when the latest snapshot shows its order already
    /// moved past `confirmed`. Orders missing from the snapshot are left alone.
    pub fn supersede_from_snapshot(&mut self, snapshot: &[Order]) -> Option<(Order, OrderStatus)> {
        let window = self.window.as_ref()?;
        if window.in_flight.is_some() {
            return None;
        }
        let status = snapshot
            .iter()
            .find(|candidate| window.order.keys().any(|key| candidate.matches(key)))
            .map(|candidate| candidate.status)?;
        if status == OrderStatus::Confirmed {
            return None;
        }
        let window = self.window.take()?;
        Some((window.order, status))
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.muted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// The looping alert plays while a window is pending and not muted.
    pub fn alarm_active(&self) -> bool {
        !self.muted && self.window.as_ref().is_some_and(|window| !window.expired)
    }

    fn close(&mut self) -> Result<DecisionWindow, AppError> {
        self.window
            .take()
            .ok_or_else(|| AppError::InvalidArgument("no pending order".to_string()))
    }

    fn pending_mut(&mut self) -> Result<&mut DecisionWindow, AppError> {
        self.window
            .as_mut()
            .ok_or_else(|| AppError::InvalidArgument("no pending order".to_string()))
    }

    fn idle_window_mut(&mut self) -> Result<&mut DecisionWindow, AppError> {
        let window = self.pending_mut()?;
        if window.in_flight.is_some() {
            return Err(AppError::InvalidArgument(
                "a decision for this order is already in flight".to_string(),
            ));
        }
        Ok(window)
    }

    fn in_flight_window_mut(
        &mut self,
        order_id: &str,
        action: DecisionAction,
    ) -> Result<&mut DecisionWindow, AppError> {
        let window = self.pending_mut()?;
        if window.order.order_id != order_id || window.in_flight != Some(action) {
            return Err(AppError::InvalidArgument(format!(
                "no {action:?} in flight for order {order_id}"
            )));
        }
        Ok(window)
    }
}
