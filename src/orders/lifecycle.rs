use crate::error::AppError;
use crate::orders::intake::AcceptedOrder;
use crate::orders::types::{Order, OrderStatus};
use std::collections::{HashMap, HashSet};
use tracing::warn;

pub const DEFAULT_AUTO_READY_GRACE_MS: i64 = 1_000;
pub const MAX_AUTO_READY_GRACE_MS: i64 = 2_000;

const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrepClock {
    started_at_ms: i64,
    prep_minutes: u32,
    /// Started by a local acceptance rather than read from a snapshot.
    local: bool,
}

impl PrepClock {
    fn due_at_ms(self, grace_ms: i64) -> i64 {
        self.started_at_ms
            .saturating_add(i64::from(self.prep_minutes).saturating_mul(MINUTE_MS))
            .saturating_add(grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub order: Order,
    pub status: OrderStatus,
    pub preparing_started_at_ms: Option<i64>,
    pub prep_minutes: Option<u32>,
    /// Set when the status is a local prediction not yet seen in a snapshot.
    pub predicted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Marked,
    AlreadyAdvanced,
    WillRetry,
}

/// Legal moves of the post-intake state machine. Snapshots are authoritative
/// either way; this only decides whether a jump is worth a warning.
pub fn is_forward_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Confirmed, _) => true,
        (Preparing, Ready | OutForDelivery | Delivered | Completed | Cancelled) => true,
        (Ready, OutForDelivery | Delivered | Completed | Cancelled) => true,
        (OutForDelivery, Delivered | Completed) => true,
        (Delivered, Completed) => true,
        _ => false,
    }
}

/// Per-order view of orders past intake, rebuilt from every status snapshot.
/// The only transitions it predicts are `confirmed -> preparing` after a local
/// acceptance and `preparing -> ready` once the declared prep time has elapsed.
#[derive(Debug)]
pub struct OrderLifecycleTracker {
    views: HashMap<String, TrackedOrder>,
    prep_clocks: HashMap<String, PrepClock>,
    ready_in_progress: HashSet<String>,
    /// Orders that must never be auto-readied again: marked by us, or seen
    /// past `preparing` in a snapshot.
    ready_settled: HashSet<String>,
    grace_ms: i64,
}

impl Default for OrderLifecycleTracker {
    fn default() -> Self {
        Self::new(DEFAULT_AUTO_READY_GRACE_MS)
    }
}

impl OrderLifecycleTracker {
    pub fn new(grace_ms: i64) -> Self {
        Self {
            views: HashMap::new(),
            prep_clocks: HashMap::new(),
            ready_in_progress: HashSet::new(),
            ready_settled: HashSet::new(),
            grace_ms: grace_ms.clamp(0, MAX_AUTO_READY_GRACE_MS),
        }
    }

    pub fn handoff_preparing(&mut self, accepted: &AcceptedOrder) {
        let order_id = accepted.order.order_id.clone();
        let clock = PrepClock {
            started_at_ms: accepted.accepted_at_ms,
            prep_minutes: accepted.prep_minutes,
            local: true,
        };
        self.prep_clocks.insert(order_id.clone(), clock);

        let mut order = accepted.order.clone();
        order.status = OrderStatus::Preparing;
        order.estimated_prep_minutes = Some(accepted.prep_minutes);
        self.views.insert(
            order_id,
            TrackedOrder {
                order,
                status: OrderStatus::Preparing,
                preparing_started_at_ms: Some(clock.started_at_ms),
                prep_minutes: Some(clock.prep_minutes),
                predicted: true,
            },
        );
    }

    /// Replaces every bucket view with the snapshot. A locally accepted order
    /// keeps its predicted view while the snapshot omits it or still reports it
    /// confirmed. Bookkeeping for orders that left the snapshot is dropped
    /// unless a local acceptance is still waiting on auto-ready.
    pub fn reconcile(&mut self, snapshot: &[Order], now_ms: i64) {
        let mut next_views = HashMap::with_capacity(snapshot.len());
        let mut listed = HashSet::with_capacity(snapshot.len());

        for order in snapshot {
            let key = self.canonical_key(order);
            listed.insert(key.clone());

            if order.status == OrderStatus::Confirmed {
                if let Some(view) = self.local_prediction(&key) {
                    next_views.insert(key, view);
                }
                continue;
            }

            if let Some(previous) = self.views.get(&key) {
                if !previous.predicted && !is_forward_transition(previous.status, order.status) {
                    warn!(
                        order_id = %key,
                        from = previous.status.as_str(),
                        to = order.status.as_str(),
                        "order status moved backwards in snapshot"
                    );
                }
            }

            let clock = match order.status {
                OrderStatus::Preparing => Some(*self.prep_clocks.entry(key.clone()).or_insert(
                    PrepClock {
                        started_at_ms: order.accepted_at_ms.unwrap_or(now_ms),
                        prep_minutes: order.prep_minutes_or_default(),
                        local: false,
                    },
                )),
                _ => {
                    self.prep_clocks.remove(&key);
                    self.ready_in_progress.remove(&key);
                    self.ready_settled.insert(key.clone());
                    None
                }
            };

            next_views.insert(
                key,
                TrackedOrder {
                    order: order.clone(),
                    status: order.status,
                    preparing_started_at_ms: clock.map(|clock| clock.started_at_ms),
                    prep_minutes: clock.map(|clock| clock.prep_minutes),
                    predicted: false,
                },
            );
        }

        for key in self.prep_clocks.keys() {
            if listed.contains(key) || next_views.contains_key(key) {
                continue;
            }
            if let Some(view) = self.local_prediction(key) {
                if !self.ready_settled.contains(key) {
                    next_views.insert(key.clone(), view);
                }
            }
        }

        let settled = &self.ready_settled;
        self.prep_clocks
            .retain(|key, clock| listed.contains(key) || (clock.local && !settled.contains(key)));
        let clocks = &self.prep_clocks;
        self.ready_in_progress
            .retain(|key| listed.contains(key) || clocks.contains_key(key));
        self.ready_settled
            .retain(|key| listed.contains(key) || clocks.contains_key(key));
        self.views = next_views;
    }

    /// Claims every preparing order whose prep time has elapsed. A claimed
    /// order is not returned again until its call fails with a retryable error,
    /// and never once it has been marked ready.
    pub fn claim_due_for_ready(&mut self, now_ms: i64) -> Vec<String> {
        let mut due = Vec::new();
        for (order_id, view) in &self.views {
            if view.status != OrderStatus::Preparing || self.ready_settled.contains(order_id) {
                continue;
            }
            let Some(clock) = self.prep_clocks.get(order_id) else {
                continue;
            };
            if now_ms < clock.due_at_ms(self.grace_ms) {
                continue;
            }
            if self.ready_in_progress.insert(order_id.clone()) {
                due.push(order_id.clone());
            }
        }
        due.sort_unstable();
        due
    }

    pub fn finish_ready(&mut self, order_id: &str, result: Result<(), AppError>) -> ReadyOutcome {
        let outcome = match result {
            Ok(()) => ReadyOutcome::Marked,
            Err(error) if error.is_incompatible_state() => ReadyOutcome::AlreadyAdvanced,
            Err(error) => {
                warn!(order_id, %error, "auto-ready failed, will retry");
                self.ready_in_progress.remove(order_id);
                return ReadyOutcome::WillRetry;
            }
        };
        self.ready_in_progress.remove(order_id);
        self.ready_settled.insert(order_id.to_string());

        if let Some(view) = self.views.get_mut(order_id) {
            if view.status == OrderStatus::Preparing {
                view.status = OrderStatus::Ready;
                view.order.status = OrderStatus::Ready;
                view.predicted = true;
            }
        }
        outcome
    }

    pub fn is_ready_settled(&self, order_id: &str) -> bool {
        self.ready_settled.contains(order_id)
    }

    pub fn get(&self, order_id: &str) -> Option<&TrackedOrder> {
        self.views
            .get(order_id)
            .or_else(|| self.views.values().find(|view| view.order.matches(order_id)))
    }

    pub fn bucket(&self, status: OrderStatus) -> Vec<&TrackedOrder> {
        let mut orders: Vec<&TrackedOrder> = self
            .views
            .values()
            .filter(|view| view.status == status)
            .collect();
        orders.sort_by(|lhs, rhs| lhs.order.order_id.cmp(&rhs.order.order_id));
        orders
    }

    pub fn bucket_counts(&self) -> Vec<(OrderStatus, usize)> {
        OrderStatus::ALL
            .iter()
            .filter(|status| **status != OrderStatus::Confirmed)
            .map(|status| {
                let count = self.views.values().filter(|view| view.status == *status).count();
                (*status, count)
            })
            .collect()
    }

    /// Remaining prep time for a preparing order, zero once due.
    pub fn remaining_prep_ms(&self, order_id: &str, now_ms: i64) -> Option<i64> {
        let clock = self.prep_clocks.get(order_id)?;
        Some(clock.due_at_ms(0).saturating_sub(now_ms).max(0))
    }

    fn local_prediction(&self, key: &str) -> Option<TrackedOrder> {
        if !self.prep_clocks.get(key).is_some_and(|clock| clock.local) {
            return None;
        }
        let mut view = self.views.get(key)?.clone();
        view.predicted = true;
        Some(view)
    }

    fn canonical_key(&self, order: &Order) -> String {
        order
            .keys()
            .find(|key| {
                self.views.contains_key(*key)
                    || self.prep_clocks.contains_key(*key)
                    || self.ready_settled.contains(*key)
            })
            .unwrap_or(order.order_id.as_str())
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{confirmed_order, order_with_status};

    fn accepted(order_id: &str, prep_minutes: u32, accepted_at_ms: i64) -> AcceptedOrder {
        AcceptedOrder {
            order: confirmed_order(order_id),
            prep_minutes,
            accepted_at_ms,
        }
    }

    #[test]
    fn claims_auto_ready_once_after_prep_time_and_grace() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 15, 0));

        assert!(tracker.claim_due_for_ready(15 * 60_000).is_empty());
        assert_eq!(tracker.claim_due_for_ready(15 * 60_000 + 1_000), vec!["A1"]);
        assert!(tracker.claim_due_for_ready(15 * 60_000 + 3_000).is_empty());
    }

    #[test]
    fn successful_mark_ready_is_never_repeated() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 1, 0));

        let due = tracker.claim_due_for_ready(61_000);
        assert_eq!(tracker.finish_ready(&due[0], Ok(())), ReadyOutcome::Marked);
        assert_eq!(tracker.get("A1").map(|view| view.status), Some(OrderStatus::Ready));

        // The server has not caught up yet and still reports preparing.
        tracker.reconcile(&[order_with_status("A1", OrderStatus::Preparing)], 62_000);
        assert!(tracker.claim_due_for_ready(64_000).is_empty());
        assert!(tracker.claim_due_for_ready(120_000).is_empty());
    }

    #[test]
    fn incompatible_state_counts_as_success() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 1, 0));
        tracker.claim_due_for_ready(61_000);

        let outcome = tracker.finish_ready(
            "A1",
            Err(AppError::IncompatibleState {
                order_id: "A1".to_string(),
                message: "already ready".to_string(),
            }),
        );

        assert_eq!(outcome, ReadyOutcome::AlreadyAdvanced);
        assert!(tracker.is_ready_settled("A1"));
        assert!(tracker.claim_due_for_ready(63_000).is_empty());
    }

    #[test]
    fn local_acceptance_stays_preparing_while_server_reports_confirmed() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 15, 0));

        tracker.reconcile(&[confirmed_order("A1")], 10_000);
        let view = tracker.get("A1").expect("accepted order should stay tracked");
        assert_eq!(view.status, OrderStatus::Preparing);
        assert!(view.predicted);

        tracker.reconcile(&[], 20_000);
        assert_eq!(tracker.bucket(OrderStatus::Preparing).len(), 1);

        tracker.reconcile(&[confirmed_order("A1")], 900_000);
        assert_eq!(tracker.claim_due_for_ready(901_000), vec!["A1"]);
        assert_eq!(tracker.finish_ready("A1", Ok(())), ReadyOutcome::Marked);

        tracker.reconcile(&[confirmed_order("A1")], 910_000);
        assert_eq!(tracker.get("A1").map(|view| view.status), Some(OrderStatus::Ready));
        assert!(tracker.claim_due_for_ready(1_000_000).is_empty());
    }

    #[test]
    fn oscillating_snapshot_status_never_reissues_ready() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 1, 0));
        assert_eq!(tracker.claim_due_for_ready(61_000), vec!["A1"]);
        assert_eq!(tracker.finish_ready("A1", Ok(())), ReadyOutcome::Marked);

        tracker.reconcile(&[order_with_status("A1", OrderStatus::Ready)], 70_000);
        let mut lagging = order_with_status("A1", OrderStatus::Preparing);
        lagging.accepted_at_ms = Some(0);
        tracker.reconcile(&[lagging], 80_000);

        assert_eq!(tracker.get("A1").map(|view| view.status), Some(OrderStatus::Preparing));
        assert!(tracker.claim_due_for_ready(82_000).is_empty());
        assert!(tracker.claim_due_for_ready(600_000).is_empty());
    }

    #[test]
    fn server_side_ready_blocks_auto_ready_after_flip_back() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.reconcile(&[order_with_status("A1", OrderStatus::Ready)], 0);

        let mut lagging = order_with_status("A1", OrderStatus::Preparing);
        lagging.accepted_at_ms = Some(0);
        tracker.reconcile(&[lagging], 10_000);

        assert!(tracker.is_ready_settled("A1"));
        assert!(tracker.claim_due_for_ready(3_600_000).is_empty());
    }

    #[test]
    fn forgets_orders_that_leave_the_snapshot() {
        let mut tracker = OrderLifecycleTracker::default();
        let snapshot: Vec<Order> = (0..1_000)
            .map(|index| {
                let mut order = order_with_status(&format!("S{index}"), OrderStatus::Preparing);
                order.accepted_at_ms = Some(0);
                order
            })
            .collect();
        tracker.reconcile(&snapshot, 0);
        assert_eq!(tracker.claim_due_for_ready(3_600_000).len(), 1_000);

        tracker.handoff_preparing(&accepted("A1", 1, 0));
        tracker.claim_due_for_ready(61_000);
        tracker.finish_ready("A1", Ok(()));
        tracker.handoff_preparing(&accepted("A2", 30, 0));

        tracker.reconcile(&[], 70_000);

        assert!(tracker.remaining_prep_ms("S0", 70_000).is_none());
        assert!(tracker.remaining_prep_ms("S999", 70_000).is_none());
        assert!(tracker.remaining_prep_ms("A1", 70_000).is_none());
        assert!(!tracker.is_ready_settled("A1"));
        assert!(tracker.prep_clocks.len() == 1 && tracker.ready_in_progress.is_empty());
        assert!(tracker.ready_settled.is_empty());
        assert_eq!(tracker.remaining_prep_ms("A2", 70_000), Some(1_730_000));
        assert_eq!(tracker.get("A2").map(|view| view.status), Some(OrderStatus::Preparing));
    }

    #[test]
    fn generic_failure_releases_claim_for_a_later_tick() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 1, 0));
        tracker.claim_due_for_ready(61_000);

        let outcome = tracker.finish_ready(
            "A1",
            Err(AppError::Api {
                status: 500,
                message: "boom".to_string(),
            }),
        );

        assert_eq!(outcome, ReadyOutcome::WillRetry);
        assert_eq!(tracker.claim_due_for_ready(63_000), vec!["A1"]);
    }

    #[test]
    fn views_are_a_pure_function_of_the_latest_snapshot() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.reconcile(
            &[
                order_with_status("A1", OrderStatus::Preparing),
                order_with_status("A2", OrderStatus::Ready),
                order_with_status("A3", OrderStatus::OutForDelivery),
                confirmed_order("A4"),
            ],
            0,
        );
        assert_eq!(tracker.bucket(OrderStatus::Preparing).len(), 1);
        assert_eq!(tracker.bucket(OrderStatus::Ready).len(), 1);
        assert!(tracker.bucket(OrderStatus::Confirmed).is_empty());

        tracker.reconcile(
            &[
                order_with_status("A2", OrderStatus::OutForDelivery),
                order_with_status("A3", OrderStatus::Completed),
            ],
            10_000,
        );
        assert!(tracker.bucket(OrderStatus::Preparing).is_empty());
        assert!(tracker.bucket(OrderStatus::Ready).is_empty());
        assert_eq!(tracker.bucket(OrderStatus::OutForDelivery).len(), 1);
        assert_eq!(tracker.bucket(OrderStatus::Completed).len(), 1);
    }

    #[test]
    fn prep_clock_survives_snapshot_and_uses_local_acceptance_time() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 10, 5_000));

        let mut from_server = order_with_status("A1", OrderStatus::Preparing);
        from_server.accepted_at_ms = Some(1_000_000);
        from_server.estimated_prep_minutes = Some(30);
        tracker.reconcile(&[from_server], 6_000);

        let view = tracker.get("A1").expect("order should be tracked");
        assert_eq!(view.preparing_started_at_ms, Some(5_000));
        assert_eq!(view.prep_minutes, Some(10));
        assert_eq!(tracker.remaining_prep_ms("A1", 6_000), Some(599_000));
    }

    #[test]
    fn orders_first_seen_preparing_start_from_server_acceptance_time() {
        let mut tracker = OrderLifecycleTracker::default();
        let mut order = order_with_status("A1", OrderStatus::Preparing);
        order.accepted_at_ms = Some(0);
        order.estimated_prep_minutes = Some(5);

        tracker.reconcile(&[order], 60_000);

        assert_eq!(tracker.claim_due_for_ready(301_000), vec!["A1"]);
    }

    #[test]
    fn internal_id_resolves_to_tracked_order() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.handoff_preparing(&accepted("A1", 10, 0));

        let mut snapshot_order = order_with_status("ignored", OrderStatus::Preparing);
        snapshot_order.order_id = "mongo-1".to_string();
        snapshot_order.internal_id = Some("A1".to_string());
        tracker.reconcile(&[snapshot_order], 1_000);

        assert_eq!(tracker.bucket(OrderStatus::Preparing).len(), 1);
        assert_eq!(tracker.get("A1").and_then(|view| view.prep_minutes), Some(10));
    }

    #[test]
    fn forward_transitions_follow_lifecycle() {
        assert!(is_forward_transition(OrderStatus::Preparing, OrderStatus::Ready));
        assert!(is_forward_transition(OrderStatus::Ready, OrderStatus::Cancelled));
        assert!(!is_forward_transition(OrderStatus::OutForDelivery, OrderStatus::Cancelled));
        assert!(!is_forward_transition(OrderStatus::Completed, OrderStatus::Preparing));
    }

    #[test]
    fn bucket_counts_skip_confirmed() {
        let mut tracker = OrderLifecycleTracker::default();
        tracker.reconcile(&[order_with_status("A1", OrderStatus::Ready)], 0);

        let counts = tracker.bucket_counts();
        assert_eq!(counts.len(), 6);
        assert!(counts.contains(&(OrderStatus::Ready, 1)));
    }
}
