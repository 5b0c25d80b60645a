use crate::clock::WallClock;
use crate::config::IntakeConfig;
use crate::error::AppError;
use crate::events::{EventBus, IntakeEvent};
use crate::orders::api::OrderApi;
use crate::orders::intake::{
    AcceptedOrder, Admission, DecisionOutcome, DecisionWindow, NotificationSource,
    PendingNotification, TickOutcome,
};
use crate::orders::lifecycle::TrackedOrder;
use crate::orders::poll::PollFallback;
use crate::orders::types::{Order, OrderStatus, RejectReason, Restaurant};
use crate::realtime::channel::RealtimeChannel;
use crate::realtime::types::{ChannelEvent, ChannelStatusSnapshot, RoomKind};
use crate::realtime::ws::PushConnector;
use crate::state::{IntakeState, TaskHandle};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct IntakeRuntime {
    api: Arc<dyn OrderApi>,
    state: Arc<IntakeState>,
    clock: WallClock,
}

/// Wires the push channel, the poll fallback and the lifecycle tracker of one
/// restaurant into background tasks sharing a single liveness token.
pub struct IntakeCoordinator {
    runtime: IntakeRuntime,
    restaurant: Restaurant,
    channel: Mutex<RealtimeChannel>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl IntakeCoordinator {
    /// Resolves the restaurant room, opens the push channel and starts every
    /// interval. A blocked channel is not fatal: polling keeps orders flowing.
    pub async fn start(
        config: IntakeConfig,
        api: Arc<dyn OrderApi>,
        connector: Arc<dyn PushConnector>,
        bus: EventBus,
        clock: WallClock,
    ) -> Result<Self, AppError> {
        let restaurant = api.get_current_restaurant().await?;
        let state = Arc::new(IntakeState::new(&config, bus.clone()));
        let IntakeConfig {
            channel: channel_config,
            poll_interval_ms,
            status_poll_interval_ms,
            auto_ready_interval_ms,
            countdown_tick_ms,
            ..
        } = config;

        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            &restaurant.id,
            channel_config,
            connector,
            bus.clone(),
        )?;
        let push_events = channel.subscribe();
        match channel.start() {
            Ok(()) => {}
            Err(AppError::ChannelBlocked(reason)) => {
                warn!(%reason, "push channel unavailable, relying on order polling");
            }
            Err(error) => return Err(error),
        }

        let runtime = IntakeRuntime {
            api: Arc::clone(&api),
            state: Arc::clone(&state),
            clock,
        };
        let fallback = PollFallback::new(api, Arc::clone(&state.intake), bus);

        let tasks = vec![
            spawn_task("push-router", &state, {
                let runtime = runtime.clone();
                move |token| route_push_events(runtime, push_events, token)
            }),
            spawn_task("countdown", &state, {
                let runtime = runtime.clone();
                move |token| run_countdown(runtime, countdown_tick_ms, token)
            }),
            spawn_task("order-poll", &state, {
                let runtime = runtime.clone();
                move |token| run_order_poll(runtime, fallback, poll_interval_ms, token)
            }),
            spawn_task("status-poll", &state, {
                let runtime = runtime.clone();
                move |token| run_status_poll(runtime, status_poll_interval_ms, token)
            }),
            spawn_task("auto-ready", &state, {
                let runtime = runtime.clone();
                move |token| run_auto_ready(runtime, auto_ready_interval_ms, token)
            }),
        ];

        info!(restaurant_id = %restaurant.id, "order intake started");
        Ok(Self {
            runtime,
            restaurant,
            channel: Mutex::new(channel),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn restaurant(&self) -> &Restaurant {
        &self.restaurant
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntakeEvent> {
        self.runtime.state.bus.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.runtime.state.started_at.elapsed()
    }

    pub async fn channel_status(&self) -> ChannelStatusSnapshot {
        self.channel.lock().await.status().await
    }

    pub fn pending_window(&self) -> Option<DecisionWindow> {
        self.runtime.state.intake.lock().window().cloned()
    }

    pub fn tracked_order(&self, order_id: &str) -> Option<TrackedOrder> {
        self.runtime.state.lifecycle.lock().get(order_id).cloned()
    }

    pub fn bucket(&self, status: OrderStatus) -> Vec<TrackedOrder> {
        self.runtime
            .state
            .lifecycle
            .lock()
            .bucket(status)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn set_prep_minutes(&self, prep_minutes: u32) -> Result<u32, AppError> {
        self.ensure_live()?;
        self.runtime.state.intake.lock().set_prep_minutes(prep_minutes)
    }

    pub fn adjust_prep_minutes(&self, delta: i32) -> Result<u32, AppError> {
        self.ensure_live()?;
        self.runtime.state.intake.lock().adjust_prep_minutes(delta)
    }

    /// Accepts the pending order. On failure the window stays open for a retry.
    pub async fn accept(&self, prep_minutes: Option<u32>) -> Result<AcceptedOrder, AppError> {
        self.ensure_live()?;
        let request = self.runtime.state.intake.lock().begin_accept(prep_minutes)?;

        let result = self
            .runtime
            .api
            .accept_order(&request.order_id, request.prep_minutes)
            .await;
        if !self.runtime.state.is_live() {
            return Err(AppError::Stopped);
        }
        let result = settle_incompatible(&request.order_id, result);

        let finished = self.runtime.state.intake.lock().finish_accept(
            &request,
            result,
            self.runtime.clock.now_ms(),
        );
        match finished {
            Ok(accepted) => {
                self.runtime
                    .state
                    .lifecycle
                    .lock()
                    .handoff_preparing(&accepted);
                info!(
                    order_id = %request.order_id,
                    prep_minutes = request.prep_minutes,
                    "order accepted"
                );
                self.publish(IntakeEvent::Decided {
                    order_id: request.order_id.clone(),
                    outcome: DecisionOutcome::Accepted {
                        prep_minutes: request.prep_minutes,
                    },
                });
                self.publish(IntakeEvent::AlarmStopped);
                Ok(accepted)
            }
            Err(error) => {
                warn!(order_id = %request.order_id, %error, "accept failed");
                self.publish(IntakeEvent::DecisionFailed {
                    order_id: request.order_id,
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Rejects the pending order. `None` reuses the reason of a failed attempt.
    pub async fn reject(&self, reason: Option<RejectReason>) -> Result<Order, AppError> {
        self.ensure_live()?;
        let request = self.runtime.state.intake.lock().begin_reject(reason)?;

        let result = self
            .runtime
            .api
            .reject_order(&request.order_id, &request.reason)
            .await;
        if !self.runtime.state.is_live() {
            return Err(AppError::Stopped);
        }
        let result = settle_incompatible(&request.order_id, result);

        let finished = self
            .runtime
            .state
            .intake
            .lock()
            .finish_reject(&request, result);
        match finished {
            Ok(order) => {
                info!(
                    order_id = %request.order_id,
                    reason = request.reason.as_str(),
                    "order rejected"
                );
                self.publish(IntakeEvent::Decided {
                    order_id: request.order_id.clone(),
                    outcome: DecisionOutcome::Rejected {
                        reason: request.reason,
                    },
                });
                self.publish(IntakeEvent::AlarmStopped);
                Ok(order)
            }
            Err(error) => {
                warn!(order_id = %request.order_id, %error, "reject failed");
                self.publish(IntakeEvent::DecisionFailed {
                    order_id: request.order_id,
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    /// Mute only silences the alarm; deadlines and admission are untouched.
    pub fn toggle_mute(&self) -> bool {
        let (muted, was_active, is_active) = {
            let mut intake = self.runtime.state.intake.lock();
            let was_active = intake.alarm_active();
            let muted = intake.toggle_mute();
            (muted, was_active, intake.alarm_active())
        };
        self.publish_alarm_change(was_active, is_active);
        muted
    }

    pub fn set_muted(&self, muted: bool) {
        let (was_active, is_active) = {
            let mut intake = self.runtime.state.intake.lock();
            let was_active = intake.alarm_active();
            intake.set_muted(muted);
            (was_active, intake.alarm_active())
        };
        self.publish_alarm_change(was_active, is_active);
    }

    /// Cancels every interval, waits for the tasks and closes the channel.
    /// In-flight decision calls may still complete but no longer touch state.
    pub async fn shutdown(&self) {
        self.runtime.state.liveness.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.cancellation_token.cancel();
            if let Err(error) = task.join_handle.await {
                warn!(task = task.name, %error, "intake task ended abnormally");
            }
        }

        self.channel.lock().await.close().await;
        info!(restaurant_id = %self.restaurant.id, "order intake stopped");
    }

    fn ensure_live(&self) -> Result<(), AppError> {
        if self.runtime.state.is_live() {
            Ok(())
        } else {
            Err(AppError::Stopped)
        }
    }

    fn publish(&self, event: IntakeEvent) {
        self.runtime.state.bus.publish(event);
    }

    fn publish_alarm_change(&self, was_active: bool, is_active: bool) {
        match (was_active, is_active) {
            (true, false) => self.publish(IntakeEvent::AlarmStopped),
            (false, true) => self.publish(IntakeEvent::AlarmStarted),
            _ => {}
        }
    }
}

impl Drop for IntakeCoordinator {
    fn drop(&mut self) {
        self.runtime.state.liveness.cancel();
    }
}

fn spawn_task<F, Fut>(name: &'static str, state: &IntakeState, task: F) -> TaskHandle
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let cancellation_token = state.liveness.child_token();
    let join_handle = tokio::spawn(task(cancellation_token.clone()));
    TaskHandle {
        name,
        cancellation_token,
        join_handle,
    }
}

fn ticker(period_ms: u64) -> Interval {
    let mut ticker = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// The server already holds the order past the requested transition.
fn settle_incompatible(order_id: &str, result: Result<(), AppError>) -> Result<(), AppError> {
    match result {
        Err(error) if error.is_incompatible_state() => {
            info!(order_id, %error, "order already moved on, treating decision as applied");
            Ok(())
        }
        other => other,
    }
}

fn window_opened(window: &DecisionWindow) -> IntakeEvent {
    IntakeEvent::WindowOpened {
        order_id: window.order.order_id.clone(),
        source: window.source,
        deadline_ms: window.deadline_ms,
        prep_minutes: window.prep_minutes,
    }
}

impl IntakeRuntime {
    fn admit_push(&self, order: Order) {
        if !self.state.is_live() {
            return;
        }
        let order_id = order.order_id.clone();
        let (admission, opened) = {
            let mut intake = self.state.intake.lock();
            let admission = intake.offer(PendingNotification {
                order,
                received_at_ms: self.clock.now_ms(),
                source: NotificationSource::Push,
            });
            let opened = (admission == Admission::Opened)
                .then(|| intake.window().map(window_opened))
                .flatten();
            (admission, opened.map(|event| (event, intake.alarm_active())))
        };

        match opened {
            Some((event, alarm)) => {
                info!(order_id = %order_id, "new order pushed");
                self.state.bus.publish(event);
                if alarm {
                    self.state.bus.publish(IntakeEvent::AlarmStarted);
                }
            }
            None => debug!(order_id = %order_id, ?admission, "pushed order not opened"),
        }
    }

    async fn refresh_statuses(&self, liveness: &CancellationToken) {
        let snapshot = match self.api.get_orders().await {
            Ok(orders) => orders,
            Err(error) if error.is_benign_empty() => Vec::new(),
            Err(error) => {
                warn!(%error, "status poll failed, keeping previous views");
                return;
            }
        };
        if liveness.is_cancelled() {
            return;
        }

        let counts = {
            let mut lifecycle = self.state.lifecycle.lock();
            lifecycle.reconcile(&snapshot, self.clock.now_ms());
            lifecycle.bucket_counts()
        };
        self.state.bus.publish(IntakeEvent::BucketsRefreshed { counts });
    }
}

async fn route_push_events(
    runtime: IntakeRuntime,
    mut events: broadcast::Receiver<ChannelEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            received = events.recv() => received,
        };

        match received {
            Ok(ChannelEvent::OrderCreated(order)) => runtime.admit_push(order),
            Ok(ChannelEvent::OrderSoundCue) => runtime.state.bus.publish(IntakeEvent::SoundCue),
            Ok(ChannelEvent::OrderStatusChanged { order_id, status }) => {
                runtime
                    .state
                    .bus
                    .publish(IntakeEvent::OrderStatusChanged { order_id, status });
                runtime.state.status_refresh.notify_one();
            }
            Ok(ChannelEvent::Connected | ChannelEvent::Disconnected { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "push events dropped, polling will catch up");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_countdown(runtime: IntakeRuntime, tick_ms: u64, cancel_token: CancellationToken) {
    let mut ticker = ticker(tick_ms);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = runtime.state.intake.lock().tick(runtime.clock.now_ms());
        match outcome {
            TickOutcome::Idle => {}
            TickOutcome::Counting {
                order_id,
                remaining_ms,
            } => runtime.state.bus.publish(IntakeEvent::Countdown {
                order_id,
                remaining_secs: (remaining_ms + 999) / 1_000,
            }),
            TickOutcome::Expired { order_id, closed } => {
                info!(order_id = %order_id, closed, "decision window expired");
                runtime.state.bus.publish(IntakeEvent::Expired {
                    order_id: order_id.clone(),
                    closed,
                });
                runtime.state.bus.publish(IntakeEvent::AlarmStopped);
                if closed {
                    runtime.state.bus.publish(IntakeEvent::Decided {
                        order_id,
                        outcome: DecisionOutcome::Expired,
                    });
                }
            }
        }
    }
}

async fn run_order_poll(
    runtime: IntakeRuntime,
    fallback: PollFallback,
    interval_ms: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = ticker(interval_ms);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let clock = runtime.clock;
        match fallback.poll_once(|| clock.now_ms(), &cancel_token).await {
            Ok(Some(report)) => {
                if report.admitted.is_some() || report.deferred > 0 {
                    debug!(?report, "order poll");
                }
            }
            Ok(None) => break,
            Err(error) => warn!(%error, "order poll failed"),
        }
    }
}

async fn run_status_poll(runtime: IntakeRuntime, interval_ms: u64, cancel_token: CancellationToken) {
    let mut ticker = ticker(interval_ms);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
            _ = runtime.state.status_refresh.notified() => {}
        }
        runtime.refresh_statuses(&cancel_token).await;
    }
}

async fn run_auto_ready(runtime: IntakeRuntime, interval_ms: u64, cancel_token: CancellationToken) {
    let mut ticker = ticker(interval_ms);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let due = runtime
            .state
            .lifecycle
            .lock()
            .claim_due_for_ready(runtime.clock.now_ms());
        for order_id in due {
            let result = runtime.api.mark_order_ready(&order_id).await;
            if cancel_token.is_cancelled() {
                return;
            }
            let outcome = runtime
                .state
                .lifecycle
                .lock()
                .finish_ready(&order_id, result);
            info!(order_id = %order_id, ?outcome, "auto-ready");
            runtime
                .state
                .bus
                .publish(IntakeEvent::AutoReady { order_id, outcome });
        }
    }
}
