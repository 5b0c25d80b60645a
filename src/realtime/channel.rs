use crate::clock::now_unix_ms;
use crate::error::AppError;
use crate::events::{EventBus, IntakeEvent};
use crate::realtime::endpoint::{ChannelEndpoint, DeploymentContext, DEFAULT_CHANNEL_PATH};
use crate::realtime::types::{
    encode_join_frame, parse_server_frame, ChannelEvent, ChannelStatusSnapshot, ConnectionState,
    InboundMessage, RoomKind,
};
use crate::realtime::ws::{InboundFrame, PushConnector, PushLink};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 5_000;
pub const DEFAULT_ERROR_LOG_WINDOW_MS: u64 = 10_000;
const CHANNEL_EVENT_CAPACITY: usize = 128;
const LINK_CLOSE_TIMEOUT_MS: u64 = 1_000;
const RECONNECT_JITTER_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub base_address: String,
    pub channel_path: String,
    pub deployment: DeploymentContext,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub error_log_window_ms: u64,
}

impl ChannelConfig {
    pub fn new(base_address: impl Into<String>, deployment: DeploymentContext) -> Self {
        Self {
            base_address: base_address.into(),
            channel_path: DEFAULT_CHANNEL_PATH.to_string(),
            deployment,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            error_log_window_ms: DEFAULT_ERROR_LOG_WINDOW_MS,
        }
    }
}

/// Caps transport error logging at one line per window. Suppressed lines are
/// counted and reported with the next line that gets through.
#[derive(Debug)]
pub struct ErrorLogThrottle {
    window: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl ErrorLogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// Returns the number of lines suppressed since the last allowed one, or
    /// `None` when this line must be dropped.
    pub fn allow(&mut self, now: Instant) -> Option<u64> {
        let inside_window = self
            .last_emit
            .map(|instant| now.saturating_duration_since(instant) < self.window)
            .unwrap_or(false);
        if inside_window {
            self.suppressed = self.suppressed.saturating_add(1);
            return None;
        }
        self.last_emit = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

pub fn reconnect_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base_ms = base_delay_ms.saturating_mul(1_u64 << exponent);
    let jitter_ms = now_unix_ms().unsigned_abs() % RECONNECT_JITTER_MS;
    Duration::from_millis(base_ms.saturating_add(jitter_ms).min(max_delay_ms))
}

struct ChannelHandle {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

struct ChannelRuntime {
    room_kind: RoomKind,
    room_id: String,
    websocket_url: Url,
    join_frame: String,
    config: ChannelConfig,
    connector: Arc<dyn PushConnector>,
    events: broadcast::Sender<ChannelEvent>,
    status_store: Arc<RwLock<ChannelStatusSnapshot>>,
    bus: EventBus,
    error_log: ErrorLogThrottle,
    cancel_token: CancellationToken,
}

enum LinkEnd {
    Cancelled,
    Dropped(String),
}

/// One logical subscription to a server-pushed room.
///
/// The endpoint is validated at construction; a failing endpoint leaves the
/// instance `Blocked` for good and nothing ever connects. `close()` is final:
/// reconnecting after it requires a new instance.
pub struct RealtimeChannel {
    room_kind: RoomKind,
    room_id: String,
    endpoint: Option<ChannelEndpoint>,
    config: ChannelConfig,
    connector: Arc<dyn PushConnector>,
    events: broadcast::Sender<ChannelEvent>,
    status_store: Arc<RwLock<ChannelStatusSnapshot>>,
    bus: EventBus,
    handle: Option<ChannelHandle>,
    closed: bool,
}

impl RealtimeChannel {
    pub fn new(
        room_kind: RoomKind,
        room_id: &str,
        config: ChannelConfig,
        connector: Arc<dyn PushConnector>,
        bus: EventBus,
    ) -> Result<Self, AppError> {
        let room_id = room_id.trim().to_string();
        if room_id.is_empty() {
            return Err(AppError::InvalidArgument(
                "a room id is required before opening the realtime channel".to_string(),
            ));
        }

        let (endpoint, initial_status) =
            match ChannelEndpoint::resolve(&config.base_address, &config.channel_path, &config.deployment)
            {
                Ok(endpoint) => (
                    Some(endpoint),
                    ChannelStatusSnapshot::disconnected(room_kind, room_id.clone(), None),
                ),
                Err(failure) => {
                    error!(
                        room_kind = room_kind.as_str(),
                        room_id = %room_id,
                        base_address = %config.base_address,
                        error = %failure,
                        "realtime channel blocked by endpoint validation"
                    );
                    let status = ChannelStatusSnapshot {
                        state: ConnectionState::Blocked,
                        room_kind,
                        room_id: room_id.clone(),
                        reconnect_attempt: 0,
                        reason: Some(failure.to_string()),
                    };
                    bus.publish(IntakeEvent::ChannelStatus(status.clone()));
                    (None, status)
                }
            };

        let (events, _) = broadcast::channel(CHANNEL_EVENT_CAPACITY);
        Ok(Self {
            room_kind,
            room_id,
            endpoint,
            config,
            connector,
            events,
            status_store: Arc::new(RwLock::new(initial_status)),
            bus,
            handle: None,
            closed: false,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn is_blocked(&self) -> bool {
        self.endpoint.is_none()
    }

    pub async fn status(&self) -> ChannelStatusSnapshot {
        self.status_store.read().await.clone()
    }

    /// Spawns the connection task. Starting twice is a no-op.
    pub fn start(&mut self) -> Result<(), AppError> {
        if self.closed {
            return Err(AppError::ChannelClosed);
        }
        let Some(endpoint) = self.endpoint.as_ref() else {
            return Err(AppError::ChannelBlocked(format!(
                "channel for {} {} failed endpoint validation",
                self.room_kind.as_str(),
                self.room_id
            )));
        };
        if self.handle.is_some() {
            return Ok(());
        }

        let cancellation_token = CancellationToken::new();
        let runtime = ChannelRuntime {
            room_kind: self.room_kind,
            room_id: self.room_id.clone(),
            websocket_url: endpoint.websocket_url(),
            join_frame: encode_join_frame(self.room_kind, &self.room_id)?,
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            events: self.events.clone(),
            status_store: Arc::clone(&self.status_store),
            bus: self.bus.clone(),
            error_log: ErrorLogThrottle::new(Duration::from_millis(
                self.config.error_log_window_ms,
            )),
            cancel_token: cancellation_token.clone(),
        };

        let join_handle = tokio::spawn(run_channel(runtime));
        self.handle = Some(ChannelHandle {
            cancellation_token,
            join_handle,
        });
        Ok(())
    }

    /// Tears the connection down. Idempotent; the instance stays unusable.
    pub async fn close(&mut self) {
        self.closed = true;
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancellation_token.cancel();
        }
    }
}

async fn run_channel(mut runtime: ChannelRuntime) {
    let mut reconnect_attempt = 0_u32;

    while !runtime.cancel_token.is_cancelled() {
        let (phase, reason) = if reconnect_attempt == 0 {
            (ConnectionState::Connecting, None)
        } else {
            (
                ConnectionState::Reconnecting,
                Some(format!("reconnect attempt {reconnect_attempt}")),
            )
        };
        runtime.publish_status(phase, reconnect_attempt, reason).await;

        let connect_timeout = Duration::from_millis(runtime.config.connect_timeout_ms);
        let connect = tokio::time::timeout(
            connect_timeout,
            runtime.connector.connect(&runtime.websocket_url),
        );
        let connected = tokio::select! {
            _ = runtime.cancel_token.cancelled() => break,
            result = connect => result,
        };

        let failure = match connected {
            Ok(Ok(mut link)) => {
                let joined = tokio::select! {
                    _ = runtime.cancel_token.cancelled() => None,
                    result = tokio::time::timeout(
                        connect_timeout,
                        link.send_text(runtime.join_frame.clone()),
                    ) => Some(result),
                };
                let Some(joined) = joined else {
                    close_link(link.as_mut()).await;
                    break;
                };

                match joined {
                    Ok(Ok(())) => {
                        reconnect_attempt = 0;
                        info!(
                            room_kind = runtime.room_kind.as_str(),
                            room_id = %runtime.room_id,
                            "realtime channel connected"
                        );
                        runtime
                            .publish_status(ConnectionState::Connected, 0, None)
                            .await;
                        runtime.emit(ChannelEvent::Connected);

                        let end = runtime.pump(link.as_mut()).await;
                        close_link(link.as_mut()).await;
                        match end {
                            LinkEnd::Cancelled => break,
                            LinkEnd::Dropped(reason) => {
                                runtime.emit(ChannelEvent::Disconnected {
                                    reason: reason.clone(),
                                });
                                runtime.log_transport_error("realtime channel dropped", &reason);
                                reason
                            }
                        }
                    }
                    Ok(Err(failure)) => {
                        let failure = failure.to_string();
                        runtime.log_transport_error("failed to join room", &failure);
                        close_link(link.as_mut()).await;
                        failure
                    }
                    Err(_) => {
                        let failure =
                            AppError::ConnectTimeout(runtime.config.connect_timeout_ms).to_string();
                        runtime.log_transport_error("failed to join room", &failure);
                        close_link(link.as_mut()).await;
                        failure
                    }
                }
            }
            Ok(Err(failure)) => {
                let failure = failure.to_string();
                runtime.log_transport_error("realtime connect error", &failure);
                failure
            }
            Err(_) => {
                let failure = AppError::ConnectTimeout(runtime.config.connect_timeout_ms).to_string();
                runtime.log_transport_error("realtime connect error", &failure);
                failure
            }
        };

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(
            reconnect_attempt,
            runtime.config.reconnect_base_delay_ms,
            runtime.config.reconnect_max_delay_ms,
        );
        runtime
            .publish_status(
                ConnectionState::Reconnecting,
                reconnect_attempt,
                Some(format!("{failure}, retrying in {} ms", delay.as_millis())),
            )
            .await;
        tokio::select! {
            _ = runtime.cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    runtime
        .publish_status(
            ConnectionState::Disconnected,
            0,
            Some("channel closed".to_string()),
        )
        .await;
    runtime.emit(ChannelEvent::Disconnected {
        reason: "channel closed".to_string(),
    });
}

async fn close_link(link: &mut dyn PushLink) {
    let _ = tokio::time::timeout(Duration::from_millis(LINK_CLOSE_TIMEOUT_MS), link.close()).await;
}

impl ChannelRuntime {
    async fn pump(&mut self, link: &mut dyn PushLink) -> LinkEnd {
        loop {
            let frame = tokio::select! {
                _ = self.cancel_token.cancelled() => return LinkEnd::Cancelled,
                frame = link.next_frame() => frame,
            };

            let mut payload = match frame {
                None => return LinkEnd::Dropped("transport ended".to_string()),
                Some(Err(failure)) => return LinkEnd::Dropped(failure.to_string()),
                Some(Ok(InboundFrame::Closed(reason))) => {
                    return LinkEnd::Dropped(
                        reason.unwrap_or_else(|| "server closed connection".to_string()),
                    )
                }
                Some(Ok(InboundFrame::Text(payload))) => payload,
            };

            match parse_server_frame(payload.as_mut_slice()) {
                Ok(Some(InboundMessage::JoinAck { room_id })) => {
                    debug!(
                        room_id = room_id.as_deref().unwrap_or(self.room_id.as_str()),
                        "room join acknowledged"
                    );
                }
                Ok(Some(InboundMessage::Event(event))) => self.emit(event),
                Ok(None) => {}
                Err(failure) => {
                    debug!(error = %failure, "ignoring undecodable realtime frame");
                }
            }
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn log_transport_error(&mut self, context: &str, reason: &str) {
        let Some(suppressed) = self.error_log.allow(Instant::now()) else {
            return;
        };
        warn!(
            room_kind = self.room_kind.as_str(),
            room_id = %self.room_id,
            suppressed,
            reason,
            "{context}"
        );
    }

    async fn publish_status(
        &self,
        state: ConnectionState,
        reconnect_attempt: u32,
        reason: Option<String>,
    ) {
        let snapshot = ChannelStatusSnapshot {
            state,
            room_kind: self.room_kind,
            room_id: self.room_id.clone(),
            reconnect_attempt,
            reason,
        };

        {
            let mut writable = self.status_store.write().await;
            *writable = snapshot.clone();
        }
        self.bus.publish(IntakeEvent::ChannelStatus(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::types::OrderStatus;
    use crate::realtime::endpoint::PageContext;
    use crate::testing::FakeConnector;

    fn config(base: &str) -> ChannelConfig {
        ChannelConfig::new(base, DeploymentContext::Development)
    }

    #[test]
    fn error_log_throttle_allows_one_line_per_window() {
        let mut throttle = ErrorLogThrottle::new(Duration::from_secs(10));
        let start = Instant::now();

        assert_eq!(throttle.allow(start), Some(0));
        assert_eq!(throttle.allow(start + Duration::from_secs(3)), None);
        assert_eq!(throttle.allow(start + Duration::from_secs(9)), None);
        assert_eq!(throttle.allow(start + Duration::from_secs(10)), Some(2));
    }

    #[test]
    fn reconnect_delay_grows_and_respects_ceiling() {
        let first = reconnect_delay(1, 1_000, 5_000);
        assert!(first >= Duration::from_millis(1_000) && first < Duration::from_millis(1_250));

        let third = reconnect_delay(3, 1_000, 5_000);
        assert!(third >= Duration::from_millis(4_000) && third <= Duration::from_millis(5_000));

        for attempt in 4..64 {
            assert!(reconnect_delay(attempt, 1_000, 5_000) <= Duration::from_millis(5_000));
        }
    }

    #[test]
    fn requires_room_id() {
        let result = RealtimeChannel::new(
            RoomKind::Restaurant,
            "  ",
            config("http://localhost:5000"),
            Arc::new(FakeConnector::default()),
            EventBus::default(),
        );
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_channel_never_connects() {
        let connector = Arc::new(FakeConnector::default());
        let deployment =
            DeploymentContext::Detect(PageContext::new("restaurants.example.com", true));
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            ChannelConfig::new("http://localhost:5000", deployment),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");

        assert!(channel.is_blocked());
        assert_eq!(channel.status().await.state, ConnectionState::Blocked);
        assert!(matches!(channel.start(), Err(AppError::ChannelBlocked(_))));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.connect_count(), 0);
        assert_eq!(channel.status().await.state, ConnectionState::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn joins_room_and_forwards_events() {
        let connector = Arc::new(FakeConnector::default());
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            config("http://localhost:5000"),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");
        let mut events = channel.subscribe();
        channel.start().expect("channel should start");

        let mut server = connector.accept().await;
        assert_eq!(
            server.recv_client_frame().await.as_deref(),
            Some(r#"{"event":"join","data":{"roomType":"restaurant","roomId":"r-1"}}"#)
        );
        assert_eq!(events.recv().await.ok(), Some(ChannelEvent::Connected));
        assert_eq!(channel.status().await.state, ConnectionState::Connected);

        server.send_server_frame(r#"{"event":"joinAck","data":{"roomId":"r-1"}}"#);
        server.send_server_frame(r#"{"event":"somethingNew","data":{}}"#);
        server.send_server_frame(
            r#"{"event":"orderStatusChanged","data":{"orderId":"A1","status":"cancelled"}}"#,
        );
        assert_eq!(
            events.recv().await.ok(),
            Some(ChannelEvent::OrderStatusChanged {
                order_id: "A1".to_string(),
                status: OrderStatus::Cancelled
            })
        );
        assert_eq!(
            connector.last_endpoint().map(|url| url.to_string()),
            Some("ws://localhost:5000/realtime".to_string())
        );

        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejoins_room_exactly_once_per_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            config("http://localhost:5000"),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");
        let mut events = channel.subscribe();
        channel.start().expect("channel should start");

        let mut first = connector.accept().await;
        assert!(first.recv_client_frame().await.is_some());
        assert_eq!(events.recv().await.ok(), Some(ChannelEvent::Connected));

        first.drop_transport();
        assert!(matches!(
            events.recv().await.ok(),
            Some(ChannelEvent::Disconnected { .. })
        ));

        let mut second = connector.accept().await;
        let rejoin = second.recv_client_frame().await.expect("join should be re-sent");
        assert!(rejoin.contains(r#""roomId":"r-1""#));
        assert_eq!(events.recv().await.ok(), Some(ChannelEvent::Connected));
        assert_eq!(first.client_frames_sent(), 1);
        assert_eq!(second.client_frames_sent(), 1);
        assert_eq!(connector.connect_count(), 2);

        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_failed_connects_with_backoff() {
        let connector = Arc::new(FakeConnector::default());
        connector.fail_next_connects(3);
        let mut channel = RealtimeChannel::new(
            RoomKind::DeliveryOrder,
            "o-9",
            config("https://api.example.com"),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");
        channel.start().expect("channel should start");

        let mut server = connector.accept().await;
        let join = server.recv_client_frame().await.expect("join should be sent");
        assert!(join.contains(r#""roomType":"delivery_order""#));
        assert_eq!(connector.connect_count(), 4);

        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out_and_backs_off_before_retrying() {
        let connector = Arc::new(FakeConnector::default());
        connector.hang_next_connects(1);
        let bus = EventBus::default();
        let mut bus_events = bus.subscribe();
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            config("http://localhost:5000"),
            connector.clone(),
            bus,
        )
        .expect("construction should succeed");
        let started = Instant::now();
        channel.start().expect("channel should start");

        let mut server = connector.accept().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS + 1_000));
        assert!(elapsed < Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS + 1_250));
        assert!(server.recv_client_frame().await.is_some());
        assert_eq!(connector.connect_count(), 2);

        let mut timeout_reported = false;
        while let Ok(event) = bus_events.try_recv() {
            if let IntakeEvent::ChannelStatus(status) = event {
                timeout_reported |= status
                    .reason
                    .as_deref()
                    .is_some_and(|reason| reason.starts_with("connect timed out after 20000 ms"));
            }
        }
        assert!(timeout_reported);

        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_join_write_times_out_and_reconnects() {
        let connector = Arc::new(FakeConnector::default());
        connector.stall_next_links(1);
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            config("http://localhost:5000"),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");
        let mut events = channel.subscribe();
        let started = Instant::now();
        channel.start().expect("channel should start");

        let stalled = connector.accept().await;
        let mut second = connector.accept().await;
        assert!(started.elapsed() >= Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS + 1_000));

        let join = second.recv_client_frame().await.expect("join should be sent");
        assert!(join.contains(r#""roomId":"r-1""#));
        assert_eq!(events.recv().await.ok(), Some(ChannelEvent::Connected));
        assert_eq!(stalled.client_frames_sent(), 0);
        assert_eq!(connector.connect_count(), 2);

        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_final() {
        let connector = Arc::new(FakeConnector::default());
        let mut channel = RealtimeChannel::new(
            RoomKind::Restaurant,
            "r-1",
            config("http://localhost:5000"),
            connector.clone(),
            EventBus::default(),
        )
        .expect("construction should succeed");
        channel.start().expect("channel should start");
        let _server = connector.accept().await;

        channel.close().await;
        channel.close().await;

        assert_eq!(channel.status().await.state, ConnectionState::Disconnected);
        assert!(matches!(channel.start(), Err(AppError::ChannelClosed)));
    }
}
