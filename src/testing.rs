//! In-memory fakes for the collaborator traits.

use crate::error::AppError;
use crate::geo::{GeolocationError, LocationSample, LocationSink, PositionSource, RawPosition, WatchOptions};
use crate::orders::api::OrderApi;
use crate::orders::types::{Order, OrderStatus, PaymentMethod, RejectReason, Restaurant};
use crate::realtime::ws::{InboundFrame, PushConnector, PushLink};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

pub fn order_with_status(order_id: &str, status: OrderStatus) -> Order {
    Order {
        order_id: order_id.to_string(),
        internal_id: None,
        status,
        estimated_prep_minutes: None,
        accepted_at_ms: None,
        items: Vec::new(),
        total: None,
        payment_method: PaymentMethod::Unknown,
    }
}

pub fn confirmed_order(order_id: &str) -> Order {
    order_with_status(order_id, OrderStatus::Confirmed)
}

/// Order service double. Mutating calls update the stored orders the way the
/// real service would, so later snapshots reflect them.
#[derive(Default)]
pub struct FakeOrderApi {
    orders: Mutex<Vec<Order>>,
    get_orders_failures: Mutex<VecDeque<AppError>>,
    accept_failures: Mutex<VecDeque<AppError>>,
    ready_failures: Mutex<VecDeque<AppError>>,
    get_orders_calls: AtomicUsize,
    accept_calls: Mutex<Vec<(String, u32)>>,
    reject_calls: Mutex<Vec<(String, RejectReason)>>,
    ready_calls: Mutex<Vec<String>>,
    accept_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeOrderApi {
    pub fn set_orders(&self, orders: Vec<Order>) {
        *self.orders.lock() = orders;
    }

    pub fn fail_next_get_orders(&self, error: AppError) {
        self.get_orders_failures.lock().push_back(error);
    }

    pub fn fail_next_accept(&self, error: AppError) {
        self.accept_failures.lock().push_back(error);
    }

    pub fn fail_next_mark_ready(&self, error: AppError) {
        self.ready_failures.lock().push_back(error);
    }

    /// Makes accept calls wait until the returned notify is signalled.
    pub fn hold_accepts(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.accept_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn get_orders_calls(&self) -> usize {
        self.get_orders_calls.load(Ordering::SeqCst)
    }

    pub fn accept_calls(&self) -> Vec<(String, u32)> {
        self.accept_calls.lock().clone()
    }

    pub fn reject_calls(&self) -> Vec<(String, RejectReason)> {
        self.reject_calls.lock().clone()
    }

    pub fn ready_calls(&self) -> Vec<String> {
        self.ready_calls.lock().clone()
    }

    fn move_order(&self, order_id: &str, status: OrderStatus) {
        let mut orders = self.orders.lock();
        if let Some(order) = orders.iter_mut().find(|order| order.matches(order_id)) {
            order.status = status;
        }
    }
}

#[async_trait]
impl OrderApi for FakeOrderApi {
    async fn get_orders(&self) -> Result<Vec<Order>, AppError> {
        self.get_orders_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.get_orders_failures.lock().pop_front() {
            return Err(error);
        }
        Ok(self.orders.lock().clone())
    }

    async fn accept_order(&self, order_id: &str, prep_minutes: u32) -> Result<(), AppError> {
        self.accept_calls
            .lock()
            .push((order_id.to_string(), prep_minutes));
        let gate = self.accept_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(error) = self.accept_failures.lock().pop_front() {
            return Err(error);
        }
        self.move_order(order_id, OrderStatus::Preparing);
        Ok(())
    }

    async fn reject_order(&self, order_id: &str, reason: &RejectReason) -> Result<(), AppError> {
        self.reject_calls
            .lock()
            .push((order_id.to_string(), reason.clone()));
        self.move_order(order_id, OrderStatus::Cancelled);
        Ok(())
    }

    async fn mark_order_ready(&self, order_id: &str) -> Result<(), AppError> {
        self.ready_calls.lock().push(order_id.to_string());
        if let Some(error) = self.ready_failures.lock().pop_front() {
            return Err(error);
        }
        self.move_order(order_id, OrderStatus::Ready);
        Ok(())
    }

    async fn get_current_restaurant(&self) -> Result<Restaurant, AppError> {
        Ok(Restaurant {
            id: "r-1".to_string(),
            name: Some("Test Kitchen".to_string()),
        })
    }
}

enum ServerCommand {
    Frame(String),
    Drop,
}

/// Server side of one fake transport connection.
pub struct FakeServerEnd {
    client_frames: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<ServerCommand>,
    sent: Arc<AtomicUsize>,
}

impl FakeServerEnd {
    pub async fn recv_client_frame(&mut self) -> Option<String> {
        self.client_frames.recv().await
    }

    pub fn send_server_frame(&self, frame: &str) {
        let _ = self.to_client.send(ServerCommand::Frame(frame.to_string()));
    }

    pub fn drop_transport(&self) {
        let _ = self.to_client.send(ServerCommand::Drop);
    }

    pub fn client_frames_sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

struct FakeLink {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<ServerCommand>,
    sent: Arc<AtomicUsize>,
    stall_writes: bool,
}

#[async_trait]
impl PushLink for FakeLink {
    async fn send_text(&mut self, payload: String) -> Result<(), AppError> {
        if self.stall_writes {
            std::future::pending::<()>().await;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.to_server
            .send(payload)
            .map_err(|_| AppError::ChannelClosed)
    }

    async fn next_frame(&mut self) -> Option<Result<InboundFrame, AppError>> {
        match self.from_server.recv().await? {
            ServerCommand::Frame(frame) => Some(Ok(InboundFrame::Text(frame.into_bytes()))),
            ServerCommand::Drop => None,
        }
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

pub struct FakeConnector {
    connects: AtomicUsize,
    failures_left: AtomicUsize,
    hangs_left: AtomicUsize,
    stalls_left: AtomicUsize,
    last_endpoint: Mutex<Option<Url>>,
    accepted_tx: mpsc::UnboundedSender<FakeServerEnd>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeServerEnd>>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Self {
            connects: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            hangs_left: AtomicUsize::new(0),
            stalls_left: AtomicUsize::new(0),
            last_endpoint: Mutex::new(None),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
        }
    }
}

impl FakeConnector {
    pub fn fail_next_connects(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// The next `count` connects never resolve.
    pub fn hang_next_connects(&self, count: usize) {
        self.hangs_left.store(count, Ordering::SeqCst);
    }

    /// The next `count` links accept the connection but never finish a write.
    pub fn stall_next_links(&self, count: usize) {
        self.stalls_left.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_endpoint(&self) -> Option<Url> {
        self.last_endpoint.lock().clone()
    }

    /// Waits for the next successful connection.
    pub async fn accept(&self) -> FakeServerEnd {
        self.accepted_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector should stay alive")
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn PushLink>, AppError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_endpoint.lock() = Some(endpoint.clone());

        if take_one(&self.hangs_left) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.failures_left) {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let (to_server, client_frames) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicUsize::new(0));
        let _ = self.accepted_tx.send(FakeServerEnd {
            client_frames,
            to_client,
            sent: Arc::clone(&sent),
        });
        Ok(Box::new(FakeLink {
            to_server,
            from_server,
            sent,
            stall_writes: take_one(&self.stalls_left),
        }))
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

type PositionResult = Result<RawPosition, GeolocationError>;

/// Position source fed by the test. Each `watch` replaces the feed.
#[derive(Default)]
pub struct ChannelPositionSource {
    feed: Mutex<Option<mpsc::UnboundedSender<PositionResult>>>,
    watches: AtomicUsize,
}

impl ChannelPositionSource {
    pub fn push(&self, position: PositionResult) {
        if let Some(feed) = self.feed.lock().as_ref() {
            let _ = feed.send(position);
        }
    }

    /// Ends the current watch stream.
    pub fn finish(&self) {
        self.feed.lock().take();
    }

    pub fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }
}

impl PositionSource for ChannelPositionSource {
    fn watch(&self, _options: WatchOptions) -> BoxStream<'static, PositionResult> {
        self.watches.fetch_add(1, Ordering::SeqCst);
        let (feed, receiver) = mpsc::unbounded_channel();
        *self.feed.lock() = Some(feed);
        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|position| (position, receiver))
        })
        .boxed()
    }
}

#[derive(Default)]
pub struct RecordingLocationSink {
    samples: Mutex<Vec<LocationSample>>,
    delivered: Notify,
}

impl RecordingLocationSink {
    pub fn samples(&self) -> Vec<LocationSample> {
        self.samples.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) {
        loop {
            if self.samples.lock().len() >= count {
                return;
            }
            self.delivered.notified().await;
        }
    }
}

#[async_trait]
impl LocationSink for RecordingLocationSink {
    async fn report(&self, sample: LocationSample) -> Result<(), AppError> {
        self.samples.lock().push(sample);
        self.delivered.notify_one();
        Ok(())
    }
}
