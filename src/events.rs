//! In-process publish/subscribe bus. Components receive a clone of the bus at
//! construction instead of broadcasting through globals.

use crate::geo::LocationSample;
use crate::orders::intake::{DecisionOutcome, NotificationSource};
use crate::orders::lifecycle::ReadyOutcome;
use crate::orders::types::OrderStatus;
use crate::realtime::types::ChannelStatusSnapshot;
use tokio::sync::broadcast;

pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeEvent {
    ChannelStatus(ChannelStatusSnapshot),
    WindowOpened {
        order_id: String,
        source: NotificationSource,
        deadline_ms: i64,
        prep_minutes: u32,
    },
    Countdown {
        order_id: String,
        remaining_secs: i64,
    },
    Expired {
        order_id: String,
        closed: bool,
    },
    Decided {
        order_id: String,
        outcome: DecisionOutcome,
    },
    DecisionFailed {
        order_id: String,
        message: String,
    },
    AlarmStarted,
    AlarmStopped,
    SoundCue,
    OrderStatusChanged {
        order_id: String,
        status: OrderStatus,
    },
    AutoReady {
        order_id: String,
        outcome: ReadyOutcome,
    },
    BucketsRefreshed {
        counts: Vec<(OrderStatus, usize)>,
    },
    LocationReported(LocationSample),
    GeolocationFailed {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IntakeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntakeEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: IntakeEvent) {
        let _ = self.sender.send(event);
    }
}
