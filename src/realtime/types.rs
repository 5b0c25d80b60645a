use crate::error::AppError;
use crate::orders::types::{Order, OrderStatus, OrderWire};
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;

use super::{
    JOIN_ACK_EVENT, JOIN_EVENT, ORDER_CREATED_EVENT, ORDER_SOUND_CUE_EVENT,
    ORDER_STATUS_CHANGED_EVENT,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Endpoint failed validation. Terminal for the instance.
    Blocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Restaurant,
    DeliveryOrder,
}

impl RoomKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restaurant => "restaurant",
            Self::DeliveryOrder => "delivery_order",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatusSnapshot {
    pub state: ConnectionState,
    pub room_kind: RoomKind,
    pub room_id: String,
    pub reconnect_attempt: u32,
    pub reason: Option<String>,
}

impl ChannelStatusSnapshot {
    pub fn disconnected(room_kind: RoomKind, room_id: String, reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            room_kind,
            room_id,
            reconnect_attempt: 0,
            reason,
        }
    }
}

/// Normalized events handed to channel subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    OrderCreated(Order),
    OrderSoundCue,
    OrderStatusChanged { order_id: String, status: OrderStatus },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    JoinAck { room_id: Option<String> },
    Event(ChannelEvent),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinPayload<'a> {
    room_type: &'a str,
    room_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ClientFrame<'a, T> {
    event: &'a str,
    data: T,
}

pub fn encode_join_frame(room_kind: RoomKind, room_id: &str) -> Result<String, AppError> {
    let frame = ClientFrame {
        event: JOIN_EVENT,
        data: JoinPayload {
            room_type: room_kind.as_str(),
            room_id,
        },
    };
    Ok(simd_json::serde::to_string(&frame)?)
}

#[derive(Debug, Deserialize)]
struct ServerFrameWire {
    event: String,
    #[serde(default)]
    data: Option<OwnedValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OrderCreatedWire {
    Wrapped { order: OrderWire },
    Bare(OrderWire),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatusChangedWire {
    #[serde(alias = "order_id", alias = "_id", alias = "id")]
    order_id: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinAckWire {
    #[serde(default, alias = "room")]
    room_id: Option<String>,
}

/// Decodes one server frame. Unknown event names decode to `Ok(None)` so a
/// newer server can add events without breaking older clients.
pub fn parse_server_frame(payload: &mut [u8]) -> Result<Option<InboundMessage>, AppError> {
    let frame: ServerFrameWire = simd_json::serde::from_slice(payload)?;

    let message = match frame.event.as_str() {
        ORDER_CREATED_EVENT => {
            let data = required_data(&frame.event, frame.data)?;
            let mut wire = match simd_json::serde::from_owned_value::<OrderCreatedWire>(data)? {
                OrderCreatedWire::Wrapped { order } | OrderCreatedWire::Bare(order) => order,
            };
            // New-order pushes omit the status on some backends; they are
            // only ever sent for freshly confirmed orders.
            if wire.status.trim().is_empty() {
                wire.status = OrderStatus::Confirmed.as_str().to_string();
            }
            InboundMessage::Event(ChannelEvent::OrderCreated(Order::try_from(wire)?))
        }
        ORDER_SOUND_CUE_EVENT => InboundMessage::Event(ChannelEvent::OrderSoundCue),
        ORDER_STATUS_CHANGED_EVENT => {
            let data = required_data(&frame.event, frame.data)?;
            let wire: OrderStatusChangedWire = simd_json::serde::from_owned_value(data)?;
            InboundMessage::Event(ChannelEvent::OrderStatusChanged {
                order_id: wire.order_id.trim().to_string(),
                status: OrderStatus::parse_str(&wire.status)?,
            })
        }
        JOIN_ACK_EVENT => {
            let ack = match frame.data {
                Some(data) => simd_json::serde::from_owned_value::<JoinAckWire>(data)
                    .unwrap_or_default(),
                None => JoinAckWire::default(),
            };
            InboundMessage::JoinAck {
                room_id: ack.room_id,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(message))
}

fn required_data(event: &str, data: Option<OwnedValue>) -> Result<OwnedValue, AppError> {
    data.ok_or_else(|| AppError::InvalidArgument(format!("'{event}' frame without data")))
}
