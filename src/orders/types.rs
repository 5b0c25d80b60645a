use crate::error::AppError;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;

pub const MIN_PREP_MINUTES: u32 = 1;
pub const DEFAULT_PREP_MINUTES: u32 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 7] = [
        Self::Confirmed,
        Self::Preparing,
        Self::Ready,
        Self::OutForDelivery,
        Self::Delivered,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Accepts the snake_case wire names plus the kebab/space spellings older
    /// backends emit (`out-for-delivery`, `Out For Delivery`).
    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "confirmed" => Ok(Self::Confirmed),
            "preparing" => Ok(Self::Preparing),
            "ready" => Ok(Self::Ready),
            "out_for_delivery" => Ok(Self::OutForDelivery),
            "delivered" => Ok(Self::Delivered),
            "completed" => Ok(Self::Completed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(AppError::InvalidArgument(format!(
                "unknown order status '{raw}'"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CashOnDelivery,
    Prepaid,
    Unknown,
}

impl PaymentMethod {
    pub fn from_raw(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unknown;
        };
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Self::Unknown;
        }
        match normalized.as_str() {
            "cash" | "cod" | "cash on delivery" | "cash_on_delivery" => Self::CashOnDelivery,
            _ => Self::Prepaid,
        }
    }

    pub fn is_cod(self) -> bool {
        matches!(self, Self::CashOnDelivery)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub internal_id: Option<String>,
    pub status: OrderStatus,
    pub estimated_prep_minutes: Option<u32>,
    pub accepted_at_ms: Option<i64>,
    pub items: Vec<OwnedValue>,
    pub total: Option<f64>,
    pub payment_method: PaymentMethod,
}

impl Order {
    /// Every identifier the order may be referenced by. The server-assigned
    /// order id comes first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.order_id.as_str()).chain(self.internal_id.as_deref())
    }

    pub fn matches(&self, id: &str) -> bool {
        self.keys().any(|key| key == id)
    }

    pub fn prep_minutes_or_default(&self) -> u32 {
        self.estimated_prep_minutes
            .unwrap_or(DEFAULT_PREP_MINUTES)
            .max(MIN_PREP_MINUTES)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWire {
    #[serde(default, alias = "order_id")]
    pub order_id: Option<String>,
    #[serde(default, rename = "_id", alias = "id")]
    pub internal_id: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(
        default,
        alias = "estimated_prep_minutes",
        alias = "preparationTime",
        alias = "estimatedTime"
    )]
    pub estimated_prep_minutes: Option<u32>,
    #[serde(default, alias = "accepted_at")]
    pub accepted_at: Option<i64>,
    #[serde(default)]
    pub items: Vec<OwnedValue>,
    #[serde(default, alias = "totalAmount")]
    pub total: Option<f64>,
    #[serde(default, alias = "payment_method")]
    pub payment_method: Option<String>,
}

impl TryFrom<OrderWire> for Order {
    type Error = AppError;

    fn try_from(value: OrderWire) -> Result<Self, Self::Error> {
        let internal_id = value
            .internal_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let order_id = value
            .order_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .or_else(|| internal_id.clone())
            .ok_or_else(|| AppError::InvalidArgument("order without identifier".to_string()))?;
        let internal_id = internal_id.filter(|id| *id != order_id);

        Ok(Self {
            order_id,
            internal_id,
            status: OrderStatus::parse_str(&value.status)?,
            estimated_prep_minutes: value.estimated_prep_minutes,
            accepted_at_ms: value.accepted_at,
            items: value.items,
            total: value.total,
            payment_method: PaymentMethod::from_raw(value.payment_method.as_deref()),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OrderListWire {
    Bare(Vec<OrderWire>),
    Wrapped { orders: Vec<OrderWire> },
}

impl OrderListWire {
    pub fn into_inner(self) -> Vec<OrderWire> {
        match self {
            Self::Bare(orders) | Self::Wrapped { orders } => orders,
        }
    }
}

/// Decodes an order list, skipping entries that fail to convert so one bad
/// record cannot hide the rest of the snapshot.
pub fn parse_order_list_payload(payload: &mut [u8]) -> Result<Vec<Order>, AppError> {
    let wire: OrderListWire = simd_json::serde::from_slice(payload)?;
    let wire_orders = wire.into_inner();
    let mut orders = Vec::with_capacity(wire_orders.len());
    for entry in wire_orders {
        match Order::try_from(entry) {
            Ok(order) => orders.push(order),
            Err(error) => tracing::debug!(%error, "skipping undecodable order"),
        }
    }
    Ok(orders)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestaurantWire {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl TryFrom<RestaurantWire> for Restaurant {
    type Error = AppError;

    fn try_from(value: RestaurantWire) -> Result<Self, Self::Error> {
        let id = value.id.trim().to_string();
        if id.is_empty() {
            return Err(AppError::InvalidArgument(
                "restaurant id must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            id,
            name: value.name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    ItemsUnavailable,
    KitchenBusy,
    ClosingSoon,
    OutOfDeliveryArea,
    Other(String),
}

impl RejectReason {
    pub fn other(text: &str) -> Result<Self, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidArgument(
                "a rejection reason is required".to_string(),
            ));
        }
        Ok(Self::Other(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ItemsUnavailable => "Items unavailable",
            Self::KitchenBusy => "Kitchen too busy",
            Self::ClosingSoon => "Restaurant closing soon",
            Self::OutOfDeliveryArea => "Outside delivery area",
            Self::Other(text) => text,
        }
    }
}
