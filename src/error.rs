use crate::geo::GeolocationError;
use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("realtime channel blocked: {0}")]
    ChannelBlocked(String),
    #[error("realtime channel closed")]
    ChannelClosed,
    #[error("order intake has been shut down")]
    Stopped,
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("order service returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("order {order_id} is not in a compatible state: {message}")]
    IncompatibleState { order_id: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("geolocation error: {0}")]
    Geolocation(#[from] GeolocationError),
}

impl AppError {
    /// The server already holds the order in the target state (or one past it).
    pub fn is_incompatible_state(&self) -> bool {
        matches!(self, Self::IncompatibleState { .. })
    }

    /// Failures a poll treats as "no orders right now" instead of an error.
    pub fn is_benign_empty(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Reqwest(error) => error.is_connect() || error.is_timeout(),
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
