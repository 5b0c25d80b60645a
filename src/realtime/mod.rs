pub mod channel;
pub mod endpoint;
pub mod types;
pub mod ws;

pub const JOIN_EVENT: &str = "join";
pub const JOIN_ACK_EVENT: &str = "joinAck";
pub const ORDER_CREATED_EVENT: &str = "orderCreated";
pub const ORDER_SOUND_CUE_EVENT: &str = "orderSoundCue";
pub const ORDER_STATUS_CHANGED_EVENT: &str = "orderStatusChanged";
