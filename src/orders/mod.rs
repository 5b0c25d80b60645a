pub mod api;
pub mod dedup;
pub mod intake;
pub mod lifecycle;
pub mod poll;
pub mod types;
