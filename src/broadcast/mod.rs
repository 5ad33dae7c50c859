//! Broadcast plane: hub fan-out and per-connection readers

pub mod hub;
pub mod reader;

pub use hub::{
    BroadcastHub, HubConfig, HubState, HubStats, OverflowPolicy, SubscriberHandle, SubscriberId,
    SubscriberStats,
};
pub use reader::StreamingReader;
