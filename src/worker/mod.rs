//! Worker agent: identity, metrics, the control channel and tunnels.

pub mod client;
pub mod collector;
pub mod identity;
pub mod tunnel;
pub mod wol;

pub use client::ChannelClient;
pub use collector::Collector;
