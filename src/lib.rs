//! opsfleet: a master/worker fleet orchestrator.
//!
//! The master runs a [`gateway::ConnectionGateway`] that workers dial into
//! over a persistent TCP channel carrying JSON [`protocol::Envelope`]s.
//! Workers run a [`worker::ChannelClient`] wrapping an
//! [`executor::Executor`] that deploys, starts, stops and monitors service
//! instances. Placement decisions are made by the pure functions in
//! [`scheduler`].

pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use config::{MasterConfig, WorkerConfig};
pub use error::{FleetError, Result};
