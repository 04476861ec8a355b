//! Mastermind Client - Cached metadata of the storage cluster
//!
//! This crate mirrors the datasets published by the remote mastermind
//! service (namespace states and settings, cached keys, storage remotes,
//! bad and fake groups) into local snapshot cells, keeps them refreshed
//! from a background thread and serves them to any number of readers.
//!
//! `Controller` is the entry point; the other modules are its parts.

pub mod cache;
pub mod callback;
pub mod collector;
pub mod controller;
pub mod dataset;
pub mod endpoint;
pub mod persist;
pub mod rpc;
pub mod scheduler;
pub mod staleness;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-exports
pub use cache::{Origin, Snapshot, SnapshotCache};
pub use collector::DatasetStatus;
pub use controller::{Controller, ControllerBuilder};
pub use dataset::{Dataset, DecodeContext, SettingsExtension};
pub use endpoint::EndpointPool;
pub use persist::{PersistedSnapshot, PersistenceStore};
pub use rpc::{Connector, RpcClient, Session};
pub use scheduler::SchedulerPhase;
pub use staleness::{Staleness, StalenessThresholds};
pub use transport::TcpConnector;
