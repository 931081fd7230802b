//! In-memory session engine for varbridge
//!
//! Every session is served by one [`VariableStore`]: a single async writer
//! guarding the variable table and dependency graph, an atomically swapped
//! snapshot for readers, an [`ObserverManager`] for fan-out and an
//! [`OptimizerCoordinator`] for optimization locks. [`InMemoryVariableService`]
//! maps session ids to stores and implements the `VariableService` operation
//! table on top of them.

pub mod coordinator;
pub mod liveness;
pub mod observer;
pub mod service;
pub mod storage;
pub mod store;
mod watch;

pub use coordinator::OptimizerCoordinator;
pub use liveness::LocalLivenessMonitor;
pub use observer::{NotifyOutcome, ObserverManager};
pub use service::{InMemoryVariableService, InMemoryVariableServiceBuilder};
pub use storage::InMemorySessionStorage;
pub use store::{SessionView, StoreDeps, VariableStore};
