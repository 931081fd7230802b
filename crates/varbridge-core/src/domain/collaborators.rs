//! Interfaces to the collaborators the store depends on but does not own
//!
//! Implementations are injected when a store is constructed; the in-memory
//! engine ships a local liveness monitor and an in-memory session storage,
//! monitoring ships a tracing audit sink.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::events::{AuditEvent, VariableUpdate};
use super::snapshot::SessionSnapshot;
use super::value::VariableValue;
use super::variable::{ProcessHandle, SessionId, VariableId};
use crate::error::VarResult;

/// Receives access-check and mutation records
pub trait AuditSink: Send + Sync {
    /// Record one event; must not block
    fn record(&self, event: AuditEvent);
}

/// Audit sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Reports whether subscriber and lock-holder processes are still running
pub trait LivenessMonitor: Send + Sync {
    /// Whether the process is alive
    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Stream of handles as they terminate
    fn subscribe(&self) -> broadcast::Receiver<ProcessHandle>;
}

/// Dependents to recompute after a committed change
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationRequest {
    /// Session
    pub session_id: SessionId,
    /// Variable that changed
    pub changed: VariableId,
    /// Its new value
    pub value: VariableValue,
    /// Its new version
    pub version: u64,
    /// `changed` first, then every dependent in topological order
    pub order: Vec<VariableId>,
}

/// Recomputes dependent variables; the graph only supplies the order
#[async_trait]
pub trait Propagator: Send + Sync {
    /// Recompute the dependents listed in `request.order`
    async fn propagate(&self, request: PropagationRequest) -> VarResult<()>;
}

/// Propagator that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

#[async_trait]
impl Propagator for NoopPropagator {
    async fn propagate(&self, _request: PropagationRequest) -> VarResult<()> {
        Ok(())
    }
}

/// Receives notifications for an observed variable
#[async_trait]
pub trait ObserverCallback: Send + Sync {
    /// Handle one update; an error is logged and isolated to this observer
    async fn on_update(&self, update: VariableUpdate) -> VarResult<()>;
}

/// Callback backed by a closure
pub struct FnCallback<F> {
    f: F,
}

impl<F> FnCallback<F>
where
    F: Fn(VariableUpdate) -> VarResult<()> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ObserverCallback for FnCallback<F>
where
    F: Fn(VariableUpdate) -> VarResult<()> + Send + Sync,
{
    async fn on_update(&self, update: VariableUpdate) -> VarResult<()> {
        (self.f)(update)
    }
}

impl<F> fmt::Debug for FnCallback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCallback")
    }
}

/// Predicate over `(old, new)`; a `false` result suppresses the notification
pub type UpdateFilter = Arc<dyn Fn(&VariableValue, &VariableValue) -> bool + Send + Sync>;

/// Persists exported session snapshots
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Store a snapshot, replacing any previous one for the session
    async fn save(&self, snapshot: SessionSnapshot) -> VarResult<()>;

    /// Load the snapshot for a session
    async fn load(&self, session_id: &SessionId) -> VarResult<Option<SessionSnapshot>>;

    /// Delete the snapshot; returns whether one existed
    async fn delete(&self, session_id: &SessionId) -> VarResult<bool>;

    /// Sessions with a stored snapshot
    async fn list(&self) -> VarResult<Vec<SessionId>>;
}
