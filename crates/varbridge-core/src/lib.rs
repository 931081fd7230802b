//!
//! Varbridge Core - domain model for session-scoped shared variables
//!
//! This crate defines the variable model, type validation, dependency
//! tracking, access rules and the operation surface shared by the
//! in-memory engine and consumer-side contexts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - variables, types, dependencies, access and events
pub mod domain;

/// Application services - operation table and consumer context
pub mod application;

/// Store configuration
pub mod config;

/// Error types
pub mod error;

pub use config::{MonitoringConfig, StoreConfig};
pub use error::{VarError, VarResult};

pub use domain::access::{
    AccessContext, AccessControl, AccessDecision, AccessRule, CallerGlob, DefaultAccess, Permission, SessionPattern,
};
pub use domain::collaborators::{
    AuditSink, FnCallback, LivenessMonitor, NoopAuditSink, NoopPropagator, ObserverCallback, PropagationRequest,
    Propagator, SessionStorage, UpdateFilter,
};
pub use domain::dependency::{DependencyEdge, DependencyGraph, DependencyKind};
pub use domain::events::{AuditEvent, LockEvent, ReclaimReason, UpdateKind, VariableUpdate};
pub use domain::optimization::{LockPolicy, OptimizationLock, ProgressReport};
pub use domain::snapshot::SessionSnapshot;
pub use domain::types::{TypeRegistry, TypeTag, VariableType};
pub use domain::value::{Constraints, VariableValue};
pub use domain::variable::{Caller, CallerKind, HistoryEntry, ProcessHandle, SessionId, Variable, VariableId};

pub use application::session_context::SessionContext;
pub use application::variable_service::{
    BatchResults, ListFilter, ObserverOptions, RegisterOptions, SubscriptionId, VariableService, VariableWatch,
    WatchOptions,
};
