//! Varbridge
//!
//! A session-scoped shared variable store: named, typed, versioned values
//! shared between an owning process and its consumers, with validated writes,
//! dependency ordering, change streams, access rules and optimization locks.
//!
//! ```no_run
//! use varbridge::prelude::*;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let service = varbridge::in_memory_service(StoreConfig::load()?)?;
//! let session = SessionId::from("experiment-1");
//! let owner = Caller::owner("orchestrator");
//!
//! service
//!     .register_variable(&session, &owner, "temperature", TypeTag::Float, serde_json::json!(0.7), Default::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tracing::info;

pub use varbridge_core as core;
pub use varbridge_monitoring as monitoring;
pub use varbridge_store as store;

pub use varbridge_core::{VarError, VarResult};

/// Commonly used types
pub mod prelude {
    pub use varbridge_core::{
        AccessRule, Caller, CallerKind, Constraints, DependencyKind, ListFilter, LockPolicy, ObserverOptions,
        Permission, ProgressReport, RegisterOptions, SessionContext, SessionId, StoreConfig, TypeTag, UpdateKind,
        VarError, VarResult, VariableService, VariableUpdate, VariableValue, WatchOptions,
    };
    pub use varbridge_store::InMemoryVariableService;
}

/// In-memory service auditing through the tracing sink
pub fn in_memory_service(config: varbridge_core::StoreConfig) -> VarResult<Arc<varbridge_store::InMemoryVariableService>> {
    let service = varbridge_store::InMemoryVariableService::builder()
        .config(config)
        .audit_sink(Arc::new(varbridge_monitoring::TracingAuditSink::new()))
        .build()?;
    info!("Varbridge in-memory service ready");
    Ok(Arc::new(service))
}

/// Initialize logging from the environment and build the in-memory service
pub fn init_from_env() -> anyhow::Result<Arc<varbridge_store::InMemoryVariableService>> {
    varbridge_monitoring::init_logging(&varbridge_core::MonitoringConfig::load())?;
    Ok(in_memory_service(varbridge_core::StoreConfig::load()?)?)
}
