//! Monitoring for varbridge.
//!
//! Logging initialisation, the tracing-backed audit sink and store counters.

pub mod audit;
pub mod logging;
pub mod metrics;

pub use audit::{TracingAuditSink, AUDIT_TARGET};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use varbridge_core::MonitoringConfig;
