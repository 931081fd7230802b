//! Audit sink writing to the log and the store metrics

use std::sync::Arc;
use tracing::{debug, info, warn};

use varbridge_core::{AuditEvent, AuditSink, LockEvent};

use crate::metrics::StoreMetrics;

/// Log target of audit records
pub const AUDIT_TARGET: &str = "varbridge::audit";

/// Audit sink that emits one structured log record per event
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink {
    metrics: Arc<StoreMetrics>,
}

impl TracingAuditSink {
    /// Create a sink with its own counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink sharing existing counters
    pub fn with_metrics(metrics: Arc<StoreMetrics>) -> Self {
        Self { metrics }
    }

    /// Counters fed by this sink
    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }
}

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::AccessChecked {
                session_id,
                variable,
                caller,
                permission,
                granted,
                ..
            } => {
                self.metrics.record_access_check(*permission, *granted);
                if *granted {
                    debug!(target: AUDIT_TARGET, session = %session_id, variable = %variable, caller = %caller, permission = %permission, "access granted");
                } else {
                    warn!(target: AUDIT_TARGET, session = %session_id, variable = %variable, caller = %caller, permission = %permission, "access denied");
                }
            }
            AuditEvent::VariableRegistered { session_id, var_id, name, caller } => {
                self.metrics.record_registration();
                info!(target: AUDIT_TARGET, session = %session_id, var_id = %var_id, variable = %name, caller = %caller, "variable registered");
            }
            AuditEvent::VariableUpdated {
                session_id,
                var_id,
                name,
                version,
                caller,
            } => {
                self.metrics.record_update();
                debug!(target: AUDIT_TARGET, session = %session_id, var_id = %var_id, variable = %name, version, caller = %caller, "variable updated");
            }
            AuditEvent::VariableDeleted { session_id, var_id, name, caller } => {
                self.metrics.record_deletion();
                info!(target: AUDIT_TARGET, session = %session_id, var_id = %var_id, variable = %name, caller = %caller, "variable deleted");
            }
            AuditEvent::Lock { session_id, event: lock } => {
                self.metrics.record_lock_event(lock);
                match lock {
                    LockEvent::Reclaimed { var_id, optimizer_id, reason } => {
                        warn!(target: AUDIT_TARGET, session = %session_id, var_id = %var_id, optimizer = %optimizer_id, reason = ?reason, "lock reclaimed");
                    }
                    other => {
                        info!(target: AUDIT_TARGET, session = %session_id, var_id = %other.var_id(), event = other.event_type(), "lock event");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use varbridge_core::{Permission, ProcessHandle, ReclaimReason, SessionId, VariableId};

    #[test]
    fn test_events_feed_counters() {
        let sink = TracingAuditSink::new();
        let session_id = SessionId::from("s1");
        let var_id = VariableId("var_a".to_string());

        sink.record(AuditEvent::AccessChecked {
            session_id: session_id.clone(),
            var_id: var_id.clone(),
            variable: "lr".to_string(),
            caller: "worker".to_string(),
            permission: Permission::Write,
            granted: false,
        });
        sink.record(AuditEvent::Lock {
            session_id: session_id.clone(),
            event: LockEvent::Acquired {
                var_id: var_id.clone(),
                optimizer_id: "opt".to_string(),
                holder: ProcessHandle::from("opt-pid"),
            },
        });
        sink.record(AuditEvent::Lock {
            session_id,
            event: LockEvent::Reclaimed {
                var_id,
                optimizer_id: "opt".to_string(),
                reason: ReclaimReason::HolderDead,
            },
        });

        let snapshot = sink.metrics().snapshot();
        assert_eq!(snapshot.access_denied, 1);
        assert_eq!(snapshot.access_granted, 0);
        assert_eq!(snapshot.locks_acquired, 1);
        assert_eq!(snapshot.locks_reclaimed, 1);
    }
}
