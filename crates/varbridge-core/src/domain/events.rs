use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::access::Permission;
use super::value::VariableValue;
use super::variable::{CallerKind, ProcessHandle, SessionId, Variable, VariableId};

/// What happened to a watched variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Current value sent when a watch starts with `include_initial`
    Initial,
    /// A committed `set`
    Updated,
    /// The variable was deleted
    Deleted,
}

/// Change notification delivered to observers and watch streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    /// Session the variable lives in
    pub session_id: SessionId,

    /// Variable id
    pub var_id: VariableId,

    /// Variable name
    pub name: String,

    /// Kind of change
    pub kind: UpdateKind,

    /// Value before the change; `None` for initial events
    pub old_value: Option<VariableValue>,

    /// Value after the change; `None` for deletions
    pub new_value: Option<VariableValue>,

    /// Version after the change
    pub version: u64,

    /// Metadata supplied with the write
    pub metadata: HashMap<String, String>,

    /// When the change was committed
    pub timestamp: DateTime<Utc>,

    /// Side of the bridge that made the change
    pub source: CallerKind,

    /// Caller id that made the change
    pub changed_by: String,
}

impl VariableUpdate {
    /// Initial event carrying the current value of a variable
    pub fn initial(session_id: SessionId, variable: &Variable) -> Self {
        Self {
            session_id,
            var_id: variable.id.clone(),
            name: variable.name.clone(),
            kind: UpdateKind::Initial,
            old_value: None,
            new_value: Some(variable.value.clone()),
            version: variable.version,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            source: variable.created_by,
            changed_by: variable.owner.clone(),
        }
    }

    /// Event type name used in logs and audit records
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            UpdateKind::Initial => "variable.initial",
            UpdateKind::Updated => "variable.updated",
            UpdateKind::Deleted => "variable.deleted",
        }
    }

    /// Whether filters and debounce are skipped for this event
    pub fn bypasses_filters(&self) -> bool {
        self.kind != UpdateKind::Updated
    }
}

/// Why a lock was taken away from its holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimReason {
    /// The liveness monitor reported the holder dead
    HolderDead,
    /// Held longer than the staleness timeout
    Stale,
    /// The variable was deleted
    VariableDeleted,
    /// The session was destroyed
    SessionClosed,
}

/// Optimization lock lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LockEvent {
    /// Lock granted
    Acquired {
        /// Locked variable
        var_id: VariableId,
        /// New holder's optimizer id
        optimizer_id: String,
        /// New holder's process handle
        holder: ProcessHandle,
    },
    /// Lock released by its holder
    Released {
        /// Unlocked variable
        var_id: VariableId,
        /// Previous holder's optimizer id
        optimizer_id: String,
    },
    /// Lock taken over by a `preempt` request
    Preempted {
        /// Locked variable
        var_id: VariableId,
        /// Optimizer that lost the lock
        optimizer_id: String,
        /// Optimizer that took it
        by: String,
    },
    /// Lock reclaimed without its holder's consent
    Reclaimed {
        /// Unlocked variable
        var_id: VariableId,
        /// Previous holder's optimizer id
        optimizer_id: String,
        /// Reason for reclaiming
        reason: ReclaimReason,
    },
}

impl LockEvent {
    /// Variable the event concerns
    pub fn var_id(&self) -> &VariableId {
        match self {
            LockEvent::Acquired { var_id, .. }
            | LockEvent::Released { var_id, .. }
            | LockEvent::Preempted { var_id, .. }
            | LockEvent::Reclaimed { var_id, .. } => var_id,
        }
    }

    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            LockEvent::Acquired { .. } => "lock.acquired",
            LockEvent::Released { .. } => "lock.released",
            LockEvent::Preempted { .. } => "lock.preempted",
            LockEvent::Reclaimed { .. } => "lock.reclaimed",
        }
    }
}

/// Record handed to the audit sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "audit", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An access check ran
    AccessChecked {
        /// Session
        session_id: SessionId,
        /// Variable id
        var_id: VariableId,
        /// Variable name
        variable: String,
        /// Caller id
        caller: String,
        /// Requested permission
        permission: Permission,
        /// Outcome
        granted: bool,
    },
    /// A variable was registered
    VariableRegistered {
        /// Session
        session_id: SessionId,
        /// Variable id
        var_id: VariableId,
        /// Variable name
        name: String,
        /// Caller id
        caller: String,
    },
    /// A value was committed
    VariableUpdated {
        /// Session
        session_id: SessionId,
        /// Variable id
        var_id: VariableId,
        /// Variable name
        name: String,
        /// Version after the commit
        version: u64,
        /// Caller id
        caller: String,
    },
    /// A variable was deleted
    VariableDeleted {
        /// Session
        session_id: SessionId,
        /// Variable id
        var_id: VariableId,
        /// Variable name
        name: String,
        /// Caller id
        caller: String,
    },
    /// An optimization lock changed hands
    Lock {
        /// Session
        session_id: SessionId,
        /// Lock event
        event: LockEvent,
    },
}

impl AuditEvent {
    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::AccessChecked { .. } => "access.checked",
            AuditEvent::VariableRegistered { .. } => "variable.registered",
            AuditEvent::VariableUpdated { .. } => "variable.updated",
            AuditEvent::VariableDeleted { .. } => "variable.deleted",
            AuditEvent::Lock { event, .. } => event.event_type(),
        }
    }

    /// Session the event belongs to
    pub fn session_id(&self) -> &SessionId {
        match self {
            AuditEvent::AccessChecked { session_id, .. }
            | AuditEvent::VariableRegistered { session_id, .. }
            | AuditEvent::VariableUpdated { session_id, .. }
            | AuditEvent::VariableDeleted { session_id, .. }
            | AuditEvent::Lock { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lock_audit_event_round_trip() {
        let event = AuditEvent::Lock {
            session_id: SessionId::from("s"),
            event: LockEvent::Reclaimed {
                var_id: VariableId("var_lr".to_string()),
                optimizer_id: "opt-a".to_string(),
                reason: ReclaimReason::HolderDead,
            },
        };

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["audit"], json!("lock"));
        assert_eq!(encoded["event"]["event"], json!("reclaimed"));

        let decoded: AuditEvent = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.event_type(), "lock.reclaimed");
    }

    #[test]
    fn test_access_audit_event_round_trip() {
        let event = AuditEvent::AccessChecked {
            session_id: SessionId::from("s"),
            var_id: VariableId("var_t".to_string()),
            variable: "temperature".to_string(),
            caller: "worker".to_string(),
            permission: Permission::Write,
            granted: false,
        };

        let decoded: AuditEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.session_id(), &SessionId::from("s"));
    }
}
