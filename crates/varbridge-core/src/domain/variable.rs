//! Variable aggregate and identity value objects

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use super::access::{AccessContext, AccessRule};
use super::types::TypeTag;
use super::value::{Constraints, VariableValue};

/// Value object: Session ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Value object: Variable ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub String);

/// Value object: handle of a process whose liveness is monitored
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessHandle(pub String);

impl VariableId {
    /// Generate a fresh, globally unique variable id
    pub fn generate() -> Self {
        VariableId(format!("var_{}", Uuid::new_v4().simple()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl From<&str> for ProcessHandle {
    fn from(value: &str) -> Self {
        ProcessHandle(value.to_string())
    }
}

/// Which side of the bridge a caller runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerKind {
    /// The controlling process that owns the session
    Owner,
    /// A worker attached over the remote boundary
    Consumer,
}

/// Identity of whoever issues an operation
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    /// Caller identity, matched against access rule patterns and lock owners
    pub id: String,
    /// Owner or consumer side
    pub kind: CallerKind,
    /// Process handle watched by the liveness monitor
    pub handle: ProcessHandle,
    /// Attributes matched against access rule conditions
    pub context: AccessContext,
}

impl Caller {
    /// An owner-side caller whose handle equals its id
    pub fn owner(id: impl Into<String>) -> Self {
        Self::new(id, CallerKind::Owner)
    }

    /// A consumer-side caller whose handle equals its id
    pub fn consumer(id: impl Into<String>) -> Self {
        Self::new(id, CallerKind::Consumer)
    }

    fn new(id: impl Into<String>, kind: CallerKind) -> Self {
        let id = id.into();
        Self {
            handle: ProcessHandle(id.clone()),
            id,
            kind,
            context: AccessContext::new(),
        }
    }

    /// Override the monitored process handle
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = ProcessHandle(handle.into());
        self
    }

    /// Add a context attribute for access rule conditions
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Aggregate: a named, typed, versioned variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Globally unique identifier
    pub id: VariableId,

    /// Name, unique within the session
    pub name: String,

    /// Declared type
    pub type_tag: TypeTag,

    /// Current value; always satisfies type and constraints
    pub value: VariableValue,

    /// Effective constraints (type defaults overlaid with explicit ones)
    pub constraints: Constraints,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,

    /// Optional human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Rejects every `set` when true
    pub read_only: bool,

    /// Incremented on every committed mutation; starts at 0
    pub version: u64,

    /// Caller id that registered the variable; bypasses access rules
    pub owner: String,

    /// Side of the bridge the variable was registered from
    pub created_by: CallerKind,

    /// Ordered access rules, first match governs
    #[serde(default)]
    pub access_rules: Vec<AccessRule>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl Variable {
    /// Copy of this variable carrying a new value and the next version
    pub fn next_version(&self, value: VariableValue) -> Variable {
        let mut next = self.clone();
        next.value = value;
        next.version += 1;
        next.updated_at = Utc::now();
        next
    }
}

/// One committed value in a variable's bounded history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Version the value was committed at
    pub version: u64,
    /// Committed value
    pub value: VariableValue,
    /// Metadata supplied with the update
    pub metadata: HashMap<String, String>,
    /// Side of the bridge that made the change
    pub source: CallerKind,
    /// Caller id that made the change
    pub changed_by: String,
    /// Commit time
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = VariableId::generate();
        let b = VariableId::generate();
        assert_ne!(a, b);
        assert!(a.0.starts_with("var_"));
    }

    #[test]
    fn test_caller_builders() {
        let caller = Caller::consumer("worker-1")
            .with_handle("pid-42")
            .with_context("region", "eu");

        assert_eq!(caller.kind, CallerKind::Consumer);
        assert_eq!(caller.handle, ProcessHandle("pid-42".to_string()));
        assert_eq!(caller.context.get("region"), Some(&serde_json::json!("eu")));
    }
}
