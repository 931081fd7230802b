use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::DependencyEdge;
use super::variable::{SessionId, Variable};
use crate::error::VarResult;

/// Full contents of a session, as produced by `export_state`.
///
/// Access rules travel inside each [`Variable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session the snapshot was taken from
    pub session_id: SessionId,
    /// Every variable, sorted by name
    pub variables: Vec<Variable>,
    /// Every dependency edge
    pub dependencies: Vec<DependencyEdge>,
    /// When the snapshot was taken
    pub exported_at: DateTime<Utc>,
}

impl SessionSnapshot {
    /// Encode as JSON
    pub fn to_json(&self) -> VarResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    pub fn from_json(raw: &str) -> VarResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
