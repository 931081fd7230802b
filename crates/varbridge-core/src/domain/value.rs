//! Typed variable values and constraint maps
//!
//! Values travel over the boundary as raw JSON and are narrowed to a
//! [`VariableValue`] by the type registry. Constraints stay as JSON since
//! each type interprets its own keys.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{VarError, VarResult};

/// A validated variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    /// Boolean value
    Boolean(bool),
    /// Signed integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// String value (also used by choice and module types)
    String(String),
    /// Numeric vector (embedding type)
    Vector(Vec<f64>),
    /// Arbitrary JSON for custom types
    Json(Json),
}

impl VariableValue {
    /// Numeric view, widening integers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VariableValue::Float(f) => Some(*f),
            VariableValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Integer view
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VariableValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// String view
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariableValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean view
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VariableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Vector view
    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            VariableValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Name of the variant, used in validation messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            VariableValue::Boolean(_) => "boolean",
            VariableValue::Integer(_) => "integer",
            VariableValue::Float(_) => "float",
            VariableValue::String(_) => "string",
            VariableValue::Vector(_) => "vector",
            VariableValue::Json(_) => "json",
        }
    }

    /// Convert back to raw JSON
    pub fn to_json(&self) -> Json {
        match self {
            VariableValue::Boolean(b) => Json::Bool(*b),
            VariableValue::Integer(i) => Json::from(*i),
            VariableValue::Float(f) => Json::from(*f),
            VariableValue::String(s) => Json::String(s.clone()),
            VariableValue::Vector(v) => Json::Array(v.iter().map(|f| Json::from(*f)).collect()),
            VariableValue::Json(j) => j.clone(),
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Float(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Boolean(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::String(value)
    }
}

impl From<Vec<f64>> for VariableValue {
    fn from(value: Vec<f64>) -> Self {
        VariableValue::Vector(value)
    }
}

/// Constraint map attached to a variable (`min`, `max`, `step`, `choices`, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraints(BTreeMap<String, Json>);

impl Constraints {
    /// Empty constraint map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a constraint
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Json>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw constraint value
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    /// True when no constraints are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the constraints in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Json)> {
        self.0.iter()
    }

    /// Overlay `self` on top of `defaults`; keys in `self` win
    pub fn merged_over(&self, defaults: &Constraints) -> Constraints {
        let mut merged = defaults.0.clone();
        for (key, value) in &self.0 {
            merged.insert(key.clone(), value.clone());
        }
        Constraints(merged)
    }

    /// Numeric constraint, erroring when present but not a number
    pub fn number(&self, key: &str) -> VarResult<Option<f64>> {
        match self.0.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                VarError::ValidationFailed(format!("constraint '{}' must be numeric", key))
            }),
        }
    }

    /// Non-negative integer constraint
    pub fn count(&self, key: &str) -> VarResult<Option<usize>> {
        match self.0.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(value) => value.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
                VarError::ValidationFailed(format!(
                    "constraint '{}' must be a non-negative integer",
                    key
                ))
            }),
        }
    }

    /// String constraint
    pub fn text(&self, key: &str) -> VarResult<Option<&str>> {
        match self.0.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(value) => value.as_str().map(Some).ok_or_else(|| {
                VarError::ValidationFailed(format!("constraint '{}' must be a string", key))
            }),
        }
    }

    /// The `choices` list
    pub fn choices(&self) -> VarResult<Option<Vec<String>>> {
        match self.0.get("choices") {
            None | Some(Json::Null) => Ok(None),
            Some(Json::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        VarError::ValidationFailed(
                            "constraint 'choices' must contain only strings".to_string(),
                        )
                    })
                })
                .collect::<VarResult<Vec<_>>>()
                .map(Some),
            Some(_) => Err(VarError::ValidationFailed(
                "constraint 'choices' must be a list".to_string(),
            )),
        }
    }
}

impl FromIterator<(String, Json)> for Constraints {
    fn from_iter<I: IntoIterator<Item = (String, Json)>>(iter: I) -> Self {
        Constraints(iter.into_iter().collect())
    }
}
