//! Pluggable variable types
//!
//! Every type implements [`VariableType`]. The [`TypeRegistry`] looks the
//! implementation up by [`TypeTag`] whenever a value is validated, so custom
//! types can be added at runtime.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::value::{Constraints, VariableValue};
use crate::error::{VarError, VarResult};

pub mod builtin;

pub use builtin::{BooleanType, ChoiceType, EmbeddingType, FloatType, IntegerType, StringType};

/// Type tag of a variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    /// 64-bit float; accepts integers by lossless widening
    Float,
    /// 64-bit signed integer
    Integer,
    /// UTF-8 string
    String,
    /// Boolean
    Boolean,
    /// One of the `choices` constraint
    Choice,
    /// Reference to a module, validated like a choice
    Module,
    /// Numeric vector with optional `dimensions`
    Embedding,
    /// Application-registered type
    Custom(String),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Float => f.write_str("float"),
            TypeTag::Integer => f.write_str("integer"),
            TypeTag::String => f.write_str("string"),
            TypeTag::Boolean => f.write_str("boolean"),
            TypeTag::Choice => f.write_str("choice"),
            TypeTag::Module => f.write_str("module"),
            TypeTag::Embedding => f.write_str("embedding"),
            TypeTag::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for TypeTag {
    type Err = VarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = match s {
            "float" => TypeTag::Float,
            "integer" => TypeTag::Integer,
            "string" => TypeTag::String,
            "boolean" => TypeTag::Boolean,
            "choice" => TypeTag::Choice,
            "module" => TypeTag::Module,
            "embedding" => TypeTag::Embedding,
            "" => return Err(VarError::UnknownType("<empty>".to_string())),
            other => TypeTag::Custom(other.to_string()),
        };
        Ok(tag)
    }
}

/// Capability contract every variable type implements
pub trait VariableType: Send + Sync {
    /// Tag this implementation serves
    fn tag(&self) -> TypeTag;

    /// Narrow a raw value to this type
    fn validate(&self, raw: &Json) -> VarResult<VariableValue>;

    /// Check an already-typed value against a constraint map
    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()>;

    /// Encode a value for the transport
    fn serialize(&self, value: &VariableValue) -> VarResult<Vec<u8>> {
        Ok(serde_json::to_vec(&value.to_json())?)
    }

    /// Decode a value produced by [`VariableType::serialize`]
    fn deserialize(&self, bytes: &[u8]) -> VarResult<VariableValue> {
        let raw: Json = serde_json::from_slice(bytes)?;
        self.validate(&raw)
    }

    /// Constraints applied when the caller supplies none for a key
    fn default_constraints(&self) -> Constraints {
        Constraints::default()
    }
}

/// Registry of type implementations keyed by tag
pub struct TypeRegistry {
    handlers: DashMap<TypeTag, Arc<dyn VariableType>>,
}

impl TypeRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// A registry with all built-in types
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(FloatType));
        registry.register(Arc::new(IntegerType));
        registry.register(Arc::new(StringType));
        registry.register(Arc::new(BooleanType));
        registry.register(Arc::new(ChoiceType::choice()));
        registry.register(Arc::new(ChoiceType::module()));
        registry.register(Arc::new(EmbeddingType));
        registry
    }

    /// Register (or replace) the implementation for its tag
    pub fn register(&self, handler: Arc<dyn VariableType>) -> Option<Arc<dyn VariableType>> {
        let tag = handler.tag();
        debug!("Registering variable type: {}", tag);
        self.handlers.insert(tag, handler)
    }

    /// Look up the implementation for a tag
    pub fn get(&self, tag: &TypeTag) -> VarResult<Arc<dyn VariableType>> {
        self.handlers
            .get(tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| VarError::UnknownType(tag.to_string()))
    }

    /// Whether a tag has an implementation
    pub fn contains(&self, tag: &TypeTag) -> bool {
        self.handlers.contains_key(tag)
    }

    /// All registered tags
    pub fn tags(&self) -> Vec<TypeTag> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Type defaults overlaid with the explicit constraints
    pub fn effective_constraints(&self, tag: &TypeTag, explicit: &Constraints) -> VarResult<Constraints> {
        let handler = self.get(tag)?;
        Ok(explicit.merged_over(&handler.default_constraints()))
    }

    /// Narrow `raw` to `tag` and check it against `constraints`
    pub fn validate(&self, tag: &TypeTag, raw: &Json, constraints: &Constraints) -> VarResult<VariableValue> {
        let handler = self.get(tag)?;
        let value = handler.validate(raw)?;
        handler.validate_constraints(&value, constraints)?;
        Ok(value)
    }

    /// Re-check an already typed value, as done on import
    pub fn revalidate(&self, tag: &TypeTag, value: &VariableValue, constraints: &Constraints) -> VarResult<VariableValue> {
        self.validate(tag, &value.to_json(), constraints)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
