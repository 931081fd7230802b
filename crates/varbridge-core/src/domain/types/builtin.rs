//! Built-in variable types

use regex::Regex;
use serde_json::Value as Json;

use super::{TypeTag, VariableType};
use crate::domain::value::{Constraints, VariableValue};
use crate::error::{VarError, VarResult};

/// Largest integer magnitude an f64 represents exactly
const MAX_EXACT_INTEGER: u64 = 1 << 53;

/// Relative tolerance used by `step` checks on floats
const STEP_TOLERANCE: f64 = 1e-9;

fn json_kind(raw: &Json) -> &'static str {
    match raw {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

fn mismatch(expected: &str, raw: &Json) -> VarError {
    VarError::ValidationFailed(format!("expected {}, got {}", expected, json_kind(raw)))
}

/// Widen a JSON number to f64, refusing integers that would lose precision
fn widen_number(raw: &Json) -> VarResult<f64> {
    let Json::Number(number) = raw else {
        return Err(mismatch("float", raw));
    };

    if let Some(i) = number.as_i64() {
        if i.unsigned_abs() > MAX_EXACT_INTEGER {
            return Err(VarError::ValidationFailed(format!(
                "integer {} cannot be widened to float without loss",
                i
            )));
        }
        return Ok(i as f64);
    }
    if let Some(u) = number.as_u64() {
        if u > MAX_EXACT_INTEGER {
            return Err(VarError::ValidationFailed(format!(
                "integer {} cannot be widened to float without loss",
                u
            )));
        }
        return Ok(u as f64);
    }
    match number.as_f64() {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(VarError::ValidationFailed("float must be finite".to_string())),
    }
}

/// Inclusive `min`/`max` and `step` checks shared by the numeric types
fn check_numeric_bounds(value: f64, constraints: &Constraints) -> VarResult<()> {
    let min = constraints.number("min")?;
    let max = constraints.number("max")?;

    if let (Some(min), Some(max)) = (min, max) {
        if min > max {
            return Err(VarError::ValidationFailed(format!(
                "constraint min {} is greater than max {}",
                min, max
            )));
        }
    }
    if let Some(min) = min {
        if value < min {
            return Err(VarError::ValidationFailed(format!(
                "value {} is below minimum {}",
                value, min
            )));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(VarError::ValidationFailed(format!(
                "value {} is above maximum {}",
                value, max
            )));
        }
    }
    if let Some(step) = constraints.number("step")? {
        if step <= 0.0 {
            return Err(VarError::ValidationFailed("constraint step must be positive".to_string()));
        }
        let steps = (value - min.unwrap_or(0.0)) / step;
        if (steps - steps.round()).abs() > STEP_TOLERANCE * steps.abs().max(1.0) {
            return Err(VarError::ValidationFailed(format!(
                "value {} is not a multiple of step {}",
                value, step
            )));
        }
    }
    Ok(())
}

/// `float` type
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatType;

impl VariableType for FloatType {
    fn tag(&self) -> TypeTag {
        TypeTag::Float
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        widen_number(raw).map(VariableValue::Float)
    }

    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()> {
        let number = value
            .as_f64()
            .ok_or_else(|| VarError::ValidationFailed(format!("expected float, got {}", value.kind_name())))?;
        check_numeric_bounds(number, constraints)
    }
}

/// `integer` type
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerType;

impl VariableType for IntegerType {
    fn tag(&self) -> TypeTag {
        TypeTag::Integer
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        match raw {
            Json::Number(number) => number
                .as_i64()
                .map(VariableValue::Integer)
                .ok_or_else(|| VarError::ValidationFailed(format!("{} is not a 64-bit integer", number))),
            other => Err(mismatch("integer", other)),
        }
    }

    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()> {
        let number = value
            .as_i64()
            .ok_or_else(|| VarError::ValidationFailed(format!("expected integer, got {}", value.kind_name())))?;
        check_numeric_bounds(number as f64, constraints)
    }
}

/// `string` type with optional `min_length`, `max_length` and `pattern`
#[derive(Debug, Clone, Copy, Default)]
pub struct StringType;

impl VariableType for StringType {
    fn tag(&self) -> TypeTag {
        TypeTag::String
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        match raw {
            Json::String(s) => Ok(VariableValue::String(s.clone())),
            other => Err(mismatch("string", other)),
        }
    }

    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()> {
        let text = value
            .as_str()
            .ok_or_else(|| VarError::ValidationFailed(format!("expected string, got {}", value.kind_name())))?;
        let length = text.chars().count();

        if let Some(min) = constraints.count("min_length")? {
            if length < min {
                return Err(VarError::ValidationFailed(format!(
                    "string length {} is below min_length {}",
                    length, min
                )));
            }
        }
        if let Some(max) = constraints.count("max_length")? {
            if length > max {
                return Err(VarError::ValidationFailed(format!(
                    "string length {} is above max_length {}",
                    length, max
                )));
            }
        }
        if let Some(pattern) = constraints.text("pattern")? {
            let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                VarError::ValidationFailed(format!("invalid pattern constraint: {}", e))
            })?;
            if !regex.is_match(text) {
                return Err(VarError::ValidationFailed(format!(
                    "'{}' does not match pattern '{}'",
                    text, pattern
                )));
            }
        }
        Ok(())
    }
}

/// `boolean` type
#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanType;

impl VariableType for BooleanType {
    fn tag(&self) -> TypeTag {
        TypeTag::Boolean
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        match raw {
            Json::Bool(b) => Ok(VariableValue::Boolean(*b)),
            other => Err(mismatch("boolean", other)),
        }
    }

    fn validate_constraints(&self, value: &VariableValue, _constraints: &Constraints) -> VarResult<()> {
        value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| VarError::ValidationFailed(format!("expected boolean, got {}", value.kind_name())))
    }
}

/// `choice` and `module` types: membership in the `choices` list, case-sensitive
#[derive(Debug, Clone)]
pub struct ChoiceType {
    tag: TypeTag,
}

impl ChoiceType {
    /// The `choice` type
    pub fn choice() -> Self {
        Self { tag: TypeTag::Choice }
    }

    /// The `module` type
    pub fn module() -> Self {
        Self { tag: TypeTag::Module }
    }
}

impl VariableType for ChoiceType {
    fn tag(&self) -> TypeTag {
        self.tag.clone()
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        match raw {
            Json::String(s) => Ok(VariableValue::String(s.clone())),
            other => Err(mismatch("string", other)),
        }
    }

    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()> {
        let selected = value
            .as_str()
            .ok_or_else(|| VarError::ValidationFailed(format!("expected string, got {}", value.kind_name())))?;
        let choices = constraints.choices()?.ok_or_else(|| {
            VarError::ValidationFailed(format!("{} type requires a 'choices' constraint", self.tag))
        })?;

        if choices.iter().any(|choice| choice == selected) {
            Ok(())
        } else {
            Err(VarError::ValidationFailed(format!(
                "'{}' is not one of {:?}",
                selected, choices
            )))
        }
    }
}

/// `embedding` type: numeric vector with optional exact `dimensions`
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingType;

impl VariableType for EmbeddingType {
    fn tag(&self) -> TypeTag {
        TypeTag::Embedding
    }

    fn validate(&self, raw: &Json) -> VarResult<VariableValue> {
        let Json::Array(items) = raw else {
            return Err(mismatch("array of numbers", raw));
        };
        items
            .iter()
            .map(widen_number)
            .collect::<VarResult<Vec<f64>>>()
            .map(VariableValue::Vector)
    }

    fn validate_constraints(&self, value: &VariableValue, constraints: &Constraints) -> VarResult<()> {
        let vector = value
            .as_vector()
            .ok_or_else(|| VarError::ValidationFailed(format!("expected vector, got {}", value.kind_name())))?;

        if let Some(dimensions) = constraints.count("dimensions")? {
            if vector.len() != dimensions {
                return Err(VarError::ValidationFailed(format!(
                    "embedding has {} dimensions, expected {}",
                    vector.len(),
                    dimensions
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bounded(min: f64, max: f64) -> Constraints {
        Constraints::new().with("min", min).with("max", max)
    }

    #[test]
    fn test_float_widens_integers() {
        assert_eq!(FloatType.validate(&json!(1)).unwrap(), VariableValue::Float(1.0));
        assert!(FloatType.validate(&json!(9_007_199_254_740_993_i64)).is_err());
        assert!(FloatType.validate(&json!("0.7")).is_err());
    }

    #[test]
    fn test_float_bounds_are_inclusive() {
        let constraints = bounded(0.0, 2.0);

        assert!(FloatType.validate_constraints(&VariableValue::Float(0.0), &constraints).is_ok());
        assert!(FloatType.validate_constraints(&VariableValue::Float(2.0), &constraints).is_ok());
        assert!(FloatType.validate_constraints(&VariableValue::Float(2.5), &constraints).is_err());
        assert!(FloatType.validate_constraints(&VariableValue::Float(-0.1), &constraints).is_err());
    }

    #[test]
    fn test_step_is_relative_to_min() {
        let constraints = bounded(1.0, 10.0).with("step", 0.5);

        assert!(FloatType.validate_constraints(&VariableValue::Float(2.5), &constraints).is_ok());
        assert!(FloatType.validate_constraints(&VariableValue::Float(2.6), &constraints).is_err());

        let int_constraints = Constraints::new().with("min", 10).with("step", 5);
        assert!(IntegerType.validate_constraints(&VariableValue::Integer(25), &int_constraints).is_ok());
        assert!(IntegerType.validate_constraints(&VariableValue::Integer(26), &int_constraints).is_err());
    }

    #[test]
    fn test_integer_rejects_fractions() {
        assert_eq!(IntegerType.validate(&json!(256)).unwrap(), VariableValue::Integer(256));
        assert!(IntegerType.validate(&json!(2.5)).is_err());
        assert!(IntegerType.validate(&json!(u64::MAX)).is_err());
    }

    #[test]
    fn test_choice_membership_is_case_sensitive() {
        let constraints = Constraints::new().with("choices", json!(["gpt-4", "claude-3"]));
        let choice = ChoiceType::choice();

        assert!(choice.validate_constraints(&"claude-3".into(), &constraints).is_ok());
        assert!(choice.validate_constraints(&"GPT-4".into(), &constraints).is_err());
        assert!(choice.validate_constraints(&"llama".into(), &constraints).is_err());
        assert!(choice.validate_constraints(&"gpt-4".into(), &Constraints::new()).is_err());
    }

    #[test]
    fn test_string_constraints() {
        let constraints = Constraints::new()
            .with("min_length", 2)
            .with("max_length", 5)
            .with("pattern", "[a-z]+");

        assert!(StringType.validate_constraints(&"abc".into(), &constraints).is_ok());
        assert!(StringType.validate_constraints(&"a".into(), &constraints).is_err());
        assert!(StringType.validate_constraints(&"abcdef".into(), &constraints).is_err());
        assert!(StringType.validate_constraints(&"ab1".into(), &constraints).is_err());
    }

    #[test]
    fn test_embedding_dimensions() {
        let constraints = Constraints::new().with("dimensions", 3);
        let value = EmbeddingType.validate(&json!([1, 0.5, -2])).unwrap();

        assert_eq!(value, VariableValue::Vector(vec![1.0, 0.5, -2.0]));
        assert!(EmbeddingType.validate_constraints(&value, &constraints).is_ok());
        assert!(EmbeddingType
            .validate_constraints(&VariableValue::Vector(vec![1.0]), &constraints)
            .is_err());
        assert!(EmbeddingType.validate(&json!([1, "x"])).is_err());
    }
}
