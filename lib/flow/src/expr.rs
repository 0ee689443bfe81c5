//! The expression-evaluator seam.
//!
//! Gateways, assignment rules, and delegations evaluate user-authored
//! expressions against process variables. The engine treats the evaluator
//! as a black box behind [`Evaluator`]; the default implementation covers
//! numeric and boolean expressions with fasteval.

use crate::error::ExprError;
use crate::process::Variables;
use serde_json::Value as JsonValue;

/// Evaluates user expressions against a variable map.
pub trait Evaluator: Send + Sync {
    /// Evaluates an expression.
    ///
    /// # Errors
    ///
    /// Returns an error on syntax problems, undefined variables, or
    /// evaluation failures.
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<JsonValue, ExprError>;

    /// Checks an expression parses, without evaluating it.
    ///
    /// # Errors
    ///
    /// Returns an error describing the syntax problem.
    fn validate_syntax(&self, expression: &str) -> Result<(), ExprError>;
}

/// Coerces an evaluation result to a boolean.
///
/// Booleans pass through; numbers are truthy when non-zero; strings are
/// truthy when non-empty. Everything else is an error.
///
/// # Errors
///
/// Returns [`ExprError::Coercion`] for arrays, objects, and null.
pub fn coerce_bool(value: &JsonValue) -> Result<bool, ExprError> {
    match value {
        JsonValue::Bool(b) => Ok(*b),
        JsonValue::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        JsonValue::String(s) => Ok(!s.is_empty()),
        other => Err(ExprError::Coercion {
            value: other.to_string(),
            wanted: "bool",
        }),
    }
}

/// Default evaluator backed by fasteval.
///
/// Numeric and boolean variables resolve directly; boolean results come
/// back as `1.0`/`0.0` and are coerced by the caller. String variables are
/// not resolvable in this implementation and surface as undefined.
#[derive(Debug, Default, Clone)]
pub struct FastevalEvaluator;

impl FastevalEvaluator {
    /// Creates the evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Evaluator for FastevalEvaluator {
    fn evaluate(&self, expression: &str, variables: &Variables) -> Result<JsonValue, ExprError> {
        let mut namespace = |name: &str, _args: Vec<f64>| -> Option<f64> {
            match variables.get(name) {
                Some(JsonValue::Number(n)) => n.as_f64(),
                Some(JsonValue::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
        };

        let result =
            fasteval::ez_eval(expression, &mut namespace).map_err(|e| match e {
                fasteval::Error::Undefined(name) => ExprError::UndefinedVariable { name },
                other => ExprError::Evaluation {
                    expression: expression.to_string(),
                    reason: format!("{other:?}"),
                },
            })?;

        serde_json::Number::from_f64(result)
            .map(JsonValue::Number)
            .ok_or_else(|| ExprError::Evaluation {
                expression: expression.to_string(),
                reason: "expression produced a non-finite number".to_string(),
            })
    }

    fn validate_syntax(&self, expression: &str) -> Result<(), ExprError> {
        let parser = fasteval::Parser::new();
        let mut slab = fasteval::Slab::new();
        parser
            .parse(expression, &mut slab.ps)
            .map(|_| ())
            .map_err(|e| ExprError::Syntax {
                expression: expression.to_string(),
                reason: format!("{e:?}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, JsonValue)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn numeric_comparison() {
        let evaluator = FastevalEvaluator::new();
        let variables = vars(&[("x", json!(5))]);

        let result = evaluator.evaluate("x > 10", &variables).unwrap();
        assert!(!coerce_bool(&result).unwrap());

        let result = evaluator.evaluate("x > 0", &variables).unwrap();
        assert!(coerce_bool(&result).unwrap());
    }

    #[test]
    fn boolean_variables_resolve() {
        let evaluator = FastevalEvaluator::new();
        let variables = vars(&[("approved", json!(true))]);

        let result = evaluator.evaluate("approved == 1", &variables).unwrap();
        assert!(coerce_bool(&result).unwrap());
    }

    #[test]
    fn arithmetic_result() {
        let evaluator = FastevalEvaluator::new();
        let variables = vars(&[("amount", json!(120)), ("rate", json!(0.5))]);

        let result = evaluator.evaluate("amount * rate", &variables).unwrap();
        assert_eq!(result, json!(60.0));
    }

    #[test]
    fn undefined_variable_surfaces() {
        let evaluator = FastevalEvaluator::new();
        let result = evaluator.evaluate("missing > 1", &Variables::new());
        assert!(matches!(result, Err(ExprError::UndefinedVariable { .. })));
    }

    #[test]
    fn syntax_validation() {
        let evaluator = FastevalEvaluator::new();
        assert!(evaluator.validate_syntax("x > 10 && y < 2").is_ok());
        assert!(evaluator.validate_syntax("x >").is_err());
    }

    #[test]
    fn coercion_rules() {
        assert!(coerce_bool(&json!(true)).unwrap());
        assert!(!coerce_bool(&json!(false)).unwrap());
        assert!(coerce_bool(&json!(1)).unwrap());
        assert!(!coerce_bool(&json!(0)).unwrap());
        assert!(coerce_bool(&json!("yes")).unwrap());
        assert!(!coerce_bool(&json!("")).unwrap());
        assert!(coerce_bool(&json!(null)).is_err());
        assert!(coerce_bool(&json!([1])).is_err());
    }
}
