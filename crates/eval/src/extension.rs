//! Registry of custom operators and custom processing rules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::EvalError;
use crate::types::{Identifier, Signature, Value};

/// Implementation behind a `customOperator` expression.
pub trait CustomOperator: Send + Sync {
    /// Static result signature, when known up front.
    fn signature(&self) -> Option<Signature> {
        None
    }

    /// Evaluates the operator over already-evaluated arguments.
    fn evaluate(&self, args: &[Value]) -> Result<Value, EvalError>;
}

/// Implementation behind a custom processing rule.
///
/// The rule returns the assignments it wants made; the interpreter performs
/// them with the same checks as `setValue`.
pub trait CustomRule: Send + Sync {
    fn execute(&self, args: &[Value]) -> Result<Vec<(Identifier, Value)>, EvalError>;
}

/// Custom operators and rules keyed by class name.
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    operators: BTreeMap<String, Arc<dyn CustomOperator>>,
    rules: BTreeMap<String, Arc<dyn CustomRule>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_operator(
        &mut self,
        class: impl Into<String>,
        operator: impl CustomOperator + 'static,
    ) -> &mut Self {
        self.operators.insert(class.into(), Arc::new(operator));
        self
    }

    pub fn register_rule(
        &mut self,
        class: impl Into<String>,
        rule: impl CustomRule + 'static,
    ) -> &mut Self {
        self.rules.insert(class.into(), Arc::new(rule));
        self
    }

    pub fn operator(&self, class: &str) -> Option<&dyn CustomOperator> {
        self.operators.get(class).map(|o| o.as_ref())
    }

    pub fn rule(&self, class: &str) -> Option<&dyn CustomRule> {
        self.rules.get(class).map(|r| r.as_ref())
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("operators", &self.operators.keys().collect::<Vec<_>>())
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<F> CustomOperator for F
where
    F: Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync,
{
    fn evaluate(&self, args: &[Value]) -> Result<Value, EvalError> {
        self(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_register_as_operators() {
        let mut registry = ExtensionRegistry::new();
        registry.register_operator(
            "org.example.Double",
            |args: &[Value]| -> Result<Value, EvalError> {
                Ok(args
                    .first()
                    .and_then(Value::as_i64)
                    .map_or(Value::Null, |n| Value::integer(n * 2)))
            },
        );

        let op = registry.operator("org.example.Double").unwrap();
        assert_eq!(op.evaluate(&[Value::integer(21)]).unwrap(), Value::integer(42));
        assert!(registry.operator("org.example.Missing").is_none());
        assert!(format!("{:?}", registry).contains("org.example.Double"));
    }
}
