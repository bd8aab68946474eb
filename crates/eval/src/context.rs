//! What an expression or rule can see and change while it runs.
//!
//! [`ProcessingScope`] abstracts over "an item session" and "a test
//! session" so the evaluator and the rule interpreter are written once.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::EvalError;
use crate::expression::ItemSubset;
use crate::extension::ExtensionRegistry;
use crate::notification::{Notification, NotificationListener};
use crate::state::ItemSessionState;
use crate::types::{
    builtin_signature, AssessmentItem, AssessmentItemRef, CompletionStatus, Identifier,
    VariableDeclaration, VariableKind, VariableRef, Value, COMPLETION_STATUS, DURATION,
    NUM_ATTEMPTS,
};

// ──────────────────────────────────────────────
// Runtime
// ──────────────────────────────────────────────

/// Per-session mutable services: the seeded random source and the
/// notification listeners.
pub struct Runtime {
    rng: StdRng,
    listeners: Vec<Arc<dyn NotificationListener>>,
}

impl Runtime {
    /// Deterministic runtime; the same seed replays the same draws.
    pub fn seeded(seed: u64) -> Self {
        Runtime {
            rng: StdRng::seed_from_u64(seed),
            listeners: Vec::new(),
        }
    }

    pub fn from_entropy() -> Self {
        Runtime {
            rng: StdRng::from_entropy(),
            listeners: Vec::new(),
        }
    }

    /// Seeded when `seed` is given, otherwise from entropy.
    pub fn new(seed: Option<u64>) -> Self {
        seed.map_or_else(Runtime::from_entropy, Runtime::seeded)
    }

    pub fn with_listener(mut self, listener: Arc<dyn NotificationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn NotificationListener>) {
        self.listeners.push(listener);
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn notify(&self, notification: Notification) {
        if self.listeners.is_empty() {
            tracing::debug!(%notification, "unobserved notification");
        }
        for listener in &self.listeners {
            listener.on_notification(&notification);
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

// ──────────────────────────────────────────────
// Scopes
// ──────────────────────────────────────────────

/// One item of a test as seen by the aggregate expressions.
#[derive(Debug, Clone, Copy)]
pub struct ItemView<'a> {
    pub item_ref: &'a AssessmentItemRef,
    pub item: &'a AssessmentItem,
    pub state: &'a ItemSessionState,
}

/// Variables visible to a running expression or rule.
pub trait ProcessingScope {
    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration>;

    /// Current value of a variable.
    fn lookup(&self, reference: &VariableRef) -> Result<Value, EvalError>;

    /// Default value, including any override made by template processing.
    fn default_value(&self, identifier: &Identifier) -> Result<Value, EvalError>;

    /// Correct response, including any override made by template processing.
    fn correct_response(&self, identifier: &Identifier) -> Result<Value, EvalError>;

    /// Weight attached to the item a dotted reference points at.
    fn weight(&self, _reference: &VariableRef, _weight: &Identifier) -> Option<f64> {
        None
    }

    /// Items matching `subset`; `None` outside a test.
    fn items(&self, _subset: &ItemSubset) -> Option<Vec<ItemView<'_>>> {
        None
    }

    fn write(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError>;

    fn write_default(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError>;

    fn write_correct(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError>;
}

/// Everything the evaluator and rule interpreter need.
pub struct EvalContext<'a> {
    pub scope: &'a mut dyn ProcessingScope,
    pub runtime: &'a mut Runtime,
    pub extensions: &'a ExtensionRegistry,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        scope: &'a mut dyn ProcessingScope,
        runtime: &'a mut Runtime,
        extensions: &'a ExtensionRegistry,
    ) -> Self {
        EvalContext {
            scope,
            runtime,
            extensions,
        }
    }
}

fn unresolved(reference: impl fmt::Display) -> EvalError {
    EvalError::UnresolvedVariable {
        reference: reference.to_string(),
    }
}

/// Reads an item variable, built-ins included. `None` if undeclared.
pub fn read_item_variable(
    item: &AssessmentItem,
    state: &ItemSessionState,
    name: &str,
) -> Option<Value> {
    match name {
        DURATION => return Some(Value::float(state.duration())),
        NUM_ATTEMPTS => return Some(Value::integer(i64::from(state.num_attempts))),
        COMPLETION_STATUS => return Some(state.completion_status.to_value()),
        _ => {}
    }
    let declaration = item.declaration(name)?;
    let map = match declaration.kind {
        VariableKind::Template => &state.template_values,
        VariableKind::Response => &state.response_values,
        VariableKind::Outcome => &state.outcome_values,
    };
    Some(map.get(name).cloned().unwrap_or_default())
}

/// Effective default of an item variable.
pub fn item_default(
    item: &AssessmentItem,
    state: &ItemSessionState,
    name: &str,
) -> Option<Value> {
    let declaration = item.declaration(name)?;
    Some(
        state
            .overridden_defaults
            .get(name)
            .cloned()
            .unwrap_or_else(|| declaration.default_or_null()),
    )
}

/// Effective correct response of an item response variable.
pub fn item_correct_response(
    item: &AssessmentItem,
    state: &ItemSessionState,
    name: &str,
) -> Option<Value> {
    let declaration = item.declaration(name)?;
    if declaration.kind != VariableKind::Response {
        return None;
    }
    Some(
        state
            .overridden_correct_responses
            .get(name)
            .cloned()
            .or_else(|| declaration.correct_response().cloned())
            .unwrap_or_default(),
    )
}

/// Checks `value` against `declaration` and converts it for storage.
pub(crate) fn coerce_for(
    declaration: &VariableDeclaration,
    value: Value,
) -> Result<Value, EvalError> {
    let signature = declaration.signature();
    value
        .coerce_to(signature)
        .ok_or_else(|| EvalError::InvalidAssignment {
            identifier: declaration.identifier.to_string(),
            message: format!(
                "value {} does not fit declared {}",
                value, signature
            ),
        })
}

/// Variables of one item session.
pub struct ItemScope<'s> {
    pub item: &'s AssessmentItem,
    pub state: &'s mut ItemSessionState,
}

impl<'s> ItemScope<'s> {
    pub fn new(item: &'s AssessmentItem, state: &'s mut ItemSessionState) -> Self {
        ItemScope { item, state }
    }
}

impl ProcessingScope for ItemScope<'_> {
    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration> {
        self.item.declaration(identifier)
    }

    fn lookup(&self, reference: &VariableRef) -> Result<Value, EvalError> {
        if reference.is_dotted() {
            return Err(unresolved(reference));
        }
        read_item_variable(self.item, self.state, reference.variable.as_str())
            .ok_or_else(|| unresolved(reference))
    }

    fn default_value(&self, identifier: &Identifier) -> Result<Value, EvalError> {
        item_default(self.item, self.state, identifier.as_str())
            .ok_or_else(|| unresolved(identifier))
    }

    fn correct_response(&self, identifier: &Identifier) -> Result<Value, EvalError> {
        item_correct_response(self.item, self.state, identifier.as_str())
            .ok_or_else(|| unresolved(identifier))
    }

    fn write(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError> {
        if target.as_str() == COMPLETION_STATUS {
            let status = value
                .as_identifier()
                .and_then(|id| CompletionStatus::parse(id.as_str()))
                .ok_or_else(|| EvalError::InvalidAssignment {
                    identifier: target.to_string(),
                    message: format!("{} is not a completion status", value),
                })?;
            self.state.completion_status = status;
            return Ok(());
        }
        if builtin_signature(target.as_str()).is_some() {
            return Err(EvalError::InvalidAssignment {
                identifier: target.to_string(),
                message: "built-in variable is read-only".to_string(),
            });
        }
        let declaration = self
            .item
            .declaration(target.as_str())
            .ok_or_else(|| unresolved(target))?;
        let value = coerce_for(declaration, value)?;
        let map = match declaration.kind {
            VariableKind::Template => &mut self.state.template_values,
            VariableKind::Response => &mut self.state.response_values,
            VariableKind::Outcome => &mut self.state.outcome_values,
        };
        map.insert(target.clone(), value);
        Ok(())
    }

    fn write_default(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError> {
        let declaration = self
            .item
            .declaration(target.as_str())
            .ok_or_else(|| unresolved(target))?;
        let value = coerce_for(declaration, value)?;
        self.state
            .overridden_defaults
            .insert(target.clone(), value);
        Ok(())
    }

    fn write_correct(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError> {
        let declaration = self
            .item
            .declaration(target.as_str())
            .filter(|d| d.kind == VariableKind::Response)
            .ok_or_else(|| unresolved(target))?;
        let value = coerce_for(declaration, value)?;
        self.state
            .overridden_correct_responses
            .insert(target.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BaseType, Signature};

    fn item() -> AssessmentItem {
        AssessmentItem {
            identifier: Identifier::new("item"),
            title: String::new(),
            adaptive: false,
            time_dependent: false,
            declarations: vec![
                VariableDeclaration::new(
                    "SCORE",
                    VariableKind::Outcome,
                    Signature::single(BaseType::Float),
                )
                .with_default(Value::float(0.0)),
                VariableDeclaration::new(
                    "RESPONSE",
                    VariableKind::Response,
                    Signature::single(BaseType::Identifier),
                ),
            ],
            interactions: Vec::new(),
            template_processing: Vec::new(),
            response_processing: Vec::new(),
        }
    }

    #[test]
    fn writes_coerce_and_reject() {
        let item = item();
        let mut state = ItemSessionState::new();
        let mut scope = ItemScope::new(&item, &mut state);

        scope
            .write(&Identifier::new("SCORE"), Value::integer(2))
            .unwrap();
        assert_eq!(
            scope.lookup(&VariableRef::local("SCORE")).unwrap(),
            Value::float(2.0)
        );

        let err = scope
            .write(&Identifier::new("SCORE"), Value::string("x"))
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidAssignment { .. }));
        assert!(scope
            .write(&Identifier::new(NUM_ATTEMPTS), Value::integer(3))
            .is_err());
        assert!(matches!(
            scope.lookup(&VariableRef::local("MISSING")),
            Err(EvalError::UnresolvedVariable { .. })
        ));
    }

    #[test]
    fn completion_status_is_writable_by_identifier() {
        let item = item();
        let mut state = ItemSessionState::new();
        let mut scope = ItemScope::new(&item, &mut state);
        scope
            .write(
                &Identifier::new(COMPLETION_STATUS),
                Value::identifier("completed"),
            )
            .unwrap();
        assert_eq!(state.completion_status, CompletionStatus::Completed);
    }

    #[test]
    fn overridden_defaults_win() {
        let item = item();
        let mut state = ItemSessionState::new();
        let mut scope = ItemScope::new(&item, &mut state);
        let score = Identifier::new("SCORE");
        assert_eq!(scope.default_value(&score).unwrap(), Value::float(0.0));
        scope.write_default(&score, Value::float(5.0)).unwrap();
        assert_eq!(scope.default_value(&score).unwrap(), Value::float(5.0));
    }
}
