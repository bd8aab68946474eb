//! Error kinds surfaced by the engine.
//!
//! Each concern has its own enum so callers can tell "the content is wrong"
//! from "the API was used wrong". [`EngineError`] wraps them all for the
//! controller entry points.

use crate::notification::Notification;
use crate::types::{BaseType, Cardinality};

/// Malformed literal text or identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid identifier '{text}'")]
    InvalidIdentifier { text: String },

    #[error("invalid variable reference '{text}'")]
    InvalidVariableRef { text: String },

    #[error("invalid {base_type} literal '{text}'")]
    InvalidLiteral { base_type: BaseType, text: String },

    #[error("unknown base type '{0}'")]
    UnknownBaseType(String),

    #[error("{cardinality} value cannot be built from {count} string(s)")]
    WrongValueCount {
        cardinality: Cardinality,
        count: usize,
    },

    #[error("{0} values have no string form")]
    NoStringForm(Cardinality),

    #[error("invalid test plan node key '{text}'")]
    InvalidNodeKey { text: String },
}

/// Runtime failure while evaluating an expression or running a rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for container of size {size}")]
    IndexOutOfRange { index: i64, size: usize },

    #[error("unresolved variable reference '{reference}'")]
    UnresolvedVariable { reference: String },

    #[error("type mismatch in {node}: {message}")]
    TypeMismatch { node: &'static str, message: String },

    #[error("{node} is only available in test outcome processing")]
    NotInTestContext { node: &'static str },

    #[error("no extension registered for class '{class}'")]
    UnknownExtension { class: String },

    #[error("extension '{class}' failed: {message}")]
    Extension { class: String, message: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("numeric overflow: {message}")]
    Overflow { message: String },

    #[error("{node} would build a container of more than {limit} values")]
    ContainerTooLarge { node: &'static str, limit: usize },

    #[error("tolerances must be positive, got {first} and {second}")]
    InvalidTolerance { first: f64, second: f64 },

    #[error("cannot assign to '{identifier}': {message}")]
    InvalidAssignment { identifier: String, message: String },
}

/// An operation was invoked in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("illegal transition: {operation} is not allowed while {phase}")]
    IllegalTransition {
        operation: &'static str,
        phase: String,
    },

    #[error("unknown test plan node '{key}'")]
    UnknownNode { key: String },

    #[error("comments are not allowed on item '{item}'")]
    CommentNotAllowed { item: String },
}

/// Candidate-driven navigation request that cannot be honoured.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NavigationError {
    #[error("invalid selection '{key}': {reason}")]
    InvalidSelection { key: String, reason: String },

    #[error("{operation} requires a {required} test part")]
    WrongNavigationMode {
        operation: &'static str,
        required: &'static str,
    },

    #[error("no test part is currently entered")]
    NoCurrentTestPart,

    #[error("no item is currently selected")]
    NoCurrentItem,

    #[error("test part cannot be ended: {reason}")]
    CannotEndTestPart { reason: String },

    #[error("item '{item}' may not be skipped")]
    CannotSkipItem { item: String },

    #[error("minimum time of {minimum}s for '{node}' not reached ({elapsed}s elapsed)")]
    MinimumTimeNotReached {
        node: String,
        minimum: f64,
        elapsed: f64,
    },
}

/// Content that is well-formed but cannot be run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("template constraints for item '{item}' still failing after {tries} tries")]
    TemplateConstraintExhausted { item: String, tries: u32 },

    #[error("item '{item_ref}' could not be resolved: {reason}")]
    UnresolvedItem { item_ref: String, reason: String },
}

/// Top-level error returned by the session controllers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("'{subject}' failed validation with {} error(s)", findings.len())]
    InvalidDefinition {
        subject: String,
        findings: Vec<Notification>,
    },
}

impl EngineError {
    /// True when the error was caused by the caller rather than the content.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, EngineError::State(_) | EngineError::Navigation(_))
    }
}
