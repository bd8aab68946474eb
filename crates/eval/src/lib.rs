//! QTI processing engine: evaluates expressions and processing rules, and
//! drives item and test sessions through their lifecycles.
//!
//! Definitions arrive already parsed (JSON via serde). They are checked
//! once by [`ResolvedItem`] / [`ResolvedTest`]; controllers refuse
//! definitions whose validation report carries errors. Controllers borrow
//! the definition, the session state, the extension registry and a
//! [`Runtime`] (random source plus notification listeners), so a session
//! can be persisted by serializing its state alone.

pub mod context;
pub mod error;
pub mod evaluate;
pub mod expression;
pub mod extension;
pub mod item_session;
pub mod notification;
pub mod numeric;
pub mod plan;
pub mod response;
pub mod rules;
pub mod state;
pub mod test_session;
pub mod types;
pub mod validate;

pub use context::{EvalContext, ItemScope, ItemView, ProcessingScope, Runtime};
pub use error::{
    ConfigurationError, EngineError, EvalError, NavigationError, ParseError, StateError,
};
pub use evaluate::evaluate;
pub use expression::{Expression, ItemSubset};
pub use extension::{CustomOperator, CustomRule, ExtensionRegistry};
pub use item_session::{ItemPhase, ItemResult, ItemSessionController, ItemSessionSettings};
pub use notification::{
    Notification, NotificationLevel, NotificationListener, RecordingListener, TracingListener,
    ValidationReport,
};
pub use plan::{NodeKind, TestPlan, TestPlanNode, TestPlanNodeKey, TestPlanner};
pub use response::Correctness;
pub use rules::{run_rules, InterruptKind, ProcessingRule, RunOutcome};
pub use state::{
    ControlObjectState, ItemSessionState, SessionStatus, TestSessionState, Timing,
};
pub use test_session::{
    ControlPhase, LimitScope, Navigation, ResponseHandling, TestSessionController,
    TestSessionSettings, TimeLimitExceeded,
};
pub use types::{
    AssessmentItem, AssessmentTest, BaseType, Cardinality, Identifier, SingleValue, Value,
    VariableDeclaration, VariableRef,
};
pub use validate::{validate_item, ItemLookup, ItemResolver, ResolvedItem, ResolvedTest};
