//! Value model and the static definitions the engine executes.
//!
//! Definitions (items, tests, declarations) are immutable once handed to a
//! controller. Runtime state lives in [`crate::state`].

pub mod declaration;
pub mod identifier;
pub mod item;
pub mod values;

pub use declaration::{
    builtin_signature, AreaMapEntry, AreaMapping, CompletionStatus, InterpolationTableEntry,
    LookupTable, MapEntry, Mapping, MatchTableEntry, OutcomeData, ResponseData, Shape,
    VariableDeclaration, VariableKind, COMPLETION_STATUS, DURATION, NUM_ATTEMPTS,
};
pub use identifier::{Identifier, VariableRef};
pub use item::{AssessmentItem, Choice, Interaction, InteractionKind};
pub use test::{
    AssessmentItemRef, AssessmentSection, AssessmentTest, BranchRule, BranchTarget,
    ItemSessionControl, NavigationMode, Ordering, SectionPart, Selection, SubmissionMode,
    TemplateDefault, TestPart, TimeLimits, Weight,
};
pub use values::{
    bag_contains, format_float, BaseType, Cardinality, IntOrIdentifier, Signature, SingleValue,
    Value,
};
