//! Processing rule interpreter.
//!
//! Template, response and outcome processing are all ordered rule lists run
//! against a [`ProcessingScope`](crate::context::ProcessingScope). Rules run
//! strictly in order. Early exits are return values, never errors: an
//! interrupt unwinds every enclosing list and is reported as
//! [`RunOutcome::Interrupted`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::EvalContext;
use crate::error::EvalError;
use crate::evaluate::evaluate;
use crate::expression::Expression;
use crate::types::{Identifier, Value};

// ──────────────────────────────────────────────
// Rule tree
// ──────────────────────────────────────────────

/// Explicit early-exit rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitKind {
    ExitTemplate,
    ExitResponse,
    ExitTest,
}

/// Why a rule list stopped before its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterruptKind {
    ExitTemplate,
    ExitResponse,
    ExitTest,
    /// A `templateConstraint` did not hold.
    ConstraintFailure,
}

impl From<ExitKind> for InterruptKind {
    fn from(kind: ExitKind) -> Self {
        match kind {
            ExitKind::ExitTemplate => InterruptKind::ExitTemplate,
            ExitKind::ExitResponse => InterruptKind::ExitResponse,
            ExitKind::ExitTest => InterruptKind::ExitTest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Interrupted(InterruptKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionBranch {
    pub guard: Expression,
    #[serde(default)]
    pub rules: Vec<ProcessingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessingRule {
    SetValue {
        identifier: Identifier,
        expression: Expression,
    },
    /// Template processing only: replaces a variable's default.
    SetDefaultValue {
        identifier: Identifier,
        expression: Expression,
    },
    /// Template processing only: replaces a response's correct value.
    SetCorrectResponse {
        identifier: Identifier,
        expression: Expression,
    },
    LookupOutcomeValue {
        identifier: Identifier,
        expression: Expression,
    },
    /// `responseIf`/`outcomeIf`/`templateIf` followed by `…ElseIf` branches
    /// and an optional `…Else`.
    Condition {
        branches: Vec<ConditionBranch>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<ProcessingRule>>,
    },
    ExitEarly(ExitKind),
    TemplateConstraint(Expression),
    Custom {
        class: String,
        #[serde(default)]
        expressions: Vec<Expression>,
    },
}

impl ProcessingRule {
    pub fn set_value(identifier: &str, expression: Expression) -> Self {
        ProcessingRule::SetValue {
            identifier: Identifier::new(identifier),
            expression,
        }
    }

    /// A single-branch condition with an optional else.
    pub fn when(
        guard: Expression,
        rules: Vec<ProcessingRule>,
        otherwise: Option<Vec<ProcessingRule>>,
    ) -> Self {
        ProcessingRule::Condition {
            branches: vec![ConditionBranch { guard, rules }],
            otherwise,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessingRule::SetValue { .. } => "setValue",
            ProcessingRule::SetDefaultValue { .. } => "setDefaultValue",
            ProcessingRule::SetCorrectResponse { .. } => "setCorrectResponse",
            ProcessingRule::LookupOutcomeValue { .. } => "lookupOutcomeValue",
            ProcessingRule::Condition { .. } => "condition",
            ProcessingRule::ExitEarly(ExitKind::ExitTemplate) => "exitTemplate",
            ProcessingRule::ExitEarly(ExitKind::ExitResponse) => "exitResponse",
            ProcessingRule::ExitEarly(ExitKind::ExitTest) => "exitTest",
            ProcessingRule::TemplateConstraint(_) => "templateConstraint",
            ProcessingRule::Custom { .. } => "customRule",
        }
    }

    /// Variable written by this rule, if any.
    pub fn target(&self) -> Option<&Identifier> {
        match self {
            ProcessingRule::SetValue { identifier, .. }
            | ProcessingRule::SetDefaultValue { identifier, .. }
            | ProcessingRule::SetCorrectResponse { identifier, .. }
            | ProcessingRule::LookupOutcomeValue { identifier, .. } => Some(identifier),
            _ => None,
        }
    }

    /// Expressions owned directly by this rule (not by nested rules).
    pub fn expressions(&self) -> Vec<&Expression> {
        match self {
            ProcessingRule::SetValue { expression, .. }
            | ProcessingRule::SetDefaultValue { expression, .. }
            | ProcessingRule::SetCorrectResponse { expression, .. }
            | ProcessingRule::LookupOutcomeValue { expression, .. }
            | ProcessingRule::TemplateConstraint(expression) => vec![expression],
            ProcessingRule::Condition { branches, .. } => {
                branches.iter().map(|b| &b.guard).collect()
            }
            ProcessingRule::Custom { expressions, .. } => expressions.iter().collect(),
            ProcessingRule::ExitEarly(_) => Vec::new(),
        }
    }

    /// Nested rule lists.
    pub fn nested(&self) -> Vec<&[ProcessingRule]> {
        match self {
            ProcessingRule::Condition {
                branches,
                otherwise,
            } => branches
                .iter()
                .map(|b| b.rules.as_slice())
                .chain(otherwise.as_deref())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Calls `f` on this rule and every nested rule, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a ProcessingRule)) {
        f(self);
        for list in self.nested() {
            for rule in list {
                rule.walk(f);
            }
        }
    }
}

// ──────────────────────────────────────────────
// Phases
// ──────────────────────────────────────────────

/// The three kinds of processing; each allows a different set of rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingPhase {
    Template,
    Response,
    Outcome,
}

impl ProcessingPhase {
    /// Whether `rule` may appear in this phase. Nested rules are checked
    /// separately.
    pub fn allows(self, rule: &ProcessingRule) -> bool {
        use ProcessingPhase as P;
        use ProcessingRule as R;
        match rule {
            R::SetValue { .. } | R::Condition { .. } | R::Custom { .. } => true,
            R::SetDefaultValue { .. } | R::SetCorrectResponse { .. } => self == P::Template,
            R::TemplateConstraint(_) => self == P::Template,
            R::LookupOutcomeValue { .. } => self != P::Template,
            R::ExitEarly(kind) => matches!(
                (self, kind),
                (P::Template, ExitKind::ExitTemplate)
                    | (P::Response, ExitKind::ExitResponse)
                    | (P::Outcome, ExitKind::ExitTest)
            ),
        }
    }
}

impl fmt::Display for ProcessingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessingPhase::Template => "template processing",
            ProcessingPhase::Response => "response processing",
            ProcessingPhase::Outcome => "outcome processing",
        })
    }
}

// ──────────────────────────────────────────────
// Interpreter
// ──────────────────────────────────────────────

/// Runs `rules` in order against `ctx`.
pub fn run_rules(
    rules: &[ProcessingRule],
    ctx: &mut EvalContext<'_>,
) -> Result<RunOutcome, EvalError> {
    for rule in rules {
        if let RunOutcome::Interrupted(kind) = run_rule(rule, ctx)? {
            tracing::debug!(rule = rule.name(), ?kind, "rule list interrupted");
            return Ok(RunOutcome::Interrupted(kind));
        }
    }
    Ok(RunOutcome::Completed)
}

fn run_rule(rule: &ProcessingRule, ctx: &mut EvalContext<'_>) -> Result<RunOutcome, EvalError> {
    match rule {
        ProcessingRule::SetValue {
            identifier,
            expression,
        } => {
            let value = evaluate(expression, ctx)?;
            tracing::trace!(%identifier, %value, "setValue");
            ctx.scope.write(identifier, value)?;
        }
        ProcessingRule::SetDefaultValue {
            identifier,
            expression,
        } => {
            let value = evaluate(expression, ctx)?;
            ctx.scope.write_default(identifier, value)?;
        }
        ProcessingRule::SetCorrectResponse {
            identifier,
            expression,
        } => {
            let value = evaluate(expression, ctx)?;
            ctx.scope.write_correct(identifier, value)?;
        }
        ProcessingRule::LookupOutcomeValue {
            identifier,
            expression,
        } => {
            let source = evaluate(expression, ctx)?;
            let table = ctx
                .scope
                .declaration(identifier.as_str())
                .and_then(|d| d.lookup_table())
                .ok_or_else(|| EvalError::InvalidAssignment {
                    identifier: identifier.to_string(),
                    message: "outcome has no lookup table".to_string(),
                })?;
            let value = table.lookup(&source);
            ctx.scope.write(identifier, value)?;
        }
        ProcessingRule::Condition {
            branches,
            otherwise,
        } => {
            for branch in branches {
                let guard = evaluate(&branch.guard, ctx)?;
                if is_true(&guard) {
                    return run_rules(&branch.rules, ctx);
                }
            }
            if let Some(rules) = otherwise {
                return run_rules(rules, ctx);
            }
        }
        ProcessingRule::ExitEarly(kind) => {
            return Ok(RunOutcome::Interrupted((*kind).into()));
        }
        ProcessingRule::TemplateConstraint(expression) => {
            let holds = evaluate(expression, ctx)?;
            if !is_true(&holds) {
                return Ok(RunOutcome::Interrupted(InterruptKind::ConstraintFailure));
            }
        }
        ProcessingRule::Custom { class, expressions } => {
            let args = expressions
                .iter()
                .map(|e| evaluate(e, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let custom = ctx
                .extensions
                .rule(class)
                .ok_or_else(|| EvalError::UnknownExtension {
                    class: class.clone(),
                })?;
            for (target, value) in custom.execute(&args)? {
                ctx.scope.write(&target, value)?;
            }
        }
    }
    Ok(RunOutcome::Completed)
}

/// Only a single boolean `true` selects a branch.
fn is_true(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ItemScope, Runtime};
    use crate::extension::{CustomRule, ExtensionRegistry};
    use crate::state::ItemSessionState;
    use crate::types::{AssessmentItem, VariableRef};
    use serde_json::json;

    fn item(rules: serde_json::Value) -> AssessmentItem {
        serde_json::from_value(json!({
            "identifier": "rules",
            "declarations": [
                {"identifier": "SCORE", "kind": "outcome", "cardinality": "single",
                 "baseType": "float", "defaultValue": {"single": {"float": 0.0}}},
                {"identifier": "GRADE", "kind": "outcome", "cardinality": "single",
                 "baseType": "identifier",
                 "outcome": {"lookupTable": {"match": {
                    "defaultValue": {"identifier": "F"},
                    "entries": [
                        {"sourceValue": 1, "targetValue": {"identifier": "A"}}
                    ]}}}},
                {"identifier": "RESPONSE", "kind": "response", "cardinality": "single",
                 "baseType": "identifier"}
            ],
            "responseProcessing": rules
        }))
        .unwrap()
    }

    fn run(
        item: &AssessmentItem,
        state: &mut ItemSessionState,
        registry: &ExtensionRegistry,
    ) -> Result<RunOutcome, EvalError> {
        let mut scope = ItemScope::new(item, state);
        let mut runtime = Runtime::seeded(7);
        let mut ctx = EvalContext::new(&mut scope, &mut runtime, registry);
        run_rules(&item.response_processing, &mut ctx)
    }

    fn score(state: &ItemSessionState) -> Value {
        state
            .outcome_values
            .get("SCORE")
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn set_value_reads_its_own_previous_value() {
        let item = item(json!([
            {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 1.5}}}},
            {"setValue": {"identifier": "SCORE", "expression": {"sum": [
                {"variable": {"identifier": "SCORE"}},
                {"baseValue": {"integer": 1}}
            ]}}}
        ]));
        let mut state = ItemSessionState::new();
        let outcome = run(&item, &mut state, &ExtensionRegistry::new()).unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(score(&state), Value::float(2.5));
    }

    #[test]
    fn first_true_branch_wins_and_null_guards_fall_through() {
        let item = item(json!([
            {"condition": {
                "branches": [
                    {"guard": {"null": null}, "rules": [
                        {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 9.0}}}}
                    ]},
                    {"guard": {"baseValue": {"boolean": true}}, "rules": [
                        {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 1.0}}}}
                    ]},
                    {"guard": {"baseValue": {"boolean": true}}, "rules": [
                        {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 2.0}}}}
                    ]}
                ],
                "otherwise": [
                    {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 3.0}}}}
                ]
            }}
        ]));
        let mut state = ItemSessionState::new();
        run(&item, &mut state, &ExtensionRegistry::new()).unwrap();
        assert_eq!(score(&state), Value::float(1.0));
    }

    #[test]
    fn exit_unwinds_nested_lists() {
        let item = item(json!([
            {"condition": {"branches": [
                {"guard": {"baseValue": {"boolean": true}}, "rules": [
                    {"exitEarly": "exitResponse"},
                    {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 5.0}}}}
                ]}
            ]}},
            {"setValue": {"identifier": "SCORE", "expression": {"baseValue": {"float": 6.0}}}}
        ]));
        let mut state = ItemSessionState::new();
        let outcome = run(&item, &mut state, &ExtensionRegistry::new()).unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Interrupted(InterruptKind::ExitResponse)
        );
        assert_eq!(score(&state), Value::Null);
    }

    #[test]
    fn template_constraint_requires_true() {
        let item = item(json!([
            {"templateConstraint": {"null": null}}
        ]));
        let mut state = ItemSessionState::new();
        assert_eq!(
            run(&item, &mut state, &ExtensionRegistry::new()).unwrap(),
            RunOutcome::Interrupted(InterruptKind::ConstraintFailure)
        );
    }

    #[test]
    fn lookup_outcome_value_uses_the_target_table() {
        let item = item(json!([
            {"lookupOutcomeValue": {"identifier": "GRADE", "expression": {"baseValue": {"integer": 1}}}}
        ]));
        let mut state = ItemSessionState::new();
        run(&item, &mut state, &ExtensionRegistry::new()).unwrap();
        assert_eq!(
            state.outcome_values.get("GRADE"),
            Some(&Value::identifier("A"))
        );
    }

    #[test]
    fn unresolved_variable_aborts_the_list() {
        let item = item(json!([
            {"setValue": {"identifier": "SCORE", "expression": {"variable": {"identifier": "MISSING"}}}}
        ]));
        let mut state = ItemSessionState::new();
        let err = run(&item, &mut state, &ExtensionRegistry::new()).unwrap_err();
        assert_eq!(
            err,
            EvalError::UnresolvedVariable {
                reference: VariableRef::local("MISSING").to_string()
            }
        );
    }

    struct Award;

    impl CustomRule for Award {
        fn execute(&self, args: &[Value]) -> Result<Vec<(Identifier, Value)>, EvalError> {
            Ok(vec![(Identifier::new("SCORE"), args[0].clone())])
        }
    }

    #[test]
    fn custom_rules_assign_through_the_scope() {
        let item = item(json!([
            {"custom": {"class": "org.example.Award",
                        "expressions": [{"baseValue": {"float": 4.0}}]}}
        ]));
        let mut registry = ExtensionRegistry::new();
        registry.register_rule("org.example.Award", Award);
        let mut state = ItemSessionState::new();
        run(&item, &mut state, &registry).unwrap();
        assert_eq!(score(&state), Value::float(4.0));
    }

    #[test]
    fn phases_gate_rule_kinds() {
        let exit = ProcessingRule::ExitEarly(ExitKind::ExitTest);
        assert!(ProcessingPhase::Outcome.allows(&exit));
        assert!(!ProcessingPhase::Response.allows(&exit));
        let constraint = ProcessingRule::TemplateConstraint(Expression::Null);
        assert!(ProcessingPhase::Template.allows(&constraint));
        assert!(!ProcessingPhase::Outcome.allows(&constraint));
    }
}
