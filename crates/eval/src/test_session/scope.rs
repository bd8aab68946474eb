//! Variable scope of test-level processing: test outcomes plus dotted
//! references into item sessions.

use std::collections::{BTreeMap, BTreeSet};

use crate::context::{coerce_for, read_item_variable, ItemView, ProcessingScope};
use crate::error::EvalError;
use crate::expression::ItemSubset;
use crate::plan::{NodeKind, TestPlan, TestPlanNode};
use crate::state::TestSessionState;
use crate::types::{
    AssessmentItemRef, Identifier, Value, VariableDeclaration, VariableKind, VariableRef,
    DURATION,
};
use crate::validate::ResolvedTest;

pub(crate) struct TestScope<'s> {
    resolved: &'s ResolvedTest,
    plan: &'s TestPlan,
    state: &'s mut TestSessionState,
}

impl<'s> TestScope<'s> {
    pub(crate) fn new(
        resolved: &'s ResolvedTest,
        plan: &'s TestPlan,
        state: &'s mut TestSessionState,
    ) -> Self {
        TestScope {
            resolved,
            plan,
            state,
        }
    }

    /// The plan node a dotted reference points at. `Ok(None)` when the
    /// itemRef exists but was not selected into the plan.
    fn node_for(&self, reference: &VariableRef) -> Result<Option<&'s TestPlanNode>, EvalError> {
        let Some(target) = &reference.item_ref else {
            return Err(unresolved(reference));
        };
        let nodes = self.plan.nodes_for(target.as_str());
        match reference.instance {
            Some(instance) => Ok(nodes
                .into_iter()
                .find(|n| n.key.instance_number == instance)),
            None if nodes.len() == 1 => Ok(nodes.into_iter().next()),
            None if nodes.is_empty() => {
                let known = self.resolved.items().contains_key(target.as_str())
                    || self.resolved.test().section(target.as_str()).is_some();
                if known {
                    Ok(None)
                } else {
                    Err(unresolved(reference))
                }
            }
            None => Err(EvalError::UnresolvedVariable {
                reference: format!(
                    "{} (ambiguous: '{}' was selected {} times)",
                    reference,
                    target,
                    nodes.len()
                ),
            }),
        }
    }

    fn lookup_dotted(&self, reference: &VariableRef) -> Result<Value, EvalError> {
        let Some(node) = self.node_for(reference)? else {
            return Ok(Value::Null);
        };
        let variable = reference.variable.as_str();
        match node.kind {
            NodeKind::ItemRef => {
                let item = self
                    .resolved
                    .item(node.identifier().as_str())
                    .ok_or_else(|| unresolved(reference))?;
                let state = self
                    .state
                    .items
                    .get(&node.key)
                    .ok_or_else(|| unresolved(reference))?;
                read_item_variable(item, state, variable).ok_or_else(|| unresolved(reference))
            }
            NodeKind::Section | NodeKind::TestPart if variable == DURATION => {
                let states = if node.kind == NodeKind::Section {
                    &self.state.sections
                } else {
                    &self.state.test_parts
                };
                let seconds = states
                    .get(&node.key)
                    .map(|s| s.timing.duration())
                    .unwrap_or_default();
                Ok(Value::float(seconds))
            }
            _ => Err(unresolved(reference)),
        }
    }
}

fn unresolved(reference: impl std::fmt::Display) -> EvalError {
    EvalError::UnresolvedVariable {
        reference: reference.to_string(),
    }
}

fn read_only(target: &Identifier, message: &str) -> EvalError {
    EvalError::InvalidAssignment {
        identifier: target.to_string(),
        message: message.to_string(),
    }
}

impl ProcessingScope for TestScope<'_> {
    fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration> {
        self.resolved.test().declaration(identifier)
    }

    fn lookup(&self, reference: &VariableRef) -> Result<Value, EvalError> {
        if reference.is_dotted() {
            return self.lookup_dotted(reference);
        }
        let name = reference.variable.as_str();
        if name == DURATION {
            return Ok(Value::float(self.state.timing.duration()));
        }
        if self.declaration(name).is_none() {
            return Err(unresolved(reference));
        }
        Ok(self
            .state
            .outcome_values
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    fn default_value(&self, identifier: &Identifier) -> Result<Value, EvalError> {
        self.declaration(identifier.as_str())
            .map(VariableDeclaration::default_or_null)
            .ok_or_else(|| unresolved(identifier))
    }

    fn correct_response(&self, identifier: &Identifier) -> Result<Value, EvalError> {
        Err(unresolved(identifier))
    }

    fn weight(&self, reference: &VariableRef, weight: &Identifier) -> Option<f64> {
        let target = reference.item_ref.as_ref()?;
        self.resolved
            .test()
            .item_ref(target.as_str())?
            .weight(weight.as_str())
    }

    fn items(&self, subset: &ItemSubset) -> Option<Vec<ItemView<'_>>> {
        let test = self.resolved.test();
        let refs: BTreeMap<&str, &AssessmentItemRef> = test
            .item_refs()
            .into_iter()
            .map(|r| (r.identifier.as_str(), r))
            .collect();
        let within: Option<BTreeSet<&str>> = subset.section_identifier.as_ref().map(|id| {
            test.section(id.as_str())
                .map(|s| s.item_refs().into_iter().map(|r| r.identifier.as_str()).collect())
                .unwrap_or_default()
        });

        let mut views = Vec::new();
        for node in self.plan.items() {
            let id = node.identifier().as_str();
            if within.as_ref().is_some_and(|w| !w.contains(id)) {
                continue;
            }
            let Some(item_ref) = refs.get(id).copied() else {
                continue;
            };
            let categories = &item_ref.categories;
            if !subset.include_category.is_empty()
                && !subset.include_category.iter().any(|c| categories.contains(c))
            {
                continue;
            }
            if subset.exclude_category.iter().any(|c| categories.contains(c)) {
                continue;
            }
            let (Some(item), Some(state)) =
                (self.resolved.item(id), self.state.items.get(&node.key))
            else {
                continue;
            };
            views.push(ItemView {
                item_ref,
                item,
                state,
            });
        }
        Some(views)
    }

    fn write(&mut self, target: &Identifier, value: Value) -> Result<(), EvalError> {
        if target.as_str() == DURATION {
            return Err(read_only(target, "built-in variable is read-only"));
        }
        let declaration = self
            .resolved
            .test()
            .declaration(target.as_str())
            .filter(|d| d.kind == VariableKind::Outcome)
            .ok_or_else(|| unresolved(target))?;
        let value = coerce_for(declaration, value)?;
        self.state.outcome_values.insert(target.clone(), value);
        Ok(())
    }

    fn write_default(&mut self, target: &Identifier, _value: Value) -> Result<(), EvalError> {
        Err(read_only(target, "test defaults cannot be changed"))
    }

    fn write_correct(&mut self, target: &Identifier, _value: Value) -> Result<(), EvalError> {
        Err(read_only(target, "tests have no correct responses"))
    }
}
