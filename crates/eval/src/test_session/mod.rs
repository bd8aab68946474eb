//! The test session controller: navigation across parts, sections and
//! items, branching, preconditions, time limits and test outcome processing.
//!
//! Item sessions are driven through [`ItemSessionController`]s built on
//! demand over the per-item states held in [`TestSessionState`]. The
//! [`TestPlan`] is read-only and kept by the caller next to the state.

mod scope;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::{EvalContext, Runtime};
use crate::error::{ConfigurationError, EngineError, EvalError, NavigationError, StateError};
use crate::evaluate::evaluate;
use crate::expression::Expression;
use crate::extension::ExtensionRegistry;
use crate::item_session::{ItemPhase, ItemSessionController, ItemSessionSettings};
use crate::notification::Notification;
use crate::plan::{NodeKind, TestPlan, TestPlanNode, TestPlanNodeKey, TestPlanner};
use crate::rules::{run_rules, RunOutcome};
use crate::state::{ControlObjectState, ItemSessionState, TestSessionState};
use crate::types::{
    AssessmentItem, AssessmentItemRef, AssessmentSection, BranchRule, BranchTarget, Identifier,
    ItemSessionControl, NavigationMode, SubmissionMode, TestPart, TimeLimits, Value,
    VariableKind,
};
use crate::validate::ResolvedTest;

use scope::TestScope;

// ──────────────────────────────────────────────
// Settings, phases and results
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestSessionSettings {
    pub template_processing_limit: u32,
    /// Seed for planning, shuffling and random expressions. `None` draws
    /// from entropy.
    pub seed: Option<u64>,
    /// Honour `minTime` in linear parts.
    pub enforce_min_time: bool,
}

impl Default for TestSessionSettings {
    fn default() -> Self {
        TestSessionSettings {
            template_processing_limit: 100,
            seed: None,
            enforce_min_time: true,
        }
    }
}

impl TestSessionSettings {
    pub fn runtime(&self) -> Runtime {
        Runtime::new(self.seed)
    }
}

/// Lifecycle of a test part or section, derived from its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    NotEntered,
    Entered,
    Ended,
    Exited,
    PreconditionFailed,
}

impl ControlPhase {
    pub fn of(state: &ControlObjectState) -> Self {
        if state.precondition_failed {
            ControlPhase::PreconditionFailed
        } else if state.timing.is_exited() {
            ControlPhase::Exited
        } else if state.timing.is_ended() {
            ControlPhase::Ended
        } else if state.timing.is_entered() {
            ControlPhase::Entered
        } else {
            ControlPhase::NotEntered
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitScope {
    Test,
    TestPart,
    Section,
    Item,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitScope::Test => "test",
            LimitScope::TestPart => "testPart",
            LimitScope::Section => "section",
            LimitScope::Item => "item",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeLimitExceeded {
    pub scope: LimitScope,
    pub identifier: Identifier,
    /// Seconds.
    pub limit: f64,
    pub elapsed: f64,
}

/// What a navigation call did.
#[derive(Debug, Clone, PartialEq)]
pub enum Navigation {
    ItemEntered(TestPlanNodeKey),
    TestPartEntered(TestPlanNodeKey),
    Deselected,
    /// Linear walk ran off the end of the current part.
    EndOfTestPart,
    TestPartEnded,
    TestEnded,
    TestExited,
    /// A maximum time ran out; the requested action was not performed.
    TimeLimitExceeded(TimeLimitExceeded),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseHandling {
    Bound { valid: bool },
    TimeLimitExceeded(TimeLimitExceeded),
}

/// Where leaving a node sends the linear walk.
enum Jump {
    To(usize),
    ExitTest,
}

// ──────────────────────────────────────────────
// Controller
// ──────────────────────────────────────────────

pub struct TestSessionController<'a> {
    resolved: &'a ResolvedTest,
    plan: &'a TestPlan,
    state: &'a mut TestSessionState,
    settings: TestSessionSettings,
    extensions: &'a ExtensionRegistry,
    runtime: &'a mut Runtime,
}

impl<'a> TestSessionController<'a> {
    /// Refuses tests whose validation report carries errors.
    pub fn new(
        resolved: &'a ResolvedTest,
        plan: &'a TestPlan,
        state: &'a mut TestSessionState,
        settings: TestSessionSettings,
        extensions: &'a ExtensionRegistry,
        runtime: &'a mut Runtime,
    ) -> Result<Self, EngineError> {
        resolved.ensure_valid()?;
        Ok(TestSessionController {
            resolved,
            plan,
            state,
            settings,
            extensions,
            runtime,
        })
    }

    /// Selection and ordering for a new session, drawn from `runtime`.
    pub fn plan(resolved: &ResolvedTest, runtime: &mut Runtime) -> TestPlan {
        TestPlanner::plan(resolved.test(), runtime.rng())
    }

    pub fn state(&self) -> &TestSessionState {
        self.state
    }

    pub fn test_plan(&self) -> &TestPlan {
        self.plan
    }

    pub fn item_session_state(&self, key: &TestPlanNodeKey) -> Option<&ItemSessionState> {
        self.state.items.get(key)
    }

    pub fn test_part_phase(&self, key: &TestPlanNodeKey) -> Option<ControlPhase> {
        self.state.test_parts.get(key).map(ControlPhase::of)
    }

    pub fn outcome(&self, identifier: &str) -> Option<&Value> {
        self.state.outcome_values.get(identifier)
    }

    fn test_phase(&self) -> &'static str {
        let timing = &self.state.timing;
        if !self.state.initialized {
            "not initialized"
        } else if timing.is_exited() {
            "exited"
        } else if timing.is_ended() {
            "ended"
        } else if self.state.suspended {
            "suspended"
        } else if timing.is_entered() {
            "entered"
        } else {
            "initialized"
        }
    }

    fn illegal(&self, operation: &'static str) -> EngineError {
        StateError::IllegalTransition {
            operation,
            phase: format!("test is {}", self.test_phase()),
        }
        .into()
    }

    /// Entered, not suspended, not ended.
    fn require_running(&self, operation: &'static str) -> Result<(), EngineError> {
        let timing = &self.state.timing;
        if self.state.initialized && timing.is_entered() && !timing.is_ended() && !self.state.suspended
        {
            Ok(())
        } else {
            Err(self.illegal(operation))
        }
    }

    fn notify(&self, node: impl Into<String>, message: impl Into<String>) {
        self.runtime.notify(Notification::warning(node, message));
    }

    // ── definitions behind plan nodes ─────────

    fn unknown(node: &TestPlanNode) -> EngineError {
        StateError::UnknownNode {
            key: node.key.to_string(),
        }
        .into()
    }

    fn part_def(&self, node: &TestPlanNode) -> Result<&'a TestPart, EngineError> {
        self.resolved
            .test()
            .test_part(node.identifier().as_str())
            .ok_or_else(|| Self::unknown(node))
    }

    fn section_def(&self, node: &TestPlanNode) -> Result<&'a AssessmentSection, EngineError> {
        self.resolved
            .test()
            .section(node.identifier().as_str())
            .ok_or_else(|| Self::unknown(node))
    }

    fn item_ref_def(&self, node: &TestPlanNode) -> Result<&'a AssessmentItemRef, EngineError> {
        self.resolved
            .test()
            .item_ref(node.identifier().as_str())
            .ok_or_else(|| Self::unknown(node))
    }

    fn item_def(&self, node: &TestPlanNode) -> Result<&'a AssessmentItem, EngineError> {
        self.resolved
            .item(node.identifier().as_str())
            .ok_or_else(|| {
                ConfigurationError::UnresolvedItem {
                    item_ref: node.identifier().to_string(),
                    reason: "no resolved item".to_string(),
                }
                .into()
            })
    }

    fn node(&self, key: &TestPlanNodeKey) -> Result<&'a TestPlanNode, EngineError> {
        let plan = self.plan;
        plan.node(key).ok_or_else(|| {
            StateError::UnknownNode {
                key: key.to_string(),
            }
            .into()
        })
    }

    fn current_part(&self) -> Result<&'a TestPlanNode, EngineError> {
        let key = self
            .state
            .current_test_part
            .as_ref()
            .ok_or(NavigationError::NoCurrentTestPart)?;
        self.node(key)
    }

    fn current_part_open(&self, operation: &'static str) -> Result<&'a TestPlanNode, EngineError> {
        let part = self.current_part()?;
        let open = self
            .state
            .test_parts
            .get(&part.key)
            .is_some_and(|s| s.timing.is_open());
        if open {
            Ok(part)
        } else {
            Err(StateError::IllegalTransition {
                operation,
                phase: format!("test part '{}' is not open", part.identifier()),
            }
            .into())
        }
    }

    /// The nearest `itemSessionControl` from the itemRef up to its part.
    fn item_control(&self, node: &TestPlanNode) -> ItemSessionControl {
        if let Some(control) = self
            .item_ref_def(node)
            .ok()
            .and_then(|r| r.item_session_control)
        {
            return control;
        }
        for section in self.plan.enclosing_sections(node) {
            if let Some(control) = self
                .section_def(section)
                .ok()
                .and_then(|s| s.item_session_control)
            {
                return control;
            }
        }
        self.plan
            .test_part_of(node)
            .and_then(|p| self.part_def(p).ok())
            .and_then(|p| p.item_session_control)
            .unwrap_or_default()
    }

    fn item_settings(&self, node: &TestPlanNode) -> ItemSessionSettings {
        let control = self.item_control(node);
        ItemSessionSettings {
            template_processing_limit: self.settings.template_processing_limit,
            max_attempts: control.max_attempts,
            allow_comment: control.allow_comment,
        }
    }

    fn with_item<R>(
        &mut self,
        key: &TestPlanNodeKey,
        f: impl FnOnce(&mut ItemSessionController<'_>) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let node = self.node(key)?;
        let item = self.item_def(node)?;
        let settings = self.item_settings(node);
        let state = self
            .state
            .items
            .get_mut(key)
            .ok_or_else(|| Self::unknown(node))?;
        let mut controller =
            ItemSessionController::unchecked(item, state, settings, self.extensions, self.runtime);
        f(&mut controller)
    }

    fn item_phase(&self, key: &TestPlanNodeKey) -> Option<ItemPhase> {
        self.state.items.get(key).map(ItemPhase::of)
    }

    fn control_state(&mut self, node: &TestPlanNode) -> Option<&mut ControlObjectState> {
        match node.kind {
            NodeKind::TestPart => self.state.test_parts.get_mut(&node.key),
            NodeKind::Section => self.state.sections.get_mut(&node.key),
            NodeKind::ItemRef => None,
        }
    }

    // ── evaluation in test scope ──────────────

    fn with_scope<R>(
        &mut self,
        f: impl FnOnce(&mut EvalContext<'_>) -> Result<R, EvalError>,
    ) -> Result<R, EvalError> {
        let mut scope = TestScope::new(self.resolved, self.plan, self.state);
        let mut ctx = EvalContext::new(&mut scope, self.runtime, self.extensions);
        f(&mut ctx)
    }

    /// Single boolean `true`; NULL and anything else are false.
    fn holds(&mut self, expression: &Expression) -> Result<bool, EngineError> {
        let value = self.with_scope(|ctx| evaluate(expression, ctx))?;
        Ok(value.as_bool() == Some(true))
    }

    fn preconditions_hold(&mut self, preconditions: &[Expression]) -> Result<bool, EngineError> {
        for precondition in preconditions {
            if !self.holds(precondition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Target of the first branch rule that holds.
    fn branch_target(&mut self, rules: &[BranchRule]) -> Result<Option<BranchTarget>, EngineError> {
        for rule in rules {
            if self.holds(&rule.expression)? {
                return Ok(Some(rule.target.clone()));
            }
        }
        Ok(None)
    }

    /// Resets test outcomes to their defaults and runs outcome processing.
    pub fn perform_outcome_processing(&mut self) -> Result<(), EngineError> {
        let resolved = self.resolved;
        let test = resolved.test();
        self.reset_outcomes();
        let outcome = self.with_scope(|ctx| run_rules(&test.outcome_processing, ctx))?;
        if let RunOutcome::Interrupted(kind) = outcome {
            tracing::debug!(test = %test.identifier, ?kind, "outcome processing stopped early");
        }
        Ok(())
    }

    // ── lifecycle ─────────────────────────────

    /// Fresh state for every plan node; every item is initialized and
    /// template-processed with its itemRef's template defaults.
    pub fn initialize(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        if self.state.initialized {
            return Err(self.illegal("initialize"));
        }
        tracing::debug!(test = %self.resolved.test().identifier, at = %t, "initializing test session");
        *self.state = TestSessionState::new(self.plan);
        self.state.initialized = true;

        let plan = self.plan;
        for node in plan.items() {
            let item_ref = self.item_ref_def(node)?;
            let mut defaults = BTreeMap::new();
            for template_default in &item_ref.template_defaults {
                let value = self.with_scope(|ctx| evaluate(&template_default.expression, ctx))?;
                defaults.insert(template_default.template_identifier.clone(), value);
            }
            self.with_item(&node.key, |item| {
                item.initialize(t)?;
                item.perform_template_processing(t, &defaults)
            })?;
        }
        self.reset_outcomes();
        Ok(())
    }

    fn reset_outcomes(&mut self) {
        self.state.outcome_values = self
            .resolved
            .test()
            .declarations
            .iter()
            .filter(|d| d.kind == VariableKind::Outcome)
            .map(|d| (d.identifier.clone(), d.default_or_null()))
            .collect();
    }

    pub fn enter_test(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        if !self.state.initialized || self.state.timing.is_entered() {
            return Err(self.illegal("enterTest"));
        }
        tracing::debug!(test = %self.resolved.test().identifier, at = %t, "entering test");
        self.state.timing.enter(t);
        Ok(())
    }

    /// Pauses every open clock on the current path.
    pub fn suspend_test(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require_running("suspendTest")?;
        self.touch(t);
        if let Some(key) = self.state.current_item.clone() {
            if self.item_phase(&key) == Some(ItemPhase::Interacting) {
                self.with_item(&key, |item| item.suspend(t))?;
            }
        }
        for state in self.open_path_states() {
            state.timing.pause(t);
        }
        self.state.timing.pause(t);
        self.state.suspended = true;
        Ok(())
    }

    pub fn resume_test(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        if !self.state.suspended {
            return Err(self.illegal("resumeTest"));
        }
        self.state.suspended = false;
        self.state.timing.resume(t);
        for state in self.open_path_states() {
            state.timing.resume(t);
        }
        if let Some(key) = self.state.current_item.clone() {
            if self.item_phase(&key) == Some(ItemPhase::Suspended) {
                self.with_item(&key, |item| item.resume(t))?;
            }
        }
        Ok(())
    }

    /// Part and section states on the path to the current item.
    fn open_path_states(&mut self) -> Vec<&mut ControlObjectState> {
        let plan = self.plan;
        let mut sections = Vec::new();
        if let Some(node) = self.state.current_item.as_ref().and_then(|k| plan.node(k)) {
            sections = plan
                .enclosing_sections(node)
                .into_iter()
                .map(|n| n.key.clone())
                .collect();
        }
        let part = self.state.current_test_part.clone();
        let mut out = Vec::new();
        if let Some(part) = part {
            if let Some(state) = self.state.test_parts.get_mut(&part) {
                out.push(state);
            }
        }
        out.extend(
            self.state
                .sections
                .iter_mut()
                .filter(|(k, _)| sections.contains(k))
                .map(|(_, s)| s),
        );
        out
    }

    // ── time limits ───────────────────────────

    /// Folds elapsed time into every open clock on the current path.
    fn touch(&mut self, t: OffsetDateTime) {
        self.state.timing.touch(t);
        for state in self.open_path_states() {
            state.timing.touch(t);
        }
        if let Some(key) = self.state.current_item.clone() {
            if let Some(item) = self.state.items.get_mut(&key) {
                if !item.is_closed() && !item.suspended {
                    item.timing.touch(t);
                }
            }
        }
    }

    /// Touches the clocks at `t` and applies the first maximum time that
    /// has run out, outermost first.
    fn enforce_time_limits(
        &mut self,
        t: OffsetDateTime,
    ) -> Result<Option<TimeLimitExceeded>, EngineError> {
        if !self.state.timing.is_open() || self.state.suspended {
            return Ok(None);
        }
        self.touch(t);
        let resolved = self.resolved;
        let test = resolved.test();

        if let Some(exceeded) = over(
            test.time_limits.as_ref(),
            self.state.timing.duration(),
            LimitScope::Test,
            &test.identifier,
        ) {
            tracing::debug!(test = %test.identifier, elapsed = exceeded.elapsed, "test time limit exceeded");
            if self.current_part_open("timeLimit").is_ok() {
                self.end_part(t, true)?;
            }
            self.end_test(t);
            return Ok(Some(exceeded));
        }

        let Ok(part) = self.current_part_open("timeLimit") else {
            return Ok(None);
        };
        let part_limits = self.part_def(part)?.time_limits;
        let part_elapsed = self
            .state
            .test_parts
            .get(&part.key)
            .map(|s| s.timing.duration())
            .unwrap_or_default();
        if let Some(exceeded) = over(
            part_limits.as_ref(),
            part_elapsed,
            LimitScope::TestPart,
            part.identifier(),
        ) {
            tracing::debug!(part = %part.key, elapsed = exceeded.elapsed, "test part time limit exceeded");
            self.end_part(t, true)?;
            return Ok(Some(exceeded));
        }

        let plan = self.plan;
        let Some(item_node) = self.state.current_item.as_ref().and_then(|k| plan.node(k)) else {
            return Ok(None);
        };
        for section in plan.enclosing_sections(item_node).into_iter().rev() {
            let Some(state) = self.state.sections.get(&section.key) else {
                continue;
            };
            if !state.timing.is_open() {
                continue;
            }
            let limits = self.section_def(section)?.time_limits;
            if let Some(exceeded) = over(
                limits.as_ref(),
                state.timing.duration(),
                LimitScope::Section,
                section.identifier(),
            ) {
                tracing::debug!(section = %section.key, "section time limit exceeded");
                for item in plan.items_within(section) {
                    self.close_item(t, &item.key)?;
                }
                if let Some(state) = self.state.sections.get_mut(&section.key) {
                    state.timing.end(t);
                }
                return Ok(Some(exceeded));
            }
        }

        let open = self
            .state
            .items
            .get(&item_node.key)
            .filter(|s| !s.is_closed())
            .map(|s| s.duration());
        if let Some(elapsed) = open {
            let limits = self.item_ref_def(item_node)?.time_limits;
            if let Some(exceeded) =
                over(limits.as_ref(), elapsed, LimitScope::Item, item_node.identifier())
            {
                tracing::debug!(item = %item_node.key, "item time limit exceeded");
                self.close_item(t, &item_node.key)?;
                return Ok(Some(exceeded));
            }
        }
        Ok(None)
    }

    fn check_min_time(
        &self,
        node: &TestPlanNode,
        limits: Option<&TimeLimits>,
        elapsed: f64,
    ) -> Result<(), EngineError> {
        if !self.settings.enforce_min_time {
            return Ok(());
        }
        match limits.and_then(|l| l.min_time) {
            Some(minimum) if elapsed < minimum => Err(NavigationError::MinimumTimeNotReached {
                node: node.identifier().to_string(),
                minimum,
                elapsed,
            }
            .into()),
            _ => Ok(()),
        }
    }

    // ── item activation ───────────────────────

    fn enter_sections_of(&mut self, t: OffsetDateTime, node: &TestPlanNode) {
        let plan = self.plan;
        for section in plan.enclosing_sections(node) {
            if let Some(state) = self.state.sections.get_mut(&section.key) {
                if !state.timing.is_entered() {
                    state.timing.enter(t);
                }
            }
        }
    }

    /// Makes `key` the current item, entering or resuming its session.
    fn activate_item(&mut self, t: OffsetDateTime, key: &TestPlanNodeKey) -> Result<(), EngineError> {
        let node = self.node(key)?;
        self.enter_sections_of(t, node);
        match self.item_phase(key) {
            Some(ItemPhase::Initialized) => self.with_item(key, |item| item.enter_item(t))?,
            Some(ItemPhase::Suspended) => self.with_item(key, |item| item.resume(t))?,
            _ => {}
        }
        self.state.current_item = Some(key.clone());
        Ok(())
    }

    /// Stops the current item's clock. Closes it as well when `close`.
    fn deactivate_current(&mut self, t: OffsetDateTime, close: bool) -> Result<(), EngineError> {
        let Some(key) = self.state.current_item.take() else {
            return Ok(());
        };
        if close {
            self.close_item(t, &key)
        } else if self.item_phase(&key) == Some(ItemPhase::Interacting) {
            self.with_item(&key, |item| item.suspend(t))
        } else {
            Ok(())
        }
    }

    fn close_item(&mut self, t: OffsetDateTime, key: &TestPlanNodeKey) -> Result<(), EngineError> {
        match self.item_phase(key) {
            Some(ItemPhase::Initialized | ItemPhase::Interacting | ItemPhase::Suspended) => {
                self.with_item(key, |item| item.end_item(t))
            }
            _ => Ok(()),
        }
    }

    // ── test parts ────────────────────────────

    /// The part [`enter_next_available_test_part`](Self::enter_next_available_test_part)
    /// would enter. Session state and the random source are left as they
    /// were; warnings raised while evaluating branch rules and
    /// preconditions still reach the listeners.
    pub fn find_next_enterable_test_part(&mut self) -> Result<Option<TestPlanNodeKey>, EngineError> {
        let rng = self.runtime.rng().clone();
        let found = self.scan_for_enterable_part();
        *self.runtime.rng() = rng;
        found
    }

    fn scan_for_enterable_part(&mut self) -> Result<Option<TestPlanNodeKey>, EngineError> {
        let Some(start) = self.next_part_start()? else {
            return Ok(None);
        };
        let plan = self.plan;
        for part in plan.test_parts().filter(|p| p.index() >= start) {
            let preconditions = &self.part_def(part)?.preconditions;
            if self.preconditions_hold(preconditions)? {
                return Ok(Some(part.key.clone()));
            }
        }
        Ok(None)
    }

    /// Plan index the part search starts from; `None` when the current
    /// part branches to `EXIT_TEST`.
    fn next_part_start(&mut self) -> Result<Option<usize>, EngineError> {
        let Ok(part) = self.current_part() else {
            return Ok(Some(0));
        };
        let rules = &self.part_def(part)?.branch_rules;
        match self.branch_target(rules)? {
            None | Some(BranchTarget::ExitTestPart | BranchTarget::ExitSection) => {
                Ok(Some(part.last_descendant + 1))
            }
            Some(BranchTarget::ExitTest) => Ok(None),
            Some(BranchTarget::Node(target)) => {
                let plan = self.plan;
                match plan
                    .test_parts()
                    .find(|p| p.identifier() == &target && p.index() > part.index())
                {
                    Some(next) => Ok(Some(next.index())),
                    None => {
                        self.notify(
                            format!("testPart '{}'", part.identifier()),
                            format!("branch target '{}' is not a later test part", target),
                        );
                        Ok(Some(part.last_descendant + 1))
                    }
                }
            }
        }
    }

    /// Exits the current (ended) part, follows its branch rules and enters
    /// the next part whose preconditions hold. Parts that fail are marked.
    /// In a linear part the first enterable item is entered too.
    pub fn enter_next_available_test_part(
        &mut self,
        t: OffsetDateTime,
    ) -> Result<Navigation, EngineError> {
        self.require_running("enterNextAvailableTestPart")?;
        if let Some(exceeded) = self.enforce_time_limits(t)? {
            return Ok(Navigation::TimeLimitExceeded(exceeded));
        }
        if let Some(key) = &self.state.current_test_part {
            let ended = self
                .state
                .test_parts
                .get(key)
                .is_some_and(|s| s.timing.is_ended());
            if !ended {
                return Err(StateError::IllegalTransition {
                    operation: "enterNextAvailableTestPart",
                    phase: format!("test part '{}' has not ended", key.identifier),
                }
                .into());
            }
        }

        let start = self.next_part_start()?;
        let plan = self.plan;
        if let Some(key) = self.state.current_test_part.take() {
            if let Some(state) = self.state.test_parts.get_mut(&key) {
                state.timing.exit(t);
            }
        }
        let Some(start) = start else {
            tracing::debug!("branch rule exits the test");
            self.end_test(t);
            return Ok(Navigation::TestEnded);
        };
        for part in plan.test_parts().filter(|p| p.index() < start) {
            if let Some(state) = self.state.test_parts.get_mut(&part.key) {
                if !state.timing.is_entered() && !state.precondition_failed {
                    state.jumped_by_branch_rule = true;
                }
            }
        }

        for part in plan.test_parts().filter(|p| p.index() >= start) {
            let definition = self.part_def(part)?;
            if !self.preconditions_hold(&definition.preconditions)? {
                tracing::debug!(part = %part.key, "test part precondition failed");
                if let Some(state) = self.control_state(part) {
                    state.precondition_failed = true;
                }
                continue;
            }
            tracing::debug!(part = %part.key, at = %t, "entering test part");
            if let Some(state) = self.control_state(part) {
                state.timing.enter(t);
            }
            self.state.current_test_part = Some(part.key.clone());
            if definition.navigation_mode == NavigationMode::Linear {
                self.walk_forward(t, part, part.index() + 1)?;
            }
            return Ok(Navigation::TestPartEntered(part.key.clone()));
        }

        self.end_test(t);
        Ok(Navigation::TestEnded)
    }

    /// Whether the current part may end without forcing.
    pub fn may_end_current_test_part(&self) -> bool {
        let Ok(part) = self.current_part_open("mayEndTestPart") else {
            return false;
        };
        self.part_end_blocker(part).is_none()
    }

    /// The reason the part may not end yet, if any.
    fn part_end_blocker(&self, part: &TestPlanNode) -> Option<String> {
        for node in self.plan.items_within(part) {
            let Some(state) = self.state.items.get(&node.key) else {
                continue;
            };
            if state.precondition_failed || state.jumped_by_branch_rule {
                continue;
            }
            let control = self.item_control(node);
            if !control.allow_skipping && !state.responded {
                return Some(format!("item '{}' has not been answered", node.key));
            }
            if control.validate_responses && state.responded && !state.responses_valid() {
                return Some(format!("item '{}' has invalid responses", node.key));
            }
        }
        None
    }

    /// Ends the current part: deferred response processing and outcome
    /// processing in simultaneous mode, then every item is closed.
    pub fn end_current_test_part(&mut self, t: OffsetDateTime) -> Result<Navigation, EngineError> {
        self.require_running("endCurrentTestPart")?;
        if let Some(exceeded) = self.enforce_time_limits(t)? {
            return Ok(Navigation::TimeLimitExceeded(exceeded));
        }
        let part = self.current_part_open("endCurrentTestPart")?;
        let definition = self.part_def(part)?;
        if let Some(reason) = self.part_end_blocker(part) {
            return Err(NavigationError::CannotEndTestPart { reason }.into());
        }
        if definition.navigation_mode == NavigationMode::Linear {
            let elapsed = self
                .state
                .test_parts
                .get(&part.key)
                .map(|s| s.timing.duration())
                .unwrap_or_default();
            self.check_min_time(part, definition.time_limits.as_ref(), elapsed)?;
        }
        self.end_part(t, false)?;
        Ok(Navigation::TestPartEnded)
    }

    fn end_part(&mut self, t: OffsetDateTime, forced: bool) -> Result<(), EngineError> {
        let part = self.current_part()?;
        let definition = self.part_def(part)?;
        tracing::debug!(part = %part.key, forced, at = %t, "ending test part");
        self.deactivate_current(t, false)?;

        let plan = self.plan;
        let items = plan.items_within(part);
        if definition.submission_mode == SubmissionMode::Simultaneous {
            for node in &items {
                if self.item_phase(&node.key) == Some(ItemPhase::Suspended) {
                    self.with_item(&node.key, |item| item.resume(t))?;
                }
                let responded = self
                    .state
                    .items
                    .get(&node.key)
                    .is_some_and(|s| s.responded);
                if responded && self.item_phase(&node.key) == Some(ItemPhase::Interacting) {
                    self.with_item(&node.key, |item| item.perform_response_processing(t))?;
                }
            }
            self.perform_outcome_processing()?;
        }
        for node in &items {
            self.close_item(t, &node.key)?;
        }
        for node in plan.nodes()[part.index()..=part.last_descendant].iter() {
            if node.kind == NodeKind::Section {
                if let Some(state) = self.state.sections.get_mut(&node.key) {
                    if state.timing.is_entered() && !state.timing.is_ended() {
                        state.timing.end(t);
                    }
                }
            }
        }
        if let Some(state) = self.state.test_parts.get_mut(&part.key) {
            state.timing.end(t);
        }
        Ok(())
    }

    fn end_test(&mut self, t: OffsetDateTime) {
        if let Some(key) = self.state.current_test_part.take() {
            if let Some(state) = self.state.test_parts.get_mut(&key) {
                state.timing.exit(t);
            }
        }
        self.state.current_item = None;
        if !self.state.timing.is_ended() {
            tracing::debug!(test = %self.resolved.test().identifier, at = %t, "test ended");
            self.state.timing.end(t);
        }
    }

    /// Leaves the test. An open part is ended first.
    pub fn exit_test(&mut self, t: OffsetDateTime) -> Result<Navigation, EngineError> {
        if !self.state.initialized || !self.state.timing.is_entered() || self.state.timing.is_exited()
        {
            return Err(self.illegal("exitTest"));
        }
        if self.current_part_open("exitTest").is_ok() {
            self.end_part(t, true)?;
        }
        self.end_test(t);
        self.state.suspended = false;
        self.state.timing.exit(t);
        Ok(Navigation::TestExited)
    }

    // ── items ─────────────────────────────────

    /// Selects an item of the current non-linear part, or deselects with
    /// `None`. An invalid key leaves the state untouched.
    pub fn select_item_nonlinear(
        &mut self,
        t: OffsetDateTime,
        key: Option<&TestPlanNodeKey>,
    ) -> Result<Navigation, EngineError> {
        self.require_running("selectItemNonlinear")?;
        let part = self.current_part_open("selectItemNonlinear")?;
        if self.part_def(part)?.navigation_mode != NavigationMode::Nonlinear {
            return Err(NavigationError::WrongNavigationMode {
                operation: "selectItemNonlinear",
                required: "nonlinear",
            }
            .into());
        }
        if let Some(key) = key {
            let invalid = |reason: &str| NavigationError::InvalidSelection {
                key: key.to_string(),
                reason: reason.to_string(),
            };
            let node = self
                .plan
                .node(key)
                .ok_or_else(|| invalid("no such node in the test plan"))?;
            if !node.is_item() {
                return Err(invalid("not an item").into());
            }
            if !part.covers(node) {
                return Err(invalid("not in the current test part").into());
            }
        }

        if let Some(exceeded) = self.enforce_time_limits(t)? {
            return Ok(Navigation::TimeLimitExceeded(exceeded));
        }
        self.deactivate_current(t, false)?;
        match key {
            Some(key) => {
                self.activate_item(t, key)?;
                Ok(Navigation::ItemEntered(key.clone()))
            }
            None => Ok(Navigation::Deselected),
        }
    }

    /// Leaves the current item of a linear part and enters the next one,
    /// following branch rules and skipping failed preconditions.
    pub fn advance_item_linear(&mut self, t: OffsetDateTime) -> Result<Navigation, EngineError> {
        self.require_running("advanceItemLinear")?;
        let part = self.current_part_open("advanceItemLinear")?;
        let definition = self.part_def(part)?;
        if definition.navigation_mode != NavigationMode::Linear {
            return Err(NavigationError::WrongNavigationMode {
                operation: "advanceItemLinear",
                required: "linear",
            }
            .into());
        }
        if let Some(exceeded) = self.enforce_time_limits(t)? {
            return Ok(Navigation::TimeLimitExceeded(exceeded));
        }

        let plan = self.plan;
        let Some(current) = self.state.current_item.as_ref().and_then(|k| plan.node(k)) else {
            return Ok(Navigation::EndOfTestPart);
        };
        let item_ref = self.item_ref_def(current)?;
        if let Some(state) = self.state.items.get(&current.key) {
            let control = self.item_control(current);
            if !control.allow_skipping && !state.responded {
                return Err(NavigationError::CannotSkipItem {
                    item: current.key.to_string(),
                }
                .into());
            }
            if control.validate_responses && !state.responses_valid() {
                return Err(NavigationError::CannotSkipItem {
                    item: current.key.to_string(),
                }
                .into());
            }
            if !state.is_closed() {
                self.check_min_time(current, item_ref.time_limits.as_ref(), state.duration())?;
            }
        }

        let close = definition.submission_mode == SubmissionMode::Individual;
        self.deactivate_current(t, close)?;

        let mut cursor = current.index() + 1;
        if let Some(target) = self.branch_target(&item_ref.branch_rules)? {
            match self.jump(part, current, &target)? {
                Jump::To(next) => cursor = next,
                Jump::ExitTest => return self.branch_exit_test(t, part, current),
            }
        }
        for section in plan.enclosing_sections(current) {
            if cursor <= section.last_descendant {
                break;
            }
            if let Some(state) = self.state.sections.get_mut(&section.key) {
                if state.timing.is_open() {
                    state.timing.end(t);
                }
            }
            let rules = &self.section_def(section)?.branch_rules;
            if let Some(target) = self.branch_target(rules)? {
                if let Some(state) = self.state.sections.get_mut(&section.key) {
                    state.branch_target = Some(target.clone());
                }
                match self.jump(part, section, &target)? {
                    Jump::To(next) => cursor = cursor.max(next),
                    Jump::ExitTest => return self.branch_exit_test(t, part, section),
                }
            }
        }

        match self.walk_forward(t, part, cursor)? {
            Some(key) => Ok(Navigation::ItemEntered(key)),
            None => Ok(Navigation::EndOfTestPart),
        }
    }

    /// Resolves a branch target taken when leaving `from`, flagging the
    /// nodes it skips.
    fn jump(
        &mut self,
        part: &'a TestPlanNode,
        from: &'a TestPlanNode,
        target: &BranchTarget,
    ) -> Result<Jump, EngineError> {
        let plan = self.plan;
        let after = from.last_descendant + 1;
        let next = match target {
            BranchTarget::ExitTest => return Ok(Jump::ExitTest),
            BranchTarget::ExitTestPart => part.last_descendant + 1,
            BranchTarget::ExitSection => {
                let enclosing = match from.kind {
                    NodeKind::ItemRef => plan.enclosing_sections(from).into_iter().next(),
                    _ => plan
                        .parent(from)
                        .filter(|p| p.kind == NodeKind::Section),
                };
                enclosing.map_or(part.last_descendant + 1, |s| s.last_descendant + 1)
            }
            BranchTarget::Node(identifier) => {
                let found = plan.nodes()[after.min(part.last_descendant + 1)..=part.last_descendant]
                    .iter()
                    .find(|n| n.identifier() == identifier);
                match found {
                    Some(node) => node.index(),
                    None => {
                        self.notify(
                            format!("'{}'", from.key),
                            format!("branch target '{}' is not a later node of this part", identifier),
                        );
                        after
                    }
                }
            }
        };
        tracing::debug!(from = %from.key, %target, next, "branching");
        self.mark_jumped(after, next);
        Ok(Jump::To(next))
    }

    fn mark_jumped(&mut self, from: usize, to: usize) {
        let plan = self.plan;
        for node in plan.nodes().iter().skip(from).take(to.saturating_sub(from)) {
            match node.kind {
                NodeKind::ItemRef => {
                    if let Some(state) = self.state.items.get_mut(&node.key) {
                        state.jumped_by_branch_rule = true;
                    }
                }
                _ => {
                    if let Some(state) = self.control_state(node) {
                        state.jumped_by_branch_rule = true;
                    }
                }
            }
        }
    }

    fn branch_exit_test(
        &mut self,
        t: OffsetDateTime,
        part: &'a TestPlanNode,
        from: &'a TestPlanNode,
    ) -> Result<Navigation, EngineError> {
        tracing::debug!(from = %from.key, "branch rule exits the test");
        self.mark_jumped(from.last_descendant + 1, part.last_descendant + 1);
        self.end_part(t, true)?;
        self.end_test(t);
        Ok(Navigation::TestEnded)
    }

    /// Enters the first item at or after plan index `cursor` whose
    /// preconditions (and those of its sections) hold.
    fn walk_forward(
        &mut self,
        t: OffsetDateTime,
        part: &'a TestPlanNode,
        mut cursor: usize,
    ) -> Result<Option<TestPlanNodeKey>, EngineError> {
        let plan = self.plan;
        self.state.current_item = None;
        while cursor <= part.last_descendant {
            let Some(node) = plan.at(cursor) else {
                break;
            };
            match node.kind {
                NodeKind::TestPart => cursor += 1,
                NodeKind::Section => {
                    let preconditions = &self.section_def(node)?.preconditions;
                    if !self.preconditions_hold(preconditions)? {
                        tracing::debug!(section = %node.key, "section precondition failed");
                        if let Some(state) = self.control_state(node) {
                            state.precondition_failed = true;
                        }
                        cursor = node.last_descendant + 1;
                        continue;
                    }
                    if let Some(state) = self.control_state(node) {
                        if !state.timing.is_entered() {
                            state.timing.enter(t);
                        }
                    }
                    cursor += 1;
                }
                NodeKind::ItemRef => {
                    let preconditions = &self.item_ref_def(node)?.preconditions;
                    if !self.preconditions_hold(preconditions)? {
                        tracing::debug!(item = %node.key, "item precondition failed");
                        if let Some(state) = self.state.items.get_mut(&node.key) {
                            state.precondition_failed = true;
                        }
                        cursor += 1;
                        continue;
                    }
                    self.activate_item(t, &node.key)?;
                    return Ok(Some(node.key.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Binds responses to the current item. Individual submission scores
    /// the item and reruns outcome processing at once; simultaneous
    /// submission waits for the end of the part.
    pub fn handle_responses(
        &mut self,
        t: OffsetDateTime,
        raw: &BTreeMap<Identifier, Vec<String>>,
    ) -> Result<ResponseHandling, EngineError> {
        self.require_running("handleResponses")?;
        if let Some(exceeded) = self.enforce_time_limits(t)? {
            return Ok(ResponseHandling::TimeLimitExceeded(exceeded));
        }
        let part = self.current_part_open("handleResponses")?;
        let key = self
            .state
            .current_item
            .clone()
            .ok_or(NavigationError::NoCurrentItem)?;
        let node = self.node(&key)?;
        let control = self.item_control(node);
        let valid = self.with_item(&key, |item| item.bind_responses(t, raw))?;

        if self.part_def(part)?.submission_mode == SubmissionMode::Individual {
            if valid || !control.validate_responses {
                self.with_item(&key, |item| item.perform_response_processing(t))?;
                self.perform_outcome_processing()?;
            }
        } else {
            self.with_item(&key, |item| item.commit_responses(t))?;
        }
        Ok(ResponseHandling::Bound { valid })
    }

    /// Closed items of the current part may be reviewed when their
    /// `allowReview` permits.
    pub fn may_review_item(&self, key: &TestPlanNodeKey) -> bool {
        let (Ok(part), Some(node)) = (self.current_part(), self.plan.node(key)) else {
            return false;
        };
        node.is_item()
            && part.covers(node)
            && self.state.items.get(key).is_some_and(|s| s.is_closed())
            && self.item_control(node).allow_review
    }
}

/// `Some` when `elapsed` is strictly beyond the maximum.
fn over(
    limits: Option<&TimeLimits>,
    elapsed: f64,
    scope: LimitScope,
    identifier: &Identifier,
) -> Option<TimeLimitExceeded> {
    let limit = limits?.max_time?;
    (elapsed > limit).then(|| TimeLimitExceeded {
        scope,
        identifier: identifier.clone(),
        limit,
        elapsed,
    })
}
