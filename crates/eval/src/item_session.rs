//! The item session state machine.
//!
//! An [`ItemSessionController`] borrows one item definition and one
//! [`ItemSessionState`] and drives them through
//! `NotInitialized → Initialized → Interacting ⇄ Suspended → Closed`.
//! The phase is never stored; it is derived from the state flags so a
//! deserialized state always agrees with itself.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::{
    coerce_for, item_correct_response, item_default, EvalContext, ItemScope, Runtime,
};
use crate::error::{ConfigurationError, EngineError, StateError};
use crate::extension::ExtensionRegistry;
use crate::notification::Notification;
use crate::response::{
    check_constraints, end_attempt_fired, item_correctness, parse_response, shuffle_choices,
    Correctness,
};
use crate::rules::{run_rules, InterruptKind, RunOutcome};
use crate::state::{ItemSessionState, SessionStatus};
use crate::types::{AssessmentItem, CompletionStatus, Identifier, Value, VariableKind};
use crate::validate::ResolvedItem;

// ──────────────────────────────────────────────
// Settings and phases
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ItemSessionSettings {
    /// Template processing runs before constraint failure is fatal.
    pub template_processing_limit: u32,
    /// Attempts allowed on a non-adaptive item; 0 means unlimited.
    pub max_attempts: u32,
    pub allow_comment: bool,
}

impl Default for ItemSessionSettings {
    fn default() -> Self {
        ItemSessionSettings {
            template_processing_limit: 100,
            max_attempts: 1,
            allow_comment: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    NotInitialized,
    Initialized,
    Interacting,
    Suspended,
    Closed,
}

impl ItemPhase {
    pub fn of(state: &ItemSessionState) -> Self {
        if !state.initialized {
            ItemPhase::NotInitialized
        } else if state.is_closed() {
            ItemPhase::Closed
        } else if state.suspended {
            ItemPhase::Suspended
        } else if state.is_entered() {
            ItemPhase::Interacting
        } else {
            ItemPhase::Initialized
        }
    }
}

impl fmt::Display for ItemPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemPhase::NotInitialized => "not initialized",
            ItemPhase::Initialized => "initialized",
            ItemPhase::Interacting => "interacting",
            ItemPhase::Suspended => "suspended",
            ItemPhase::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ──────────────────────────────────────────────
// Result snapshot
// ──────────────────────────────────────────────

/// Point-in-time report of an item session, shaped like a QTI `itemResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub identifier: Identifier,
    #[serde(with = "time::serde::rfc3339")]
    pub date_stamp: OffsetDateTime,
    pub session_status: SessionStatus,
    pub num_attempts: u32,
    pub completion_status: CompletionStatus,
    pub duration: f64,
    pub template_values: BTreeMap<Identifier, Value>,
    pub response_values: BTreeMap<Identifier, Value>,
    pub outcome_values: BTreeMap<Identifier, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shuffled_choice_orders: BTreeMap<Identifier, Vec<Identifier>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_comment: Option<String>,
}

// ──────────────────────────────────────────────
// Controller
// ──────────────────────────────────────────────

pub struct ItemSessionController<'a> {
    item: &'a AssessmentItem,
    state: &'a mut ItemSessionState,
    settings: ItemSessionSettings,
    extensions: &'a ExtensionRegistry,
    runtime: &'a mut Runtime,
}

impl<'a> ItemSessionController<'a> {
    /// Refuses items whose validation report carries errors.
    pub fn new(
        resolved: &'a ResolvedItem,
        state: &'a mut ItemSessionState,
        settings: ItemSessionSettings,
        extensions: &'a ExtensionRegistry,
        runtime: &'a mut Runtime,
    ) -> Result<Self, EngineError> {
        resolved.ensure_valid()?;
        Ok(Self::unchecked(
            resolved.item(),
            state,
            settings,
            extensions,
            runtime,
        ))
    }

    /// For callers that validated the definition already.
    pub(crate) fn unchecked(
        item: &'a AssessmentItem,
        state: &'a mut ItemSessionState,
        settings: ItemSessionSettings,
        extensions: &'a ExtensionRegistry,
        runtime: &'a mut Runtime,
    ) -> Self {
        ItemSessionController {
            item,
            state,
            settings,
            extensions,
            runtime,
        }
    }

    pub fn item(&self) -> &AssessmentItem {
        self.item
    }

    pub fn state(&self) -> &ItemSessionState {
        self.state
    }

    pub fn settings(&self) -> &ItemSessionSettings {
        &self.settings
    }

    pub fn phase(&self) -> ItemPhase {
        ItemPhase::of(self.state)
    }

    fn require(&self, operation: &'static str, allowed: &[ItemPhase]) -> Result<(), StateError> {
        let phase = self.phase();
        if allowed.contains(&phase) {
            Ok(())
        } else {
            Err(StateError::IllegalTransition {
                operation,
                phase: phase.to_string(),
            })
        }
    }

    fn notify(&self, message: impl Into<String>) {
        self.runtime.notify(Notification::warning(
            format!("assessmentItem '{}'", self.item.identifier),
            message,
        ));
    }

    // ── lifecycle ─────────────────────────────

    /// Sets every variable to its declared default, zeroes the built-ins
    /// and fixes the presentation order of shuffled interactions.
    pub fn initialize(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("initialize", &[ItemPhase::NotInitialized])?;
        tracing::debug!(item = %self.item.identifier, at = %t, "initializing item session");

        *self.state = ItemSessionState::new();
        self.state.initialized = true;
        self.reset_variables(VariableKind::Template);
        self.reset_variables(VariableKind::Response);
        self.reset_variables(VariableKind::Outcome);
        self.state.num_attempts = 0;
        self.state.completion_status = CompletionStatus::NotAttempted;
        self.state.session_status = SessionStatus::Initial;
        self.shuffle();
        Ok(())
    }

    /// Runs template processing, retrying while a template constraint
    /// fails. `template_defaults` replace declared template defaults for
    /// this run.
    pub fn perform_template_processing(
        &mut self,
        t: OffsetDateTime,
        template_defaults: &BTreeMap<Identifier, Value>,
    ) -> Result<(), EngineError> {
        self.require(
            "template processing",
            &[ItemPhase::Initialized, ItemPhase::Interacting],
        )?;
        self.state.timing.touch(t);

        let mut overrides = BTreeMap::new();
        for (identifier, value) in template_defaults {
            match self
                .item
                .declaration(identifier.as_str())
                .filter(|d| d.kind == VariableKind::Template)
            {
                Some(declaration) => {
                    overrides.insert(identifier.clone(), coerce_for(declaration, value.clone())?);
                }
                None => self.notify(format!(
                    "template default for '{}' ignored: not a template variable",
                    identifier
                )),
            }
        }

        let limit = self.settings.template_processing_limit.max(1);
        let mut tries = 0;
        loop {
            tries += 1;
            self.state.overridden_defaults = overrides.clone();
            self.state.overridden_correct_responses.clear();
            self.reset_variables(VariableKind::Template);

            let outcome = {
                let mut scope = ItemScope::new(self.item, self.state);
                let mut ctx = EvalContext::new(&mut scope, self.runtime, self.extensions);
                run_rules(&self.item.template_processing, &mut ctx)?
            };
            match outcome {
                RunOutcome::Interrupted(InterruptKind::ConstraintFailure) => {
                    tracing::trace!(item = %self.item.identifier, tries, "template constraint failed");
                    if tries >= limit {
                        return Err(ConfigurationError::TemplateConstraintExhausted {
                            item: self.item.identifier.to_string(),
                            tries,
                        }
                        .into());
                    }
                }
                _ => break,
            }
        }
        tracing::debug!(item = %self.item.identifier, tries, "template processing done");

        self.reset_variables(VariableKind::Response);
        self.reset_variables(VariableKind::Outcome);
        self.state.uncommitted_responses.clear();
        Ok(())
    }

    pub fn enter_item(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("enterItem", &[ItemPhase::Initialized])?;
        tracing::debug!(item = %self.item.identifier, at = %t, "entering item");
        self.state.timing.enter(t);
        self.state.presented = true;
        if self.state.completion_status == CompletionStatus::NotAttempted {
            self.state.completion_status = CompletionStatus::Unknown;
        }
        Ok(())
    }

    /// Parses and checks raw candidate input. Bad input never raises: it is
    /// recorded in the unbound or invalid set. Returns whether every
    /// response bound and validated.
    pub fn bind_responses(
        &mut self,
        t: OffsetDateTime,
        raw: &BTreeMap<Identifier, Vec<String>>,
    ) -> Result<bool, EngineError> {
        self.require("bindResponses", &[ItemPhase::Interacting])?;
        self.state.timing.touch(t);
        self.state.unbound_responses.clear();
        self.state.invalid_responses.clear();

        for interaction in self.item.interactions.iter().filter(|i| i.is_end_attempt()) {
            self.state
                .uncommitted_responses
                .insert(interaction.response_identifier.clone(), Value::boolean(false));
        }

        for (identifier, strings) in raw {
            let Some(declaration) = self
                .item
                .declaration(identifier.as_str())
                .filter(|d| d.kind == VariableKind::Response)
            else {
                self.notify(format!("response '{}' is not declared", identifier));
                self.state.unbound_responses.insert(identifier.clone());
                continue;
            };
            self.state
                .raw_responses
                .insert(identifier.clone(), strings.clone());
            let value = match parse_response(declaration, strings) {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(response = %identifier, %err, "response not bound");
                    self.state.unbound_responses.insert(identifier.clone());
                    continue;
                }
            };
            if let Some(interaction) = self.item.interaction_for(identifier.as_str()) {
                if let Err(reason) = check_constraints(interaction, &value) {
                    tracing::debug!(response = %identifier, %reason, "response invalid");
                    self.state.invalid_responses.insert(identifier.clone());
                }
            }
            self.state
                .uncommitted_responses
                .insert(identifier.clone(), value);
        }

        self.state.responded = true;
        self.state.session_status = SessionStatus::PendingResponseProcessing;
        Ok(self.state.responses_valid())
    }

    /// Moves bound values into the response variables.
    pub fn commit_responses(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("commitResponses", &[ItemPhase::Interacting])?;
        self.state.timing.touch(t);
        self.commit();
        Ok(())
    }

    fn commit(&mut self) {
        let pending = std::mem::take(&mut self.state.uncommitted_responses);
        self.state.response_values.extend(pending);
    }

    /// Scores the current attempt. Uncommitted responses are committed
    /// first.
    pub fn perform_response_processing(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("response processing", &[ItemPhase::Interacting])?;
        if !self.state.responded {
            return Err(StateError::IllegalTransition {
                operation: "response processing",
                phase: format!("{} with no bound responses", self.phase()),
            }
            .into());
        }
        self.state.timing.touch(t);
        self.commit();

        let fired: Vec<(Identifier, Value)> = self
            .state
            .response_values
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        let counts = end_attempt_fired(self.item, &fired).unwrap_or(true);
        if counts {
            self.state.num_attempts += 1;
        }
        if !self.item.adaptive {
            self.reset_variables(VariableKind::Outcome);
        }

        let outcome = {
            let mut scope = ItemScope::new(self.item, self.state);
            let mut ctx = EvalContext::new(&mut scope, self.runtime, self.extensions);
            run_rules(&self.item.response_processing, &mut ctx)?
        };
        tracing::debug!(
            item = %self.item.identifier,
            attempts = self.state.num_attempts,
            ?outcome,
            "response processing done"
        );

        if !self.item.adaptive {
            self.state.completion_status = CompletionStatus::Completed;
        }
        if self.is_attempt_allowed() {
            self.state.session_status = SessionStatus::PendingSubmission;
        } else {
            self.close(t);
        }
        Ok(())
    }

    /// Adaptive items run until they declare themselves completed;
    /// non-adaptive items until `max_attempts` is used up.
    pub fn is_attempt_allowed(&self) -> bool {
        if self.item.adaptive {
            self.state.completion_status != CompletionStatus::Completed
        } else {
            let max = self.settings.max_attempts;
            max == 0 || self.state.num_attempts < max
        }
    }

    pub fn suspend(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("suspend", &[ItemPhase::Interacting])?;
        self.state.timing.pause(t);
        self.state.suspended = true;
        Ok(())
    }

    pub fn resume(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require("resume", &[ItemPhase::Suspended])?;
        self.state.suspended = false;
        self.state.timing.resume(t);
        Ok(())
    }

    /// Closes the session; no further responses are accepted.
    pub fn end_item(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require(
            "endItem",
            &[
                ItemPhase::Initialized,
                ItemPhase::Interacting,
                ItemPhase::Suspended,
            ],
        )?;
        self.close(t);
        Ok(())
    }

    fn close(&mut self, t: OffsetDateTime) {
        tracing::debug!(item = %self.item.identifier, at = %t, "closing item session");
        self.state.suspended = false;
        self.state.timing.end(t);
        self.state.session_status = SessionStatus::Final;
    }

    /// Discards responses, outcomes and attempts but keeps template values
    /// and accumulated duration. A closed session is reopened.
    pub fn reset_soft(&mut self, t: OffsetDateTime) -> Result<(), EngineError> {
        self.require(
            "resetSoft",
            &[
                ItemPhase::Initialized,
                ItemPhase::Interacting,
                ItemPhase::Closed,
            ],
        )?;
        tracing::debug!(item = %self.item.identifier, "soft reset");
        self.clear_attempts();
        if self.state.is_closed() {
            self.state.timing.reopen(t);
        }
        Ok(())
    }

    /// Like [`reset_soft`](Self::reset_soft) but also reshuffles and reruns
    /// template processing.
    pub fn reset_hard(
        &mut self,
        t: OffsetDateTime,
        template_defaults: &BTreeMap<Identifier, Value>,
    ) -> Result<(), EngineError> {
        self.require(
            "resetHard",
            &[
                ItemPhase::Initialized,
                ItemPhase::Interacting,
                ItemPhase::Closed,
            ],
        )?;
        tracing::debug!(item = %self.item.identifier, "hard reset");
        self.clear_attempts();
        if self.state.is_closed() {
            self.state.timing.reopen(t);
        }
        self.state.overridden_defaults.clear();
        self.state.overridden_correct_responses.clear();
        self.reset_variables(VariableKind::Template);
        self.shuffle();
        self.perform_template_processing(t, template_defaults)
    }

    fn clear_attempts(&mut self) {
        self.reset_variables(VariableKind::Response);
        self.reset_variables(VariableKind::Outcome);
        self.state.uncommitted_responses.clear();
        self.state.raw_responses.clear();
        self.state.unbound_responses.clear();
        self.state.invalid_responses.clear();
        self.state.candidate_comment = None;
        self.state.responded = false;
        self.state.num_attempts = 0;
        self.state.session_status = SessionStatus::Initial;
        self.state.completion_status = if self.state.presented {
            CompletionStatus::Unknown
        } else {
            CompletionStatus::NotAttempted
        };
    }

    /// An empty comment clears the current one.
    pub fn set_candidate_comment(
        &mut self,
        t: OffsetDateTime,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        if !self.settings.allow_comment {
            return Err(StateError::CommentNotAllowed {
                item: self.item.identifier.to_string(),
            }
            .into());
        }
        self.require("setCandidateComment", &[ItemPhase::Interacting])?;
        self.state.timing.touch(t);
        self.state.candidate_comment = comment.filter(|c| !c.is_empty());
        Ok(())
    }

    /// Folds elapsed time into the duration of an open session.
    pub fn touch_duration(&mut self, t: OffsetDateTime) {
        if self.phase() == ItemPhase::Interacting {
            self.state.timing.touch(t);
        }
    }

    // ── read helpers ──────────────────────────

    pub fn is_correct(&self) -> Correctness {
        item_correctness(self.item, self.state)
    }

    /// Response variables whose value equals their correct response.
    pub fn count_correct(&self) -> usize {
        self.compared_responses().filter(|same| *same).count()
    }

    /// Response variables whose value differs from their correct response.
    pub fn count_incorrect(&self) -> usize {
        self.compared_responses().filter(|same| !*same).count()
    }

    fn compared_responses(&self) -> impl Iterator<Item = bool> + '_ {
        self.item
            .declarations_of(VariableKind::Response)
            .filter_map(move |declaration| {
                let name = declaration.identifier.as_str();
                let correct = item_correct_response(self.item, self.state, name)?;
                if correct.is_null() {
                    return None;
                }
                let actual = self.state.response_values.get(name).cloned().unwrap_or_default();
                Some(actual == correct)
            })
    }

    pub fn item_result(&self, t: OffsetDateTime) -> ItemResult {
        ItemResult {
            identifier: self.item.identifier.clone(),
            date_stamp: t,
            session_status: self.state.session_status,
            num_attempts: self.state.num_attempts,
            completion_status: self.state.completion_status,
            duration: self.state.duration(),
            template_values: self.state.template_values.clone(),
            response_values: self.state.response_values.clone(),
            outcome_values: self.state.outcome_values.clone(),
            shuffled_choice_orders: self.state.shuffled_choice_orders.clone(),
            candidate_comment: self.state.candidate_comment.clone(),
        }
    }

    // ── internals ─────────────────────────────

    fn reset_variables(&mut self, kind: VariableKind) {
        let values: BTreeMap<Identifier, Value> = self
            .item
            .declarations_of(kind)
            .map(|d| {
                let value = item_default(self.item, self.state, d.identifier.as_str())
                    .unwrap_or_default();
                (d.identifier.clone(), value)
            })
            .collect();
        match kind {
            VariableKind::Template => self.state.template_values = values,
            VariableKind::Response => self.state.response_values = values,
            VariableKind::Outcome => self.state.outcome_values = values,
        }
    }

    fn shuffle(&mut self) {
        self.state.shuffled_choice_orders.clear();
        for interaction in self.item.interactions.iter().filter(|i| i.shuffle) {
            let order = shuffle_choices(interaction, self.runtime.rng());
            self.state
                .shuffled_choice_orders
                .insert(interaction.response_identifier.clone(), order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 09:00:00 UTC);
    const T1: OffsetDateTime = datetime!(2024-05-01 09:00:40 UTC);
    const T2: OffsetDateTime = datetime!(2024-05-01 09:01:00 UTC);

    fn choice_item() -> AssessmentItem {
        serde_json::from_value(json!({
            "identifier": "Q1",
            "declarations": [
                {"identifier": "RESPONSE", "kind": "response", "cardinality": "single",
                 "baseType": "identifier",
                 "response": {"correctResponse": {"single": {"identifier": "ChoiceA"}}}},
                {"identifier": "SCORE", "kind": "outcome", "cardinality": "single",
                 "baseType": "float", "defaultValue": {"single": {"float": 0.0}}}
            ],
            "interactions": [
                {"responseIdentifier": "RESPONSE", "kind": "choice", "maxChoices": 1,
                 "shuffle": true,
                 "choices": [{"identifier": "ChoiceA"}, {"identifier": "ChoiceB"},
                             {"identifier": "ChoiceC", "fixed": true}]}
            ],
            "responseProcessing": [
                {"condition": {"branches": [{
                    "guard": {"match": [
                        {"variable": {"identifier": "RESPONSE"}},
                        {"correct": {"identifier": "RESPONSE"}}
                    ]},
                    "rules": [{"setValue": {"identifier": "SCORE",
                        "expression": {"baseValue": {"integer": 1}}}}]
                }]}}
            ]
        }))
        .unwrap()
    }

    fn raw(pairs: &[(&str, &[&str])]) -> BTreeMap<Identifier, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (Identifier::new(k), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    struct Harness {
        resolved: ResolvedItem,
        state: ItemSessionState,
        extensions: ExtensionRegistry,
        runtime: Runtime,
        settings: ItemSessionSettings,
    }

    impl Harness {
        fn new(item: AssessmentItem) -> Self {
            let extensions = ExtensionRegistry::new();
            Harness {
                resolved: ResolvedItem::new(item, &extensions),
                state: ItemSessionState::new(),
                extensions,
                runtime: Runtime::seeded(7),
                settings: ItemSessionSettings::default(),
            }
        }

        fn controller(&mut self) -> ItemSessionController<'_> {
            ItemSessionController::new(
                &self.resolved,
                &mut self.state,
                self.settings.clone(),
                &self.extensions,
                &mut self.runtime,
            )
            .unwrap()
        }

        fn started(item: AssessmentItem) -> Self {
            let mut h = Harness::new(item);
            let mut c = h.controller();
            c.initialize(T0).unwrap();
            c.perform_template_processing(T0, &BTreeMap::new()).unwrap();
            c.enter_item(T0).unwrap();
            h
        }
    }

    #[test]
    fn correct_choice_scores_and_closes() {
        let mut h = Harness::started(choice_item());
        let mut c = h.controller();
        assert_eq!(c.phase(), ItemPhase::Interacting);
        assert!(c
            .bind_responses(T1, &raw(&[("RESPONSE", &["ChoiceA"])]))
            .unwrap());
        c.perform_response_processing(T1).unwrap();

        assert_eq!(c.phase(), ItemPhase::Closed);
        assert_eq!(c.is_correct(), Correctness::Correct);
        let state = c.state();
        assert_eq!(state.outcome_values["SCORE"], Value::float(1.0));
        assert_eq!(state.num_attempts, 1);
        assert_eq!(state.session_status, SessionStatus::Final);
        assert_eq!(state.completion_status, CompletionStatus::Completed);
        assert_eq!(state.duration(), 40.0);
    }

    #[test]
    fn initialize_sets_builtins_and_shuffles() {
        let mut h = Harness::new(choice_item());
        let mut c = h.controller();
        c.initialize(T0).unwrap();
        assert_eq!(c.phase(), ItemPhase::Initialized);
        let state = c.state();
        assert_eq!(state.num_attempts, 0);
        assert_eq!(state.completion_status, CompletionStatus::NotAttempted);
        let order = &state.shuffled_choice_orders["RESPONSE"];
        assert_eq!(order.len(), 3);
        assert_eq!(order[2].as_str(), "ChoiceC");
    }

    #[test]
    fn illegal_calls_name_operation_and_phase() {
        let mut h = Harness::new(choice_item());
        let mut c = h.controller();
        let err = c.enter_item(T0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal transition: enterItem is not allowed while not initialized"
        );
        c.initialize(T0).unwrap();
        assert!(matches!(
            c.initialize(T0),
            Err(EngineError::State(StateError::IllegalTransition { .. }))
        ));
        assert!(c.bind_responses(T0, &BTreeMap::new()).is_err());
        c.enter_item(T0).unwrap();
        // nothing bound yet
        assert!(c.perform_response_processing(T0).is_err());
    }

    #[test]
    fn bad_input_goes_to_unbound_or_invalid() {
        let mut item = choice_item();
        item.declarations.push(
            serde_json::from_value(json!({"identifier": "N", "kind": "response",
                "cardinality": "single", "baseType": "integer"}))
            .unwrap(),
        );
        let mut h = Harness::started(item);
        let mut c = h.controller();
        let ok = c
            .bind_responses(
                T1,
                &raw(&[("RESPONSE", &["Nope"]), ("N", &["x"]), ("GHOST", &["1"])]),
            )
            .unwrap();
        assert!(!ok);
        let state = c.state();
        assert!(state.invalid_responses.contains("RESPONSE"));
        assert!(state.unbound_responses.contains("N"));
        assert!(state.unbound_responses.contains("GHOST"));
        assert_eq!(state.session_status, SessionStatus::PendingResponseProcessing);
    }

    #[test]
    fn unlimited_attempts_stay_open() {
        let mut h = Harness::new(choice_item());
        h.settings.max_attempts = 0;
        {
            let mut c = h.controller();
            c.initialize(T0).unwrap();
            c.perform_template_processing(T0, &BTreeMap::new()).unwrap();
            c.enter_item(T0).unwrap();
            c.bind_responses(T1, &raw(&[("RESPONSE", &["ChoiceB"])]))
                .unwrap();
            c.perform_response_processing(T1).unwrap();
            assert_eq!(c.phase(), ItemPhase::Interacting);
            assert_eq!(c.state().session_status, SessionStatus::PendingSubmission);
            assert_eq!(c.count_incorrect(), 1);

            c.bind_responses(T2, &raw(&[("RESPONSE", &["ChoiceA"])]))
                .unwrap();
            c.perform_response_processing(T2).unwrap();
            assert_eq!(c.state().num_attempts, 2);
            assert_eq!(c.count_correct(), 1);
        }
        assert_eq!(h.state.outcome_values["SCORE"], Value::float(1.0));
    }

    #[test]
    fn end_attempt_without_count_keeps_attempts() {
        let mut item = choice_item();
        item.declarations.push(
            serde_json::from_value(json!({"identifier": "HINT", "kind": "response",
                "cardinality": "single", "baseType": "boolean"}))
            .unwrap(),
        );
        item.interactions.push(
            serde_json::from_value(json!({"responseIdentifier": "HINT",
                "kind": {"endAttempt": {"countAttempt": false}}}))
            .unwrap(),
        );
        let mut h = Harness::started(item);
        h.settings.max_attempts = 0;
        let mut c = h.controller();
        c.bind_responses(T1, &raw(&[("HINT", &["true"])])).unwrap();
        c.perform_response_processing(T1).unwrap();
        assert_eq!(c.state().num_attempts, 0);

        // the end-attempt response falls back to false on the next bind
        c.bind_responses(T2, &raw(&[("RESPONSE", &["ChoiceB"])]))
            .unwrap();
        c.perform_response_processing(T2).unwrap();
        assert_eq!(c.state().num_attempts, 1);
        assert_eq!(c.state().response_values["HINT"], Value::boolean(false));
    }

    #[test]
    fn adaptive_items_close_when_completed() {
        let mut item = choice_item();
        item.adaptive = true;
        item.response_processing = serde_json::from_value(json!([
            {"condition": {"branches": [{
                "guard": {"match": [
                    {"variable": {"identifier": "RESPONSE"}},
                    {"correct": {"identifier": "RESPONSE"}}
                ]},
                "rules": [{"setValue": {"identifier": "completionStatus",
                    "expression": {"baseValue": {"identifier": "completed"}}}}]
            }]}}
        ]))
        .unwrap();
        let mut h = Harness::started(item);
        let mut c = h.controller();
        c.bind_responses(T1, &raw(&[("RESPONSE", &["ChoiceB"])]))
            .unwrap();
        c.perform_response_processing(T1).unwrap();
        assert_eq!(c.phase(), ItemPhase::Interacting);
        c.bind_responses(T2, &raw(&[("RESPONSE", &["ChoiceA"])]))
            .unwrap();
        c.perform_response_processing(T2).unwrap();
        assert_eq!(c.phase(), ItemPhase::Closed);
    }

    fn templated_item(constraint: serde_json::Value) -> AssessmentItem {
        serde_json::from_value(json!({
            "identifier": "T",
            "declarations": [
                {"identifier": "A", "kind": "template", "cardinality": "single",
                 "baseType": "integer", "defaultValue": {"single": {"integer": 0}}},
                {"identifier": "SCORE", "kind": "outcome", "cardinality": "single",
                 "baseType": "integer"}
            ],
            "templateProcessing": [
                {"setValue": {"identifier": "A",
                    "expression": {"randomInteger": {"min": 1, "max": 9}}}},
                {"templateConstraint": constraint}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn template_constraint_retries_until_it_holds() {
        let item = templated_item(json!({"gt": [
            {"variable": {"identifier": "A"}}, {"baseValue": {"integer": 5}}
        ]}));
        let mut h = Harness::new(item);
        let mut c = h.controller();
        c.initialize(T0).unwrap();
        c.perform_template_processing(T0, &BTreeMap::new()).unwrap();
        let a = c.state().template_values["A"].as_i64().unwrap();
        assert!((6..=9).contains(&a));
    }

    #[test]
    fn unsatisfiable_constraint_is_a_configuration_error() {
        let item = templated_item(json!({"baseValue": {"boolean": false}}));
        let mut h = Harness::new(item);
        h.settings.template_processing_limit = 5;
        let mut c = h.controller();
        c.initialize(T0).unwrap();
        let err = c
            .perform_template_processing(T0, &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Configuration(ConfigurationError::TemplateConstraintExhausted {
                item: "T".to_string(),
                tries: 5,
            })
        );
    }

    #[test]
    fn template_defaults_override_declared_defaults() {
        let mut item = templated_item(json!({"baseValue": {"boolean": true}}));
        item.template_processing.truncate(0);
        let mut h = Harness::new(item);
        let mut c = h.controller();
        c.initialize(T0).unwrap();
        let defaults = BTreeMap::from([(Identifier::new("A"), Value::integer(42))]);
        c.perform_template_processing(T0, &defaults).unwrap();
        assert_eq!(c.state().template_values["A"], Value::integer(42));
    }

    #[test]
    fn suspend_stops_the_clock() {
        let mut h = Harness::started(choice_item());
        let mut c = h.controller();
        c.suspend(datetime!(2024-05-01 09:00:10 UTC)).unwrap();
        assert_eq!(c.phase(), ItemPhase::Suspended);
        assert!(c.suspend(T1).is_err());
        c.resume(datetime!(2024-05-01 09:00:50 UTC)).unwrap();
        c.touch_duration(T2);
        assert_eq!(c.state().duration(), 20.0);
    }

    #[test]
    fn soft_reset_reopens_and_forgets_attempts() {
        let mut h = Harness::started(choice_item());
        let mut c = h.controller();
        c.bind_responses(T1, &raw(&[("RESPONSE", &["ChoiceA"])]))
            .unwrap();
        c.perform_response_processing(T1).unwrap();
        assert_eq!(c.phase(), ItemPhase::Closed);

        c.reset_soft(T2).unwrap();
        assert_eq!(c.phase(), ItemPhase::Interacting);
        let state = c.state();
        assert_eq!(state.num_attempts, 0);
        assert_eq!(state.outcome_values["SCORE"], Value::float(0.0));
        assert_eq!(state.response_values["RESPONSE"], Value::Null);
        assert_eq!(state.completion_status, CompletionStatus::Unknown);
    }

    #[test]
    fn comments_need_permission() {
        let mut h = Harness::started(choice_item());
        {
            let mut c = h.controller();
            assert!(matches!(
                c.set_candidate_comment(T1, Some("hi".into())),
                Err(EngineError::State(StateError::CommentNotAllowed { .. }))
            ));
        }
        h.settings.allow_comment = true;
        let mut c = h.controller();
        c.set_candidate_comment(T1, Some("hi".into())).unwrap();
        assert_eq!(c.item_result(T1).candidate_comment.as_deref(), Some("hi"));
    }

    #[test]
    fn invalid_definitions_are_refused() {
        let mut item = choice_item();
        item.response_processing = serde_json::from_value(json!([
            {"setValue": {"identifier": "MISSING",
                "expression": {"baseValue": {"integer": 1}}}}
        ]))
        .unwrap();
        let extensions = ExtensionRegistry::new();
        let resolved = ResolvedItem::new(item, &extensions);
        let mut state = ItemSessionState::new();
        let mut runtime = Runtime::seeded(1);
        let result = ItemSessionController::new(
            &resolved,
            &mut state,
            ItemSessionSettings::default(),
            &extensions,
            &mut runtime,
        );
        assert!(matches!(result, Err(EngineError::InvalidDefinition { .. })));
    }
}
