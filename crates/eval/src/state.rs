//! Serializable runtime state for item and test sessions.
//!
//! State structs are plain data. The controllers own the rules for changing
//! them; a persistence layer only needs serde.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plan::{TestPlan, TestPlanNodeKey};
use crate::types::{BranchTarget, CompletionStatus, Identifier, Value};

// ──────────────────────────────────────────────
// Timing
// ──────────────────────────────────────────────

/// Entry/end/exit timestamps plus an accumulated duration.
///
/// Duration grows only when [`Timing::touch`] is called with a
/// caller-supplied timestamp while an interval is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub entry_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub exit_time: Option<OffsetDateTime>,
    /// Seconds accumulated over closed intervals.
    #[serde(default)]
    pub duration_accumulated: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub interval_start: Option<OffsetDateTime>,
}

impl Timing {
    pub fn is_entered(&self) -> bool {
        self.entry_time.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn is_exited(&self) -> bool {
        self.exit_time.is_some()
    }

    /// Entered and not yet ended.
    pub fn is_open(&self) -> bool {
        self.is_entered() && !self.is_ended()
    }

    pub fn enter(&mut self, t: OffsetDateTime) {
        self.entry_time = Some(t);
        self.interval_start = Some(t);
    }

    /// Folds the open interval into the accumulated duration and restarts
    /// it at `t`. Timestamps earlier than the interval start add nothing.
    pub fn touch(&mut self, t: OffsetDateTime) {
        if let Some(start) = self.interval_start {
            let delta = (t - start).as_seconds_f64();
            if delta > 0.0 {
                self.duration_accumulated += delta;
                self.interval_start = Some(t);
            }
        }
    }

    /// Stops the clock without ending.
    pub fn pause(&mut self, t: OffsetDateTime) {
        self.touch(t);
        self.interval_start = None;
    }

    pub fn resume(&mut self, t: OffsetDateTime) {
        if self.is_open() && self.interval_start.is_none() {
            self.interval_start = Some(t);
        }
    }

    pub fn end(&mut self, t: OffsetDateTime) {
        self.pause(t);
        self.end_time = Some(t);
    }

    pub fn exit(&mut self, t: OffsetDateTime) {
        if !self.is_ended() {
            self.end(t);
        }
        self.exit_time = Some(t);
    }

    /// Reopens an ended timing, keeping the accumulated duration.
    pub fn reopen(&mut self, t: OffsetDateTime) {
        self.end_time = None;
        self.exit_time = None;
        if self.is_entered() {
            self.interval_start = Some(t);
        }
    }

    pub fn reset(&mut self) {
        *self = Timing::default();
    }

    /// Accumulated seconds.
    pub fn duration(&self) -> f64 {
        self.duration_accumulated
    }
}

// ──────────────────────────────────────────────
// Item session state
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    #[default]
    Initial,
    PendingSubmission,
    PendingResponseProcessing,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSessionState {
    pub initialized: bool,
    pub presented: bool,
    pub responded: bool,
    pub suspended: bool,
    pub num_attempts: u32,
    pub completion_status: CompletionStatus,
    pub session_status: SessionStatus,
    #[serde(default)]
    pub shuffled_choice_orders: BTreeMap<Identifier, Vec<Identifier>>,
    #[serde(default)]
    pub template_values: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub response_values: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub outcome_values: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub uncommitted_responses: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub raw_responses: BTreeMap<Identifier, Vec<String>>,
    /// Defaults replaced by `setDefaultValue` during template processing.
    #[serde(default)]
    pub overridden_defaults: BTreeMap<Identifier, Value>,
    /// Correct responses replaced by `setCorrectResponse`.
    #[serde(default)]
    pub overridden_correct_responses: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub candidate_comment: Option<String>,
    #[serde(default)]
    pub unbound_responses: BTreeSet<Identifier>,
    #[serde(default)]
    pub invalid_responses: BTreeSet<Identifier>,
    #[serde(default)]
    pub precondition_failed: bool,
    #[serde(default)]
    pub jumped_by_branch_rule: bool,
}

impl ItemSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.timing.is_ended()
    }

    pub fn is_entered(&self) -> bool {
        self.timing.is_entered()
    }

    /// Every bound response parsed and passed its interaction's checks.
    pub fn responses_valid(&self) -> bool {
        self.unbound_responses.is_empty() && self.invalid_responses.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.timing.duration()
    }
}

// ──────────────────────────────────────────────
// Test session state
// ──────────────────────────────────────────────

/// Control-object state shared by test parts and sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlObjectState {
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub precondition_failed: bool,
    #[serde(default)]
    pub jumped_by_branch_rule: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_target: Option<BranchTarget>,
}

pub type TestPartSessionState = ControlObjectState;
pub type SectionSessionState = ControlObjectState;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSessionState {
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_test_part: Option<TestPlanNodeKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<TestPlanNodeKey>,
    #[serde(default)]
    pub outcome_values: BTreeMap<Identifier, Value>,
    #[serde(default)]
    pub test_parts: BTreeMap<TestPlanNodeKey, TestPartSessionState>,
    #[serde(default)]
    pub sections: BTreeMap<TestPlanNodeKey, SectionSessionState>,
    #[serde(default)]
    pub items: BTreeMap<TestPlanNodeKey, ItemSessionState>,
}

impl TestSessionState {
    /// Fresh state with an entry for every node of `plan`.
    pub fn new(plan: &TestPlan) -> Self {
        let mut state = TestSessionState::default();
        for node in plan.nodes() {
            match node.kind {
                crate::plan::NodeKind::TestPart => {
                    state
                        .test_parts
                        .insert(node.key.clone(), ControlObjectState::default());
                }
                crate::plan::NodeKind::Section => {
                    state
                        .sections
                        .insert(node.key.clone(), ControlObjectState::default());
                }
                crate::plan::NodeKind::ItemRef => {
                    state
                        .items
                        .insert(node.key.clone(), ItemSessionState::default());
                }
            }
        }
        state
    }

    pub fn item(&self, key: &TestPlanNodeKey) -> Option<&ItemSessionState> {
        self.items.get(key)
    }

    pub fn is_ended(&self) -> bool {
        self.timing.is_ended()
    }

    pub fn is_exited(&self) -> bool {
        self.timing.is_exited()
    }
}
