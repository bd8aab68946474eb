//! Item processing conformance suite.
//!
//! Each fixture under `tests/fixtures/` holds an item definition, the
//! responses submitted on successive attempts and the expected session
//! state afterwards. The runner drives a fresh item session through
//! initialize, template processing and one bind/score cycle per attempt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use qti_eval::{
    AssessmentItem, ExtensionRegistry, Identifier, ItemSessionController, ItemSessionSettings,
    ItemSessionState, ResolvedItem, Runtime, SessionStatus, Value,
};
use serde::Deserialize;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

const START: OffsetDateTime = datetime!(2024-05-01 09:00:00 UTC);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemFixture {
    item: AssessmentItem,
    #[serde(default)]
    settings: ItemSessionSettings,
    #[serde(default)]
    seed: Option<u64>,
    attempts: Vec<BTreeMap<Identifier, Vec<String>>>,
    expected: Expected,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Expected {
    outcomes: BTreeMap<Identifier, Value>,
    num_attempts: u32,
    session_status: SessionStatus,
}

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn run_item_fixture(name: &str) {
    let path = fixture_dir().join(format!("{}.json", name));
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {}", name, e));
    let fixture: ItemFixture = serde_json::from_str(&text)
        .unwrap_or_else(|e| panic!("Invalid fixture JSON for {}: {}", name, e));

    let extensions = ExtensionRegistry::new();
    let resolved = ResolvedItem::new(fixture.item, &extensions);
    let mut state = ItemSessionState::new();
    let mut runtime = Runtime::seeded(fixture.seed.unwrap_or(1));
    let mut session = ItemSessionController::new(
        &resolved,
        &mut state,
        fixture.settings,
        &extensions,
        &mut runtime,
    )
    .unwrap_or_else(|e| panic!("{} is not a valid item: {}", name, e));

    session.initialize(START).unwrap();
    session
        .perform_template_processing(START, &BTreeMap::new())
        .unwrap();
    session.enter_item(START).unwrap();
    for (n, responses) in fixture.attempts.iter().enumerate() {
        let t = START + Duration::seconds(10 * (n as i64 + 1));
        session
            .bind_responses(t, responses)
            .unwrap_or_else(|e| panic!("{}: binding attempt {} failed: {}", name, n + 1, e));
        session
            .perform_response_processing(t)
            .unwrap_or_else(|e| panic!("{}: scoring attempt {} failed: {}", name, n + 1, e));
    }

    for (identifier, expected) in &fixture.expected.outcomes {
        let actual = state.outcome_values.get(identifier).cloned().unwrap_or_default();
        assert_eq!(
            &actual, expected,
            "Outcome mismatch for {} in {}",
            identifier, name
        );
    }
    assert_eq!(state.num_attempts, fixture.expected.num_attempts, "{}", name);
    assert_eq!(state.session_status, fixture.expected.session_status, "{}", name);
}

#[test]
fn choice_correct() {
    run_item_fixture("choice_correct");
}

#[test]
fn mapped_multiple() {
    run_item_fixture("mapped_multiple");
}

#[test]
fn second_attempt() {
    run_item_fixture("second_attempt");
}
