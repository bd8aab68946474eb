use super::*;
use serde_json::json;
use time::macros::datetime;

use crate::state::SessionStatus;
use crate::types::AssessmentTest;
use rand::Rng;

const T0: OffsetDateTime = datetime!(2024-05-01 09:00:00 UTC);
const T1: OffsetDateTime = datetime!(2024-05-01 09:00:40 UTC);
const T2: OffsetDateTime = datetime!(2024-05-01 09:01:00 UTC);
const T3: OffsetDateTime = datetime!(2024-05-01 09:01:40 UTC);

fn choice_item(identifier: &str) -> AssessmentItem {
    serde_json::from_value(json!({
        "identifier": identifier,
        "declarations": [
            {"identifier": "RESPONSE", "kind": "response", "cardinality": "single",
             "baseType": "identifier",
             "response": {"correctResponse": {"single": {"identifier": "ChoiceA"}}}},
            {"identifier": "SCORE", "kind": "outcome", "cardinality": "single",
             "baseType": "float", "defaultValue": {"single": {"float": 0.0}}}
        ],
        "interactions": [
            {"responseIdentifier": "RESPONSE", "kind": "choice", "maxChoices": 1,
             "choices": [{"identifier": "ChoiceA"}, {"identifier": "ChoiceB"}]}
        ],
        "responseProcessing": [
            {"condition": {"branches": [{
                "guard": {"match": [
                    {"variable": {"identifier": "RESPONSE"}},
                    {"correct": {"identifier": "RESPONSE"}}
                ]},
                "rules": [{"setValue": {"identifier": "SCORE",
                    "expression": {"baseValue": {"float": 1.0}}}}]
            }]}}
        ]
    }))
    .unwrap()
}

fn item_bank() -> BTreeMap<String, AssessmentItem> {
    ["Q1", "Q2", "Q3", "Q4"]
        .into_iter()
        .map(|id| (format!("{}.xml", id.to_lowercase()), choice_item(id)))
        .collect()
}

fn item_ref(identifier: &str) -> serde_json::Value {
    json!({"itemRef": {"identifier": identifier,
                       "href": format!("{}.xml", identifier.to_lowercase())}})
}

fn assessment(parts: serde_json::Value) -> AssessmentTest {
    serde_json::from_value(json!({
        "identifier": "T",
        "declarations": [
            {"identifier": "TOTAL", "kind": "outcome", "cardinality": "single",
             "baseType": "integer", "defaultValue": {"single": {"integer": 0}}}
        ],
        "testParts": parts,
        "outcomeProcessing": [
            {"setValue": {"identifier": "TOTAL", "expression": {"numberCorrect": {}}}}
        ]
    }))
    .unwrap()
}

fn raw(choice: &str) -> BTreeMap<Identifier, Vec<String>> {
    BTreeMap::from([(Identifier::new("RESPONSE"), vec![choice.to_string()])])
}

struct Harness {
    resolved: ResolvedTest,
    plan: TestPlan,
    state: TestSessionState,
    extensions: ExtensionRegistry,
    runtime: Runtime,
}

impl Harness {
    fn new(test: AssessmentTest) -> Self {
        let extensions = ExtensionRegistry::new();
        let resolved = ResolvedTest::resolve(test, &item_bank(), &extensions);
        let mut runtime = Runtime::seeded(11);
        let plan = TestSessionController::plan(&resolved, &mut runtime);
        let state = TestSessionState::new(&plan);
        Harness {
            resolved,
            plan,
            state,
            extensions,
            runtime,
        }
    }

    fn started(test: AssessmentTest) -> Self {
        let mut h = Harness::new(test);
        let mut c = h.controller();
        c.initialize(T0).unwrap();
        c.enter_test(T0).unwrap();
        assert!(matches!(
            c.enter_next_available_test_part(T0).unwrap(),
            Navigation::TestPartEntered(_)
        ));
        h
    }

    fn controller(&mut self) -> TestSessionController<'_> {
        TestSessionController::new(
            &self.resolved,
            &self.plan,
            &mut self.state,
            TestSessionSettings::default(),
            &self.extensions,
            &mut self.runtime,
        )
        .unwrap()
    }

    fn key(&self, identifier: &str) -> TestPlanNodeKey {
        self.plan.nodes_for(identifier)[0].key.clone()
    }

    fn item(&self, identifier: &str) -> &ItemSessionState {
        &self.state.items[&self.key(identifier)]
    }
}

fn linear_part(extra: serde_json::Value, sections: serde_json::Value) -> serde_json::Value {
    let mut part = json!({"identifier": "P1", "sections": sections});
    if let (Some(part), Some(extra)) = (part.as_object_mut(), extra.as_object()) {
        part.extend(extra.clone());
    }
    json!([part])
}

#[test]
fn linear_walk_scores_each_item() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [item_ref("Q1"), item_ref("Q2")]}]),
    ));
    let mut h = Harness::started(test);
    let q1 = h.key("Q1");
    let q2 = h.key("Q2");
    let mut c = h.controller();
    assert_eq!(c.state().current_item.as_ref(), Some(&q1));

    assert_eq!(
        c.handle_responses(T1, &raw("ChoiceA")).unwrap(),
        ResponseHandling::Bound { valid: true }
    );
    assert_eq!(c.outcome("TOTAL"), Some(&Value::integer(1)));
    assert_eq!(c.advance_item_linear(T1).unwrap(), Navigation::ItemEntered(q2));
    assert!(c.may_review_item(&q1));

    c.handle_responses(T2, &raw("ChoiceB")).unwrap();
    assert_eq!(c.outcome("TOTAL"), Some(&Value::integer(1)));
    assert_eq!(c.advance_item_linear(T2).unwrap(), Navigation::EndOfTestPart);
    assert!(c.may_end_current_test_part());
    assert_eq!(c.end_current_test_part(T2).unwrap(), Navigation::TestPartEnded);
    assert_eq!(
        c.enter_next_available_test_part(T2).unwrap(),
        Navigation::TestEnded
    );
    assert!(c.state().is_ended());

    let q1_state = h.item("Q1");
    assert_eq!(q1_state.session_status, SessionStatus::Final);
    assert_eq!(q1_state.outcome_values["SCORE"], Value::float(1.0));
    assert_eq!(q1_state.duration(), 40.0);
}

#[test]
fn illegal_navigation_names_the_test_phase() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [item_ref("Q1")]}]),
    ));
    let mut h = Harness::new(test);
    let mut c = h.controller();
    c.initialize(T0).unwrap();
    let err = c.enter_next_available_test_part(T0).unwrap_err();
    assert_eq!(
        err.to_string(),
        "illegal transition: enterNextAvailableTestPart is not allowed while test is initialized"
    );
    assert!(c.initialize(T0).is_err());
}

#[test]
fn exit_section_skips_remaining_items() {
    let test = assessment(linear_part(
        json!({}),
        json!([
            {"identifier": "S1", "children": [
                {"itemRef": {"identifier": "Q1", "href": "q1.xml", "branchRules": [
                    {"target": "EXIT_SECTION", "expression": {"baseValue": {"boolean": true}}}
                ]}},
                item_ref("Q2")
            ]},
            {"identifier": "S2", "children": [item_ref("Q3")]}
        ]),
    ));
    let mut h = Harness::started(test);
    let q3 = h.key("Q3");
    let s1 = h.key("S1");
    let mut c = h.controller();
    assert_eq!(c.advance_item_linear(T1).unwrap(), Navigation::ItemEntered(q3));

    assert!(h.item("Q2").jumped_by_branch_rule);
    assert!(!h.item("Q2").presented);
    assert!(h.state.sections[&s1].timing.is_ended());
}

#[test]
fn branch_to_named_item_marks_skipped_nodes() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [
            {"itemRef": {"identifier": "Q1", "href": "q1.xml", "branchRules": [
                {"target": "Q4", "expression": {"baseValue": {"boolean": true}}}
            ]}},
            item_ref("Q2"),
            item_ref("Q3"),
            item_ref("Q4")
        ]}]),
    ));
    let mut h = Harness::started(test);
    let q4 = h.key("Q4");
    let mut c = h.controller();
    assert_eq!(c.advance_item_linear(T1).unwrap(), Navigation::ItemEntered(q4));
    assert!(h.item("Q2").jumped_by_branch_rule);
    assert!(h.item("Q3").jumped_by_branch_rule);
    assert!(!h.item("Q4").jumped_by_branch_rule);
}

#[test]
fn failed_item_precondition_is_skipped() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [
            item_ref("Q1"),
            {"itemRef": {"identifier": "Q2", "href": "q2.xml", "preconditions": [
                {"gte": [{"variable": {"identifier": "Q1.SCORE"}},
                         {"baseValue": {"float": 1.0}}]}
            ]}},
            item_ref("Q3")
        ]}]),
    ));
    let mut h = Harness::started(test);
    let q3 = h.key("Q3");
    let mut c = h.controller();
    c.handle_responses(T1, &raw("ChoiceB")).unwrap();
    assert_eq!(c.advance_item_linear(T1).unwrap(), Navigation::ItemEntered(q3));
    assert!(h.item("Q2").precondition_failed);
}

#[test]
fn unanswered_item_cannot_be_skipped() {
    let test = assessment(linear_part(
        json!({"itemSessionControl": {"allowSkipping": false}}),
        json!([{"identifier": "S1", "children": [item_ref("Q1"), item_ref("Q2")]}]),
    ));
    let mut h = Harness::started(test);
    let mut c = h.controller();
    assert!(matches!(
        c.advance_item_linear(T1),
        Err(EngineError::Navigation(NavigationError::CannotSkipItem { .. }))
    ));
    assert!(!c.may_end_current_test_part());
    c.handle_responses(T1, &raw("ChoiceB")).unwrap();
    assert!(matches!(
        c.advance_item_linear(T1).unwrap(),
        Navigation::ItemEntered(_)
    ));
}

#[test]
fn item_minimum_time_holds_the_candidate() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [
            {"itemRef": {"identifier": "Q1", "href": "q1.xml", "timeLimits": {"minTime": 50.0}}},
            item_ref("Q2")
        ]}]),
    ));
    let mut h = Harness::started(test);
    let mut c = h.controller();
    let err = c.advance_item_linear(T1).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Navigation(NavigationError::MinimumTimeNotReached { .. })
    ));
    assert!(matches!(
        c.advance_item_linear(T2).unwrap(),
        Navigation::ItemEntered(_)
    ));
}

fn nonlinear_test() -> AssessmentTest {
    assessment(json!([
        {"identifier": "P1", "navigationMode": "nonlinear",
         "sections": [{"identifier": "S1", "children": [item_ref("Q1"), item_ref("Q2")]}]},
        {"identifier": "P2",
         "sections": [{"identifier": "S2", "children": [item_ref("Q3")]}]}
    ]))
}

#[test]
fn nonlinear_selection_outside_the_part_changes_nothing() {
    let mut h = Harness::started(nonlinear_test());
    let q3 = h.key("Q3");
    let before = h.state.clone();
    let mut c = h.controller();
    assert_eq!(c.state().current_item, None);

    let err = c.select_item_nonlinear(T1, Some(&q3)).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Navigation(NavigationError::InvalidSelection { .. })
    ));
    assert_eq!(h.state, before);
}

#[test]
fn nonlinear_selection_suspends_the_previous_item() {
    let mut h = Harness::started(nonlinear_test());
    let q1 = h.key("Q1");
    let q2 = h.key("Q2");
    let mut c = h.controller();
    assert_eq!(
        c.select_item_nonlinear(T0, Some(&q2)).unwrap(),
        Navigation::ItemEntered(q2.clone())
    );
    assert_eq!(
        c.select_item_nonlinear(T1, Some(&q1)).unwrap(),
        Navigation::ItemEntered(q1.clone())
    );
    assert!(matches!(
        c.advance_item_linear(T1),
        Err(EngineError::Navigation(NavigationError::WrongNavigationMode { .. }))
    ));
    assert_eq!(c.select_item_nonlinear(T2, None).unwrap(), Navigation::Deselected);

    assert!(h.item("Q2").suspended);
    assert_eq!(h.item("Q2").duration(), 40.0);
    assert_eq!(h.item("Q1").duration(), 20.0);
}

#[test]
fn nonlinear_part_ends_into_the_next_part() {
    let mut h = Harness::started(nonlinear_test());
    let q1 = h.key("Q1");
    let q3 = h.key("Q3");
    let p1 = h.key("P1");
    let p2 = h.key("P2");
    let mut c = h.controller();
    c.select_item_nonlinear(T0, Some(&q1)).unwrap();
    c.handle_responses(T1, &raw("ChoiceA")).unwrap();
    assert_eq!(c.end_current_test_part(T1).unwrap(), Navigation::TestPartEnded);
    assert_eq!(c.find_next_enterable_test_part().unwrap(), Some(p2));

    let mut c = h.controller();
    assert!(matches!(
        c.enter_next_available_test_part(T2).unwrap(),
        Navigation::TestPartEntered(_)
    ));
    assert_eq!(c.state().current_item.as_ref(), Some(&q3));
    assert_eq!(c.test_part_phase(&p1), Some(ControlPhase::Exited));
    assert!(h.item("Q2").is_closed());
}

#[test]
fn simultaneous_submission_scores_at_part_end() {
    let test = assessment(linear_part(
        json!({"submissionMode": "simultaneous"}),
        json!([{"identifier": "S1", "children": [item_ref("Q1"), item_ref("Q2")]}]),
    ));
    let mut h = Harness::started(test);
    let mut c = h.controller();
    c.handle_responses(T1, &raw("ChoiceA")).unwrap();
    assert_eq!(c.outcome("TOTAL"), Some(&Value::integer(0)));
    c.advance_item_linear(T1).unwrap();
    c.handle_responses(T2, &raw("ChoiceB")).unwrap();
    assert_eq!(h.item("Q1").num_attempts, 0);
    assert!(h.item("Q1").suspended);

    let mut c = h.controller();
    assert_eq!(c.end_current_test_part(T2).unwrap(), Navigation::TestPartEnded);
    assert_eq!(c.outcome("TOTAL"), Some(&Value::integer(1)));
    assert_eq!(h.item("Q1").num_attempts, 1);
    assert_eq!(h.item("Q1").outcome_values["SCORE"], Value::float(1.0));
    assert!(h.item("Q2").is_closed());
}

#[test]
fn part_time_limit_forces_the_part_to_end() {
    let test = assessment(linear_part(
        json!({"timeLimits": {"maxTime": 60.0}}),
        json!([{"identifier": "S1", "children": [item_ref("Q1"), item_ref("Q2")]}]),
    ));
    let mut h = Harness::started(test);
    let p1 = h.key("P1");
    let mut c = h.controller();
    let late = datetime!(2024-05-01 09:01:01 UTC);
    let ResponseHandling::TimeLimitExceeded(exceeded) =
        c.handle_responses(late, &raw("ChoiceA")).unwrap()
    else {
        panic!("expected the part limit to trip");
    };
    assert_eq!(exceeded.scope, LimitScope::TestPart);
    assert_eq!(exceeded.elapsed, 61.0);
    assert_eq!(c.test_part_phase(&p1), Some(ControlPhase::Ended));
    assert_eq!(
        c.enter_next_available_test_part(late).unwrap(),
        Navigation::TestEnded
    );
    assert!(h.item("Q1").is_closed());
    assert_eq!(h.item("Q1").num_attempts, 0);
}

#[test]
fn part_branch_to_exit_test_ends_the_test() {
    let test = assessment(json!([
        {"identifier": "P1",
         "branchRules": [{"target": "EXIT_TEST", "expression": {"baseValue": {"boolean": true}}}],
         "sections": [{"identifier": "S1", "children": [item_ref("Q1")]}]},
        {"identifier": "P2",
         "sections": [{"identifier": "S2", "children": [item_ref("Q2")]}]}
    ]));
    let mut h = Harness::started(test);
    let p2 = h.key("P2");
    let mut c = h.controller();
    c.advance_item_linear(T1).unwrap();
    c.end_current_test_part(T1).unwrap();
    assert_eq!(c.find_next_enterable_test_part().unwrap(), None);
    assert_eq!(
        c.enter_next_available_test_part(T1).unwrap(),
        Navigation::TestEnded
    );
    assert_eq!(c.test_part_phase(&p2), Some(ControlPhase::NotEntered));
}

#[test]
fn part_precondition_failure_is_recorded() {
    let test = assessment(json!([
        {"identifier": "P1",
         "sections": [{"identifier": "S1", "children": [item_ref("Q1")]}]},
        {"identifier": "P2",
         "preconditions": [{"gte": [{"variable": {"identifier": "TOTAL"}},
                                    {"baseValue": {"integer": 1}}]}],
         "sections": [{"identifier": "S2", "children": [item_ref("Q2")]}]},
        {"identifier": "P3",
         "sections": [{"identifier": "S3", "children": [item_ref("Q3")]}]}
    ]));
    let mut h = Harness::started(test);
    let p2 = h.key("P2");
    let p3 = h.key("P3");
    let mut c = h.controller();
    c.handle_responses(T1, &raw("ChoiceB")).unwrap();
    c.advance_item_linear(T1).unwrap();
    c.end_current_test_part(T1).unwrap();
    assert_eq!(
        c.enter_next_available_test_part(T1).unwrap(),
        Navigation::TestPartEntered(p3)
    );
    assert_eq!(c.test_part_phase(&p2), Some(ControlPhase::PreconditionFailed));
}

#[test]
fn looking_ahead_leaves_the_random_source_alone() {
    let test = assessment(json!([
        {"identifier": "P1",
         "sections": [{"identifier": "S1", "children": [item_ref("Q1")]}]},
        {"identifier": "P2",
         "preconditions": [{"gte": [{"randomInteger": {"min": 0, "max": 1000000}},
                                    {"baseValue": {"integer": 0}}]}],
         "sections": [{"identifier": "S2", "children": [item_ref("Q2")]}]}
    ]));
    let mut h = Harness::started(test);
    let p2 = h.key("P2");
    let mut c = h.controller();
    c.handle_responses(T1, &raw("ChoiceA")).unwrap();
    c.advance_item_linear(T1).unwrap();
    c.end_current_test_part(T1).unwrap();

    let mut expected = h.runtime.rng().clone();
    let mut c = h.controller();
    assert_eq!(c.find_next_enterable_test_part().unwrap(), Some(p2.clone()));
    assert_eq!(c.find_next_enterable_test_part().unwrap(), Some(p2));
    assert_eq!(h.runtime.rng().gen::<u64>(), expected.gen::<u64>());
}

#[test]
fn suspended_test_stops_every_clock() {
    let test = assessment(linear_part(
        json!({}),
        json!([{"identifier": "S1", "children": [item_ref("Q1")]}]),
    ));
    let mut h = Harness::started(test);
    let mut c = h.controller();
    c.suspend_test(T1).unwrap();
    assert!(c.handle_responses(T2, &raw("ChoiceA")).is_err());
    c.resume_test(T2).unwrap();
    c.handle_responses(T3, &raw("ChoiceA")).unwrap();
    assert_eq!(c.state().timing.duration(), 80.0);
    assert_eq!(h.item("Q1").duration(), 80.0);
}

#[test]
fn exit_test_closes_everything() {
    let mut h = Harness::started(nonlinear_test());
    let q1 = h.key("Q1");
    let mut c = h.controller();
    c.select_item_nonlinear(T0, Some(&q1)).unwrap();
    assert_eq!(c.exit_test(T1).unwrap(), Navigation::TestExited);
    assert!(c.state().is_exited());
    assert!(c.exit_test(T2).is_err());
    assert!(h.item("Q1").is_closed());
}
