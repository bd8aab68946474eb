//! CLI integration tests.
//!
//! Uses `assert_cmd` to spawn the `qti` binary against JSON definitions
//! written to a temporary directory.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn qti() -> Command {
    cargo_bin_cmd!("qti")
}

fn choice_item() -> serde_json::Value {
    serde_json::json!({
        "identifier": "choice",
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
                "guard": {"match": [{"variable": {"identifier": "RESPONSE"}},
                                    {"correct": {"identifier": "RESPONSE"}}]},
                "rules": [{"setValue": {"identifier": "SCORE",
                                        "expression": {"baseValue": {"float": 1.0}}}}]
            }]}}
        ]
    })
}

fn write(dir: &TempDir, name: &str, value: &serde_json::Value) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    path
}

// ──────────────────────────────────────────────
// Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    qti()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("QTI item and test processing engine"));
}

#[test]
fn version_exits_0() {
    qti()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("qti"));
}

// ──────────────────────────────────────────────
// validate
// ──────────────────────────────────────────────

#[test]
fn validate_valid_item_exits_0() {
    let dir = TempDir::new().unwrap();
    let item = write(&dir, "choice.json", &choice_item());
    qti()
        .arg("validate")
        .arg(&item)
        .assert()
        .success()
        .stdout(predicate::str::contains("valid item"));
}

#[test]
fn validate_undeclared_variable_exits_1() {
    let dir = TempDir::new().unwrap();
    let mut item = choice_item();
    item["responseProcessing"] = serde_json::json!([
        {"setValue": {"identifier": "MISSING", "expression": {"baseValue": {"float": 1.0}}}}
    ]);
    let path = write(&dir, "broken.json", &item);
    qti()
        .arg("validate")
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("error(s)"))
        .stderr(predicate::str::contains("MISSING"));
}

#[test]
fn validate_test_resolves_items_beside_it() {
    let dir = TempDir::new().unwrap();
    write(&dir, "q1.json", &choice_item());
    let test = write(
        &dir,
        "test.json",
        &serde_json::json!({
            "identifier": "T",
            "testParts": [{"identifier": "P1", "sections": [
                {"identifier": "S1", "children": [
                    {"itemRef": {"identifier": "Q1", "href": "q1.json"}}
                ]}
            ]}]
        }),
    );
    let output = qti()
        .args(["--output", "json", "validate"])
        .arg(&test)
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["kind"], "test");
    assert_eq!(report["valid"], true);
}

#[test]
fn validate_test_with_missing_item_exits_1() {
    let dir = TempDir::new().unwrap();
    let test = write(
        &dir,
        "test.json",
        &serde_json::json!({
            "identifier": "T",
            "testParts": [{"identifier": "P1", "sections": [
                {"identifier": "S1", "children": [
                    {"itemRef": {"identifier": "Q1", "href": "nowhere.json"}}
                ]}
            ]}]
        }),
    );
    qti()
        .arg("validate")
        .arg(&test)
        .assert()
        .failure()
        .stderr(predicate::str::contains("nowhere.json"));
}

#[test]
fn validate_missing_file_exits_1() {
    qti()
        .args(["validate", "does/not/exist.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error reading file"));
}

// ──────────────────────────────────────────────
// run-item
// ──────────────────────────────────────────────

#[test]
fn run_item_scores_correct_response() {
    let dir = TempDir::new().unwrap();
    let item = write(&dir, "choice.json", &choice_item());
    let responses = write(
        &dir,
        "responses.json",
        &serde_json::json!([{"RESPONSE": ["ChoiceA"]}]),
    );
    let output = qti()
        .args(["--output", "json", "run-item"])
        .arg(&item)
        .arg("--responses")
        .arg(&responses)
        .args(["--seed", "1"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["numAttempts"], 1);
    assert_eq!(result["sessionStatus"], "final");
    assert_eq!(
        result["outcomeValues"]["SCORE"],
        serde_json::json!({"single": {"float": 1.0}})
    );
}

#[test]
fn run_item_text_output_lists_outcomes() {
    let dir = TempDir::new().unwrap();
    let item = write(&dir, "choice.json", &choice_item());
    let responses = write(
        &dir,
        "responses.json",
        &serde_json::json!([{"RESPONSE": ["ChoiceB"]}, {"RESPONSE": ["ChoiceA"]}]),
    );
    qti()
        .arg("run-item")
        .arg(&item)
        .arg("--responses")
        .arg(&responses)
        .args(["--max-attempts", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("numAttempts: 2"))
        .stdout(predicate::str::contains("sessionStatus: final"));
}

#[test]
fn run_item_refuses_invalid_item() {
    let dir = TempDir::new().unwrap();
    let mut item = choice_item();
    item["responseProcessing"] = serde_json::json!([
        {"setValue": {"identifier": "MISSING", "expression": {"baseValue": {"float": 1.0}}}}
    ]);
    let item = write(&dir, "broken.json", &item);
    let responses = write(&dir, "responses.json", &serde_json::json!([]));
    qti()
        .arg("run-item")
        .arg(&item)
        .arg("--responses")
        .arg(&responses)
        .assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}
