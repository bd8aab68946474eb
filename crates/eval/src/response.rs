//! Candidate responses: binding raw input, interaction constraints, choice
//! shuffling and correctness.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::context::{item_correct_response, read_item_variable};
use crate::error::ParseError;
use crate::evaluate::anchored_regex;
use crate::state::ItemSessionState;
use crate::types::{
    AssessmentItem, Identifier, Interaction, InteractionKind, SingleValue, Value,
    VariableDeclaration, VariableKind,
};

/// Parses raw candidate input for `declaration`. No input at all is NULL.
pub fn parse_response(
    declaration: &VariableDeclaration,
    raw: &[String],
) -> Result<Value, ParseError> {
    Value::from_strings(declaration.signature(), raw)
}

/// Checks a bound value against its interaction. Returns the reason the
/// value is invalid.
pub fn check_constraints(interaction: &Interaction, value: &Value) -> Result<(), String> {
    let count = match value {
        Value::Null => 0,
        Value::Single(SingleValue::String(s)) if s.is_empty() => 0,
        other => other.len(),
    };
    if count < interaction.min_choices {
        return Err(format!(
            "at least {} choice(s) required, got {}",
            interaction.min_choices, count
        ));
    }
    if interaction.max_choices > 0 && count > interaction.max_choices {
        return Err(format!(
            "at most {} choice(s) allowed, got {}",
            interaction.max_choices, count
        ));
    }
    if !interaction.choices.is_empty() {
        for member in value.members().unwrap_or_default() {
            for id in choice_identifiers(member) {
                if !interaction.choices.iter().any(|c| &c.identifier == id) {
                    return Err(format!("'{}' is not a choice of this interaction", id));
                }
            }
        }
    }
    if let Some(mask) = &interaction.pattern_mask {
        let regex = anchored_regex(mask).map_err(|e| e.to_string())?;
        for member in value.members().unwrap_or_default() {
            if let SingleValue::String(s) = member {
                if !regex.is_match(s) {
                    return Err(format!("'{}' does not match the pattern mask", s));
                }
            }
        }
    }
    Ok(())
}

fn choice_identifiers(value: &SingleValue) -> Vec<&Identifier> {
    match value {
        SingleValue::Identifier(id) => vec![id],
        SingleValue::Pair(a, b) | SingleValue::DirectedPair(a, b) => vec![a, b],
        _ => Vec::new(),
    }
}

/// Presentation order for a shuffled interaction: fixed choices keep their
/// positions, the rest are permuted among the remaining slots.
pub fn shuffle_choices<R: Rng + ?Sized>(interaction: &Interaction, rng: &mut R) -> Vec<Identifier> {
    let mut movable: Vec<Identifier> = interaction
        .choices
        .iter()
        .filter(|c| !c.fixed)
        .map(|c| c.identifier.clone())
        .collect();
    movable.shuffle(rng);
    let mut movable = movable.into_iter();
    interaction
        .choices
        .iter()
        .filter_map(|c| {
            if c.fixed {
                Some(c.identifier.clone())
            } else {
                movable.next()
            }
        })
        .collect()
}

/// Whether an end-attempt response fired and whether it counts as an
/// attempt.
pub fn end_attempt_fired(item: &AssessmentItem, responses: &[(Identifier, Value)]) -> Option<bool> {
    let mut fired = None;
    for (id, value) in responses {
        let Some(interaction) = item.interaction_for(id.as_str()) else {
            continue;
        };
        if let InteractionKind::EndAttempt { count_attempt } = interaction.kind {
            if value.as_bool() == Some(true) {
                fired = Some(fired.unwrap_or(false) || count_attempt);
            }
        }
    }
    fired
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correctness {
    Correct,
    Incorrect,
    /// No response variable declares a correct response.
    Unknown,
}

/// Compares every response variable that has a correct response with the
/// candidate's value. End-attempt responses are ignored.
pub fn item_correctness(item: &AssessmentItem, state: &ItemSessionState) -> Correctness {
    let mut checked = false;
    for declaration in item.declarations_of(VariableKind::Response) {
        let name = declaration.identifier.as_str();
        if item.interaction_for(name).is_some_and(Interaction::is_end_attempt) {
            continue;
        }
        let Some(correct) = item_correct_response(item, state, name) else {
            continue;
        };
        if correct.is_null() {
            continue;
        }
        checked = true;
        let actual = read_item_variable(item, state, name).unwrap_or_default();
        if actual != correct {
            return Correctness::Incorrect;
        }
    }
    if checked {
        Correctness::Correct
    } else {
        Correctness::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BaseType, Choice, Signature};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn choice_interaction(max: usize) -> Interaction {
        Interaction {
            response_identifier: Identifier::new("RESPONSE"),
            kind: InteractionKind::Choice,
            shuffle: true,
            choices: ["A", "B", "C", "D"]
                .iter()
                .map(|id| Choice {
                    identifier: Identifier::new(id),
                    fixed: *id == "D",
                })
                .collect(),
            min_choices: 1,
            max_choices: max,
            pattern_mask: None,
        }
    }

    fn ids(list: &[&str]) -> Value {
        Value::multiple(
            BaseType::Identifier,
            list.iter()
                .map(|s| SingleValue::Identifier(Identifier::new(s)))
                .collect(),
        )
    }

    #[test]
    fn choice_counts_and_unknown_choices() {
        let interaction = choice_interaction(2);
        assert!(check_constraints(&interaction, &ids(&["A"])).is_ok());
        assert!(check_constraints(&interaction, &Value::Null).is_err());
        assert!(check_constraints(&interaction, &ids(&["A", "B", "C"])).is_err());
        let err = check_constraints(&interaction, &ids(&["Z"])).unwrap_err();
        assert!(err.contains("'Z'"));
    }

    #[test]
    fn pattern_mask_is_anchored() {
        let interaction = Interaction {
            response_identifier: Identifier::new("RESPONSE"),
            kind: InteractionKind::TextEntry,
            shuffle: false,
            choices: Vec::new(),
            min_choices: 0,
            max_choices: 0,
            pattern_mask: Some("[0-9]{3}".to_string()),
        };
        assert!(check_constraints(&interaction, &Value::string("123")).is_ok());
        assert!(check_constraints(&interaction, &Value::string("1234")).is_err());
    }

    #[test]
    fn shuffle_keeps_fixed_choices_in_place() {
        let interaction = choice_interaction(0);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let order = shuffle_choices(&interaction, &mut rng);
            assert_eq!(order.len(), 4);
            assert_eq!(order[3].as_str(), "D");
            let mut sorted: Vec<_> = order.iter().map(|i| i.as_str()).collect();
            sorted.sort();
            assert_eq!(sorted, vec!["A", "B", "C", "D"]);
        }
    }

    #[test]
    fn parse_response_uses_declared_signature() {
        let decl = VariableDeclaration::new(
            "RESPONSE",
            VariableKind::Response,
            Signature::multiple(BaseType::Identifier),
        );
        let v = parse_response(&decl, &["A".to_string(), "B".to_string()]).unwrap();
        assert_eq!(v, ids(&["B", "A"]));
        assert_eq!(parse_response(&decl, &[]).unwrap(), Value::Null);

        let decl = VariableDeclaration::new(
            "N",
            VariableKind::Response,
            Signature::single(BaseType::Integer),
        );
        assert!(parse_response(&decl, &["x".to_string()]).is_err());
    }
}
