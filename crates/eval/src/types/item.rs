//! Resolved assessment item definition.

use serde::{Deserialize, Serialize};

use super::{Identifier, VariableDeclaration, VariableKind};
use crate::rules::ProcessingRule;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentItem {
    pub identifier: Identifier,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub adaptive: bool,
    #[serde(default)]
    pub time_dependent: bool,
    #[serde(default)]
    pub declarations: Vec<VariableDeclaration>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
    #[serde(default)]
    pub template_processing: Vec<ProcessingRule>,
    #[serde(default)]
    pub response_processing: Vec<ProcessingRule>,
}

impl AssessmentItem {
    pub fn declaration(&self, identifier: &str) -> Option<&VariableDeclaration> {
        self.declarations
            .iter()
            .find(|d| d.identifier.as_str() == identifier)
    }

    pub fn declarations_of(
        &self,
        kind: VariableKind,
    ) -> impl Iterator<Item = &VariableDeclaration> + '_ {
        self.declarations.iter().filter(move |d| d.kind == kind)
    }

    pub fn interaction_for(&self, response: &str) -> Option<&Interaction> {
        self.interactions
            .iter()
            .find(|i| i.response_identifier.as_str() == response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InteractionKind {
    Choice,
    Order,
    Associate,
    Match,
    GapMatch,
    InlineChoice,
    Hotspot,
    SelectPoint,
    GraphicOrder,
    TextEntry,
    ExtendedText,
    Slider,
    Upload,
    #[serde(rename_all = "camelCase")]
    EndAttempt {
        #[serde(default)]
        count_attempt: bool,
    },
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    pub identifier: Identifier,
    #[serde(default)]
    pub fixed: bool,
}

/// The parts of an interaction the engine needs: which response it binds,
/// its shuffle and choice constraints, and its input mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub response_identifier: Identifier,
    pub kind: InteractionKind,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub min_choices: usize,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_choices: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_mask: Option<String>,
}

impl Interaction {
    pub fn is_end_attempt(&self) -> bool {
        matches!(self.kind, InteractionKind::EndAttempt { .. })
    }
}
