//! Variable declarations and the data hanging off them: correct responses,
//! mappings, area mappings and lookup tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{BaseType, Cardinality, Identifier, Signature, SingleValue, Value};

/// Built-in response variable holding the session duration in seconds.
pub const DURATION: &str = "duration";
/// Built-in response variable counting attempts.
pub const NUM_ATTEMPTS: &str = "numAttempts";
/// Built-in outcome variable tracking completion.
pub const COMPLETION_STATUS: &str = "completionStatus";

/// Signature of a built-in variable, if `name` is one.
pub fn builtin_signature(name: &str) -> Option<Signature> {
    match name {
        DURATION => Some(Signature::single(BaseType::Float)),
        NUM_ATTEMPTS => Some(Signature::single(BaseType::Integer)),
        COMPLETION_STATUS => Some(Signature::single(BaseType::Identifier)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableKind {
    Template,
    Response,
    Outcome,
}

impl fmt::Display for VariableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VariableKind::Template => "template",
            VariableKind::Response => "response",
            VariableKind::Outcome => "outcome",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    NotAttempted,
    Unknown,
    Incomplete,
    Completed,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::NotAttempted => "not_attempted",
            CompletionStatus::Unknown => "unknown",
            CompletionStatus::Incomplete => "incomplete",
            CompletionStatus::Completed => "completed",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "not_attempted" => Some(CompletionStatus::NotAttempted),
            "unknown" => Some(CompletionStatus::Unknown),
            "incomplete" => Some(CompletionStatus::Incomplete),
            "completed" => Some(CompletionStatus::Completed),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        Value::identifier(self.as_str())
    }
}

// ──────────────────────────────────────────────
// Declarations
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDeclaration {
    pub identifier: Identifier,
    pub kind: VariableKind,
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<BaseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeData>,
}

impl VariableDeclaration {
    pub fn new(identifier: &str, kind: VariableKind, signature: Signature) -> Self {
        VariableDeclaration {
            identifier: Identifier::new(identifier),
            kind,
            cardinality: signature.cardinality,
            base_type: signature.base_type,
            default_value: None,
            response: None,
            outcome: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn signature(&self) -> Signature {
        Signature {
            cardinality: self.cardinality,
            base_type: self.base_type,
        }
    }

    /// Declared default, or NULL.
    pub fn default_or_null(&self) -> Value {
        self.default_value.clone().unwrap_or_default()
    }

    pub fn correct_response(&self) -> Option<&Value> {
        self.response.as_ref()?.correct_response.as_ref()
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.response.as_ref()?.mapping.as_ref()
    }

    pub fn area_mapping(&self) -> Option<&AreaMapping> {
        self.response.as_ref()?.area_mapping.as_ref()
    }

    pub fn lookup_table(&self) -> Option<&LookupTable> {
        self.outcome.as_ref()?.lookup_table.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Mapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_mapping: Option<AreaMapping>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mastery_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_table: Option<LookupTable>,
}

// ──────────────────────────────────────────────
// Mappings
// ──────────────────────────────────────────────

fn yes() -> bool {
    true
}

fn clamp(value: f64, lower: Option<f64>, upper: Option<f64>) -> f64 {
    let value = lower.map_or(value, |l| value.max(l));
    upper.map_or(value, |u| value.min(u))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapEntry {
    pub map_key: SingleValue,
    pub mapped_value: f64,
    #[serde(default = "yes")]
    pub case_sensitive: bool,
}

impl MapEntry {
    fn matches(&self, value: &SingleValue) -> bool {
        if self.case_sensitive {
            &self.map_key == value
        } else {
            self.map_key
                .to_qti_string()
                .eq_ignore_ascii_case(&value.to_qti_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    #[serde(default)]
    pub default_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    #[serde(default)]
    pub entries: Vec<MapEntry>,
}

impl Mapping {
    /// Maps a response value to a score.
    ///
    /// A single value takes the first matching entry. In a container each
    /// entry contributes once however often its key occurs, and every
    /// unmatched element contributes the default. NULL maps to the default.
    pub fn map(&self, value: &Value) -> f64 {
        let raw = match value {
            Value::Single(v) => self
                .entries
                .iter()
                .find(|e| e.matches(v))
                .map_or(self.default_value, |e| e.mapped_value),
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => {
                let mut sum = 0.0;
                let mut matched = vec![false; values.len()];
                for entry in &self.entries {
                    let mut counted = false;
                    for (i, v) in values.iter().enumerate() {
                        if entry.matches(v) {
                            if !counted {
                                sum += entry.mapped_value;
                                counted = true;
                            }
                            matched[i] = true;
                        }
                    }
                }
                let unmatched = matched.iter().filter(|m| !**m).count();
                sum + self.default_value * unmatched as f64
            }
            Value::Null | Value::Record(_) => self.default_value,
        };
        clamp(raw, self.lower_bound, self.upper_bound)
    }
}

/// Hit-test shape, QTI coordinate conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "shape")]
pub enum Shape {
    Default,
    Rect {
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
    },
    Circle {
        x: f64,
        y: f64,
        radius: f64,
    },
    Ellipse {
        x: f64,
        y: f64,
        h_radius: f64,
        v_radius: f64,
    },
    Poly {
        points: Vec<(f64, f64)>,
    },
}

impl Shape {
    pub fn contains(&self, px: f64, py: f64) -> bool {
        match self {
            Shape::Default => true,
            Shape::Rect {
                left,
                top,
                right,
                bottom,
            } => px >= *left && px <= *right && py >= *top && py <= *bottom,
            Shape::Circle { x, y, radius } => {
                let (dx, dy) = (px - x, py - y);
                dx * dx + dy * dy <= radius * radius
            }
            Shape::Ellipse {
                x,
                y,
                h_radius,
                v_radius,
            } => {
                if *h_radius <= 0.0 || *v_radius <= 0.0 {
                    return false;
                }
                let (dx, dy) = ((px - x) / h_radius, (py - y) / v_radius);
                dx * dx + dy * dy <= 1.0
            }
            Shape::Poly { points } => point_in_polygon(points, px, py),
        }
    }
}

/// Even-odd ray casting.
fn point_in_polygon(points: &[(f64, f64)], px: f64, py: f64) -> bool {
    if points.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = points.len() - 1;
    for i in 0..points.len() {
        let (xi, yi) = points[i];
        let (xj, yj) = points[j];
        if (yi > py) != (yj > py) && px < (xj - xi) * (py - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaMapEntry {
    #[serde(flatten)]
    pub shape: Shape,
    pub mapped_value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaMapping {
    #[serde(default)]
    pub default_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    #[serde(default)]
    pub entries: Vec<AreaMapEntry>,
}

impl AreaMapping {
    /// Maps point responses to a score. Each area counts once however many
    /// points fall in it; points outside every area contribute the default.
    pub fn map(&self, value: &Value) -> f64 {
        let points: Vec<(f64, f64)> = value
            .members()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| match v {
                SingleValue::Point { x, y } => Some((*x as f64, *y as f64)),
                _ => None,
            })
            .collect();
        if points.is_empty() {
            return clamp(self.default_value, self.lower_bound, self.upper_bound);
        }
        let mut sum = 0.0;
        let mut hit = vec![false; points.len()];
        for entry in &self.entries {
            let mut counted = false;
            for (i, (x, y)) in points.iter().enumerate() {
                if entry.shape.contains(*x, *y) {
                    if !counted {
                        sum += entry.mapped_value;
                        counted = true;
                    }
                    hit[i] = true;
                }
            }
        }
        let missed = hit.iter().filter(|h| !**h).count();
        clamp(
            sum + self.default_value * missed as f64,
            self.lower_bound,
            self.upper_bound,
        )
    }
}

// ──────────────────────────────────────────────
// Lookup tables
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchTableEntry {
    pub source_value: i64,
    pub target_value: SingleValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpolationTableEntry {
    pub source_value: f64,
    #[serde(default = "yes")]
    pub include_boundary: bool,
    pub target_value: SingleValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LookupTable {
    #[serde(rename_all = "camelCase")]
    Match {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<SingleValue>,
        entries: Vec<MatchTableEntry>,
    },
    #[serde(rename_all = "camelCase")]
    Interpolation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_value: Option<SingleValue>,
        entries: Vec<InterpolationTableEntry>,
    },
}

impl LookupTable {
    /// Looks `source` up; unmatched and NULL sources give the table default.
    ///
    /// Interpolation entries are checked in order: a source at least the
    /// entry's value (strictly greater when the boundary is excluded) wins.
    pub fn lookup(&self, source: &Value) -> Value {
        let hit = match self {
            LookupTable::Match {
                default_value,
                entries,
            } => source
                .as_i64()
                .and_then(|n| entries.iter().find(|e| e.source_value == n))
                .map(|e| &e.target_value)
                .or(default_value.as_ref()),
            LookupTable::Interpolation {
                default_value,
                entries,
            } => source
                .as_f64()
                .and_then(|x| {
                    entries.iter().find(|e| {
                        if e.include_boundary {
                            x >= e.source_value
                        } else {
                            x > e.source_value
                        }
                    })
                })
                .map(|e| &e.target_value)
                .or(default_value.as_ref()),
        };
        hit.cloned().map(Value::Single).unwrap_or_default()
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
