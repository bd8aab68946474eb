//! Runtime values: base types, cardinalities and the [`Value`] tagged union.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Identifier;
use crate::error::ParseError;

// ──────────────────────────────────────────────
// Base types and cardinality
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BaseType {
    Identifier,
    Boolean,
    Integer,
    Float,
    String,
    Point,
    Pair,
    DirectedPair,
    Duration,
    File,
    Uri,
    IntOrIdentifier,
}

impl BaseType {
    pub const ALL: [BaseType; 12] = [
        BaseType::Identifier,
        BaseType::Boolean,
        BaseType::Integer,
        BaseType::Float,
        BaseType::String,
        BaseType::Point,
        BaseType::Pair,
        BaseType::DirectedPair,
        BaseType::Duration,
        BaseType::File,
        BaseType::Uri,
        BaseType::IntOrIdentifier,
    ];

    /// QTI attribute spelling.
    pub fn name(self) -> &'static str {
        match self {
            BaseType::Identifier => "identifier",
            BaseType::Boolean => "boolean",
            BaseType::Integer => "integer",
            BaseType::Float => "float",
            BaseType::String => "string",
            BaseType::Point => "point",
            BaseType::Pair => "pair",
            BaseType::DirectedPair => "directedPair",
            BaseType::Duration => "duration",
            BaseType::File => "file",
            BaseType::Uri => "uri",
            BaseType::IntOrIdentifier => "intOrIdentifier",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, BaseType::Integer | BaseType::Float)
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BaseType {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        BaseType::ALL
            .into_iter()
            .find(|b| b.name() == text)
            .ok_or_else(|| ParseError::UnknownBaseType(text.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    Single,
    Multiple,
    Ordered,
    Record,
}

impl Cardinality {
    pub fn name(self) -> &'static str {
        match self {
            Cardinality::Single => "single",
            Cardinality::Multiple => "multiple",
            Cardinality::Ordered => "ordered",
            Cardinality::Record => "record",
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, Cardinality::Multiple | Cardinality::Ordered)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared shape of a variable: cardinality plus base type.
///
/// Records carry no base type; every other cardinality must carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub cardinality: Cardinality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<BaseType>,
}

impl Signature {
    pub const fn single(base_type: BaseType) -> Self {
        Signature {
            cardinality: Cardinality::Single,
            base_type: Some(base_type),
        }
    }

    pub const fn multiple(base_type: BaseType) -> Self {
        Signature {
            cardinality: Cardinality::Multiple,
            base_type: Some(base_type),
        }
    }

    pub const fn ordered(base_type: BaseType) -> Self {
        Signature {
            cardinality: Cardinality::Ordered,
            base_type: Some(base_type),
        }
    }

    pub const fn record() -> Self {
        Signature {
            cardinality: Cardinality::Record,
            base_type: None,
        }
    }

    /// A record without a base type, anything else with one.
    pub fn is_legal(&self) -> bool {
        (self.cardinality == Cardinality::Record) == self.base_type.is_none()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base_type {
            Some(base_type) => write!(f, "{} {}", self.cardinality, base_type),
            None => write!(f, "{}", self.cardinality),
        }
    }
}

// ──────────────────────────────────────────────
// Single values
// ──────────────────────────────────────────────

/// Integer-or-identifier payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrIdentifier {
    Int(i64),
    Identifier(Identifier),
}

/// A single (non-container) value of one base type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SingleValue {
    Identifier(Identifier),
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Point { x: i64, y: i64 },
    Pair(Identifier, Identifier),
    DirectedPair(Identifier, Identifier),
    /// Seconds.
    Duration(f64),
    File(String),
    Uri(String),
    IntOrIdentifier(IntOrIdentifier),
}

impl SingleValue {
    pub fn base_type(&self) -> BaseType {
        match self {
            SingleValue::Identifier(_) => BaseType::Identifier,
            SingleValue::Boolean(_) => BaseType::Boolean,
            SingleValue::Integer(_) => BaseType::Integer,
            SingleValue::Float(_) => BaseType::Float,
            SingleValue::String(_) => BaseType::String,
            SingleValue::Point { .. } => BaseType::Point,
            SingleValue::Pair(..) => BaseType::Pair,
            SingleValue::DirectedPair(..) => BaseType::DirectedPair,
            SingleValue::Duration(_) => BaseType::Duration,
            SingleValue::File(_) => BaseType::File,
            SingleValue::Uri(_) => BaseType::Uri,
            SingleValue::IntOrIdentifier(_) => BaseType::IntOrIdentifier,
        }
    }

    /// Parses the QTI string form for `base_type`.
    pub fn parse(base_type: BaseType, text: &str) -> Result<Self, ParseError> {
        let invalid = || ParseError::InvalidLiteral {
            base_type,
            text: text.to_string(),
        };
        let value = match base_type {
            BaseType::Identifier => SingleValue::Identifier(Identifier::parse(text.trim())?),
            BaseType::Boolean => match text.trim() {
                "true" | "1" => SingleValue::Boolean(true),
                "false" | "0" => SingleValue::Boolean(false),
                _ => return Err(invalid()),
            },
            BaseType::Integer => {
                SingleValue::Integer(text.trim().parse::<i64>().map_err(|_| invalid())?)
            }
            BaseType::Float => SingleValue::Float(parse_float(text).ok_or_else(invalid)?),
            BaseType::Duration => SingleValue::Duration(parse_float(text).ok_or_else(invalid)?),
            BaseType::String => SingleValue::String(text.to_string()),
            BaseType::File => SingleValue::File(text.to_string()),
            BaseType::Uri => SingleValue::Uri(text.to_string()),
            BaseType::Point => {
                let (x, y) = split_pair(text).ok_or_else(invalid)?;
                SingleValue::Point {
                    x: x.parse().map_err(|_| invalid())?,
                    y: y.parse().map_err(|_| invalid())?,
                }
            }
            BaseType::Pair | BaseType::DirectedPair => {
                let (a, b) = split_pair(text).ok_or_else(invalid)?;
                let (a, b) = (Identifier::parse(a)?, Identifier::parse(b)?);
                if base_type == BaseType::Pair {
                    SingleValue::Pair(a, b)
                } else {
                    SingleValue::DirectedPair(a, b)
                }
            }
            BaseType::IntOrIdentifier => {
                let trimmed = text.trim();
                match trimmed.parse::<i64>() {
                    Ok(n) => SingleValue::IntOrIdentifier(IntOrIdentifier::Int(n)),
                    Err(_) => SingleValue::IntOrIdentifier(IntOrIdentifier::Identifier(
                        Identifier::parse(trimmed).map_err(|_| invalid())?,
                    )),
                }
            }
        };
        Ok(value)
    }

    /// QTI string form, the inverse of [`SingleValue::parse`].
    pub fn to_qti_string(&self) -> String {
        match self {
            SingleValue::Identifier(id) => id.to_string(),
            SingleValue::Boolean(b) => b.to_string(),
            SingleValue::Integer(n) => n.to_string(),
            SingleValue::Float(x) | SingleValue::Duration(x) => format_float(*x),
            SingleValue::String(s) | SingleValue::File(s) | SingleValue::Uri(s) => s.clone(),
            SingleValue::Point { x, y } => format!("{} {}", x, y),
            SingleValue::Pair(a, b) | SingleValue::DirectedPair(a, b) => format!("{} {}", a, b),
            SingleValue::IntOrIdentifier(IntOrIdentifier::Int(n)) => n.to_string(),
            SingleValue::IntOrIdentifier(IntOrIdentifier::Identifier(id)) => id.to_string(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SingleValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SingleValue::Integer(n) => Some(*n),
            SingleValue::IntOrIdentifier(IntOrIdentifier::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Numeric view; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SingleValue::Integer(n) => Some(*n as f64),
            SingleValue::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_identifier(&self) -> Option<&Identifier> {
        match self {
            SingleValue::Identifier(id) => Some(id),
            SingleValue::IntOrIdentifier(IntOrIdentifier::Identifier(id)) => Some(id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SingleValue::String(s) | SingleValue::Uri(s) | SingleValue::File(s) => Some(s),
            SingleValue::Identifier(id) => Some(id.as_str()),
            _ => None,
        }
    }
}

impl PartialEq for SingleValue {
    fn eq(&self, other: &Self) -> bool {
        use SingleValue::*;
        match (self, other) {
            (Identifier(a), Identifier(b)) => a == b,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) | (Duration(a), Duration(b)) => {
                a == b || (a.is_nan() && b.is_nan())
            }
            (String(a), String(b)) | (File(a), File(b)) | (Uri(a), Uri(b)) => a == b,
            (Point { x: x1, y: y1 }, Point { x: x2, y: y2 }) => x1 == x2 && y1 == y2,
            (Pair(a1, b1), Pair(a2, b2)) => (a1 == a2 && b1 == b2) || (a1 == b2 && b1 == a2),
            (DirectedPair(a1, b1), DirectedPair(a2, b2)) => a1 == a2 && b1 == b2,
            (IntOrIdentifier(a), IntOrIdentifier(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for SingleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_qti_string())
    }
}

fn split_pair(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.split_whitespace();
    let (a, b) = (parts.next()?, parts.next()?);
    match parts.next() {
        None => Some((a, b)),
        Some(_) => None,
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text.trim() {
        "INF" => Some(f64::INFINITY),
        "-INF" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse::<f64>().ok().filter(|x| x.is_finite()),
    }
}

/// Shortest round-trip decimal, with the QTI spellings for non-finite values.
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x == f64::INFINITY {
        "INF".to_string()
    } else if x == f64::NEG_INFINITY {
        "-INF".to_string()
    } else {
        format!("{}", x)
    }
}

// ──────────────────────────────────────────────
// Values
// ──────────────────────────────────────────────

/// A runtime value of any cardinality.
///
/// `Null` is distinct from an empty container. Equality is type-aware:
/// `multiple` containers compare as bags, `ordered` as sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    #[default]
    Null,
    Single(SingleValue),
    #[serde(rename_all = "camelCase")]
    Multiple {
        base_type: BaseType,
        values: Vec<SingleValue>,
    },
    #[serde(rename_all = "camelCase")]
    Ordered {
        base_type: BaseType,
        values: Vec<SingleValue>,
    },
    Record(BTreeMap<Identifier, SingleValue>),
}

impl Value {
    pub fn boolean(b: bool) -> Self {
        Value::Single(SingleValue::Boolean(b))
    }

    pub fn integer(n: i64) -> Self {
        Value::Single(SingleValue::Integer(n))
    }

    pub fn float(x: f64) -> Self {
        Value::Single(SingleValue::Float(x))
    }

    pub fn identifier(id: impl Into<Identifier>) -> Self {
        Value::Single(SingleValue::Identifier(id.into()))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Single(SingleValue::String(s.into()))
    }

    pub fn duration(seconds: f64) -> Self {
        Value::Single(SingleValue::Duration(seconds))
    }

    pub fn multiple(base_type: BaseType, values: Vec<SingleValue>) -> Self {
        Value::Multiple { base_type, values }
    }

    pub fn ordered(base_type: BaseType, values: Vec<SingleValue>) -> Self {
        Value::Ordered { base_type, values }
    }

    /// Builds an empty or populated container of the given cardinality.
    ///
    /// Returns `None` for `single` and `record`.
    pub fn container(
        cardinality: Cardinality,
        base_type: BaseType,
        values: Vec<SingleValue>,
    ) -> Option<Self> {
        match cardinality {
            Cardinality::Multiple => Some(Value::Multiple { base_type, values }),
            Cardinality::Ordered => Some(Value::Ordered { base_type, values }),
            Cardinality::Single | Cardinality::Record => None,
        }
    }

    /// Signature of this value; `None` for NULL.
    pub fn signature(&self) -> Option<Signature> {
        match self {
            Value::Null => None,
            Value::Single(v) => Some(Signature::single(v.base_type())),
            Value::Multiple { base_type, .. } => Some(Signature::multiple(*base_type)),
            Value::Ordered { base_type, .. } => Some(Signature::ordered(*base_type)),
            Value::Record(_) => Some(Signature::record()),
        }
    }

    pub fn cardinality(&self) -> Option<Cardinality> {
        self.signature().map(|s| s.cardinality)
    }

    pub fn base_type(&self) -> Option<BaseType> {
        self.signature().and_then(|s| s.base_type)
    }

    /// Strict NULL test.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// NULL as QTI operators see it: NULL, an empty container, an empty
    /// record or an empty string.
    pub fn is_null_like(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Single(SingleValue::String(s)) => s.is_empty(),
            Value::Single(_) => false,
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => values.is_empty(),
            Value::Record(fields) => fields.is_empty(),
        }
    }

    pub fn as_single(&self) -> Option<&SingleValue> {
        match self {
            Value::Single(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_single().and_then(SingleValue::as_bool)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_single().and_then(SingleValue::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_single().and_then(SingleValue::as_f64)
    }

    pub fn as_identifier(&self) -> Option<&Identifier> {
        self.as_single().and_then(SingleValue::as_identifier)
    }

    /// Elements of a `multiple` or `ordered` container.
    pub fn container_values(&self) -> Option<&[SingleValue]> {
        match self {
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Values as a flat list: a single value is a one-element list, NULL is
    /// empty. Records yield `None`.
    pub fn members(&self) -> Option<Vec<&SingleValue>> {
        match self {
            Value::Null => Some(Vec::new()),
            Value::Single(v) => Some(vec![v]),
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => {
                Some(values.iter().collect())
            }
            Value::Record(_) => None,
        }
    }

    /// Number of elements: 0 for NULL, 1 for a single value.
    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Single(_) => 1,
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => values.len(),
            Value::Record(fields) => fields.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Container membership; a single value contains only itself.
    pub fn contains(&self, needle: &SingleValue) -> bool {
        match self {
            Value::Single(v) => v == needle,
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => {
                values.iter().any(|v| v == needle)
            }
            Value::Null | Value::Record(_) => false,
        }
    }

    /// Whether this value may be stored in a variable declared as `signature`.
    /// NULL fits everything.
    pub fn fits(&self, signature: Signature) -> bool {
        match self.signature() {
            None => true,
            Some(own) => own == signature,
        }
    }

    /// Converts this value for storage under `signature`, widening integers
    /// to floats where QTI allows. Returns `None` when no conversion exists.
    pub fn coerce_to(&self, signature: Signature) -> Option<Value> {
        if self.fits(signature) {
            return Some(self.clone());
        }
        let own = self.signature()?;
        if own.cardinality != signature.cardinality {
            return None;
        }
        if own.base_type == Some(BaseType::Integer) && signature.base_type == Some(BaseType::Float)
        {
            let widen = |v: &SingleValue| match v {
                SingleValue::Integer(n) => SingleValue::Float(*n as f64),
                other => other.clone(),
            };
            return Some(match self {
                Value::Single(v) => Value::Single(widen(v)),
                Value::Multiple { values, .. } => {
                    Value::multiple(BaseType::Float, values.iter().map(widen).collect())
                }
                Value::Ordered { values, .. } => {
                    Value::ordered(BaseType::Float, values.iter().map(widen).collect())
                }
                _ => return None,
            });
        }
        None
    }

    /// Parses a list of QTI strings into a value of `signature`.
    ///
    /// No strings produce NULL. Records have no string form.
    pub fn from_strings(signature: Signature, strings: &[String]) -> Result<Value, ParseError> {
        let base_type = match (signature.cardinality, signature.base_type) {
            (Cardinality::Record, _) | (_, None) => {
                return Err(ParseError::NoStringForm(signature.cardinality))
            }
            (_, Some(base_type)) => base_type,
        };
        if strings.is_empty() {
            return Ok(Value::Null);
        }
        match signature.cardinality {
            Cardinality::Single => match strings {
                [text] => Ok(Value::Single(SingleValue::parse(base_type, text)?)),
                _ => Err(ParseError::WrongValueCount {
                    cardinality: Cardinality::Single,
                    count: strings.len(),
                }),
            },
            cardinality => {
                let values = strings
                    .iter()
                    .map(|s| SingleValue::parse(base_type, s))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::container(cardinality, base_type, values)
                    .ok_or(ParseError::NoStringForm(cardinality))
            }
        }
    }

    /// QTI string forms of each element; NULL yields no strings.
    pub fn to_strings(&self) -> Result<Vec<String>, ParseError> {
        match self {
            Value::Null => Ok(Vec::new()),
            Value::Single(v) => Ok(vec![v.to_qti_string()]),
            Value::Multiple { values, .. } | Value::Ordered { values, .. } => {
                Ok(values.iter().map(SingleValue::to_qti_string).collect())
            }
            Value::Record(_) => Err(ParseError::NoStringForm(Cardinality::Record)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Single(a), Value::Single(b)) => a == b,
            (
                Value::Multiple {
                    base_type: ta,
                    values: a,
                },
                Value::Multiple {
                    base_type: tb,
                    values: b,
                },
            ) => ta == tb && bag_eq(a, b),
            (
                Value::Ordered {
                    base_type: ta,
                    values: a,
                },
                Value::Ordered {
                    base_type: tb,
                    values: b,
                },
            ) => ta == tb && a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

/// Multiset equality.
pub(crate) fn bag_eq(a: &[SingleValue], b: &[SingleValue]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut used = vec![false; b.len()];
    a.iter().all(|x| {
        match b
            .iter()
            .enumerate()
            .position(|(i, y)| !used[i] && x == y)
        {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

/// Whether every element of `inner` can be matched to a distinct element
/// of `outer`.
pub fn bag_contains(outer: &[SingleValue], inner: &[SingleValue]) -> bool {
    let mut used = vec![false; outer.len()];
    inner.iter().all(|x| {
        match outer
            .iter()
            .enumerate()
            .position(|(i, y)| !used[i] && x == y)
        {
            Some(i) => {
                used[i] = true;
                true
            }
            None => false,
        }
    })
}

impl From<SingleValue> for Value {
    fn from(v: SingleValue) -> Self {
        Value::Single(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Single(v) => write!(f, "{}", v),
            Value::Multiple { values, .. } => write_list(f, "{", values, "}"),
            Value::Ordered { values, .. } => write_list(f, "[", values, "]"),
            Value::Record(fields) => {
                f.write_str("(")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str(")")
            }
        }
    }
}

fn write_list(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    values: &[SingleValue],
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", v)?;
    }
    f.write_str(close)
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SingleValue {
        SingleValue::Identifier(Identifier::new(s))
    }

    #[test]
    fn parse_and_format_scalars() {
        assert_eq!(
            SingleValue::parse(BaseType::Integer, " 42 ").unwrap(),
            SingleValue::Integer(42)
        );
        assert_eq!(
            SingleValue::parse(BaseType::Boolean, "true").unwrap(),
            SingleValue::Boolean(true)
        );
        assert_eq!(
            SingleValue::parse(BaseType::Point, "3 4").unwrap(),
            SingleValue::Point { x: 3, y: 4 }
        );
        assert_eq!(SingleValue::Float(1.5).to_qti_string(), "1.5");
        assert_eq!(SingleValue::Float(f64::NEG_INFINITY).to_qti_string(), "-INF");
        assert!(SingleValue::parse(BaseType::Float, "NaN")
            .unwrap()
            .as_f64()
            .unwrap()
            .is_nan());
        assert!(SingleValue::parse(BaseType::Integer, "4.2").is_err());
        assert!(SingleValue::parse(BaseType::Pair, "A").is_err());
    }

    #[test]
    fn float_strings_round_trip() {
        for x in [0.1, -2.5, 1e-9, 123456.789, 3.0] {
            let text = SingleValue::Float(x).to_qti_string();
            assert_eq!(
                SingleValue::parse(BaseType::Float, &text).unwrap(),
                SingleValue::Float(x)
            );
        }
    }

    #[test]
    fn pair_equality_is_unordered() {
        let a = SingleValue::parse(BaseType::Pair, "A B").unwrap();
        let b = SingleValue::parse(BaseType::Pair, "B A").unwrap();
        assert_eq!(a, b);

        let c = SingleValue::parse(BaseType::DirectedPair, "A B").unwrap();
        let d = SingleValue::parse(BaseType::DirectedPair, "B A").unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn multiple_compares_as_bag_ordered_as_sequence() {
        let m1 = Value::multiple(BaseType::Identifier, vec![id("A"), id("B"), id("A")]);
        let m2 = Value::multiple(BaseType::Identifier, vec![id("B"), id("A"), id("A")]);
        let m3 = Value::multiple(BaseType::Identifier, vec![id("B"), id("B"), id("A")]);
        assert_eq!(m1, m2);
        assert_ne!(m1, m3);

        let o1 = Value::ordered(BaseType::Identifier, vec![id("A"), id("B")]);
        let o2 = Value::ordered(BaseType::Identifier, vec![id("B"), id("A")]);
        assert_ne!(o1, o2);
        assert_ne!(
            o1,
            Value::multiple(BaseType::Identifier, vec![id("A"), id("B")])
        );
    }

    #[test]
    fn null_is_distinct_from_empty_container() {
        let empty = Value::multiple(BaseType::Integer, vec![]);
        assert_ne!(Value::Null, empty);
        assert!(empty.is_null_like());
        assert!(!empty.is_null());
        assert!(Value::string("").is_null_like());
        assert!(!Value::integer(0).is_null_like());
    }

    #[test]
    fn strings_round_trip_through_signatures() {
        let sig = Signature::multiple(BaseType::DirectedPair);
        let strings = vec!["A B".to_string(), "C D".to_string()];
        let value = Value::from_strings(sig, &strings).unwrap();
        assert_eq!(value.len(), 2);
        assert_eq!(value.to_strings().unwrap(), strings);

        assert_eq!(
            Value::from_strings(Signature::single(BaseType::Integer), &[]).unwrap(),
            Value::Null
        );
        assert!(matches!(
            Value::from_strings(
                Signature::single(BaseType::Integer),
                &["1".to_string(), "2".to_string()]
            ),
            Err(ParseError::WrongValueCount { count: 2, .. })
        ));
        assert!(Value::from_strings(Signature::record(), &["x".to_string()]).is_err());

        for base_type in [BaseType::Float, BaseType::Duration] {
            for text in ["NaN", "INF", "-INF", "0.1"] {
                let value = SingleValue::parse(base_type, text).unwrap();
                assert_eq!(value.to_qti_string(), text);
                assert_eq!(SingleValue::parse(base_type, &value.to_qti_string()).unwrap(), value);
            }
        }
        let float_sig = Signature::single(BaseType::Float);
        let nan = Value::from_strings(float_sig, &["NaN".to_string()]).unwrap();
        let back = Value::from_strings(float_sig, &nan.to_strings().unwrap()).unwrap();
        assert_eq!(back, nan);
    }

    #[test]
    fn integers_widen_to_float_only() {
        let float_sig = Signature::single(BaseType::Float);
        assert_eq!(Value::integer(2).coerce_to(float_sig), Some(Value::float(2.0)));
        assert_eq!(
            Value::float(2.0).coerce_to(Signature::single(BaseType::Integer)),
            None
        );
        assert_eq!(Value::Null.coerce_to(float_sig), Some(Value::Null));
    }

    #[test]
    fn signature_legality() {
        assert!(Signature::single(BaseType::Integer).is_legal());
        assert!(Signature::record().is_legal());
        assert!(!Signature {
            cardinality: Cardinality::Record,
            base_type: Some(BaseType::Integer)
        }
        .is_legal());
        assert!(!Signature {
            cardinality: Cardinality::Multiple,
            base_type: None
        }
        .is_legal());
    }

    #[test]
    fn values_round_trip_through_json() {
        let mut fields = BTreeMap::new();
        fields.insert(Identifier::new("x"), SingleValue::Integer(1));
        fields.insert(Identifier::new("label"), SingleValue::String("hi".into()));
        for value in [
            Value::Null,
            Value::float(0.5),
            Value::multiple(BaseType::Identifier, vec![id("A")]),
            Value::Record(fields),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }
}
