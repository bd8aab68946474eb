//! The closed QTI expression vocabulary.
//!
//! Fixed-arity operators hold their operands in arrays so a malformed tree
//! cannot be built; n-ary operators hold a `Vec`.

use serde::{Deserialize, Serialize};

use crate::types::{BaseType, Identifier, Shape, SingleValue, VariableRef};

/// Integer attribute that may name a template variable instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrVariable {
    Int(i64),
    Variable(Identifier),
}

impl Default for IntOrVariable {
    fn default() -> Self {
        IntOrVariable::Int(1)
    }
}

/// Float attribute that may name a template variable instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FloatOrVariable {
    Float(f64),
    Variable(Identifier),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToleranceMode {
    #[default]
    Exact,
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundingMode {
    #[default]
    SignificantFigures,
    DecimalPlaces,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MathConstant {
    Pi,
    E,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatsFunction {
    Mean,
    SampleVariance,
    #[serde(rename = "sampleSD")]
    SampleSd,
    PopVariance,
    #[serde(rename = "popSD")]
    PopSd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MathFunction {
    Sin,
    Cos,
    Tan,
    Sec,
    Csc,
    Cot,
    Asin,
    Acos,
    Atan,
    Atan2,
    Asec,
    Acsc,
    Acot,
    Sinh,
    Cosh,
    Tanh,
    Sech,
    Csch,
    Coth,
    Log,
    Ln,
    Exp,
    Abs,
    Signum,
    Floor,
    Ceil,
    ToDegrees,
    ToRadians,
}

impl MathFunction {
    pub fn arity(self) -> usize {
        match self {
            MathFunction::Atan2 => 2,
            _ => 1,
        }
    }
}

/// Filter over the items of a test used by the aggregate expressions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSubset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_identifier: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_category: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_category: Vec<String>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expression {
    // leaves
    BaseValue(SingleValue),
    #[serde(rename_all = "camelCase")]
    Variable {
        identifier: VariableRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_identifier: Option<Identifier>,
    },
    Default {
        identifier: Identifier,
    },
    Correct {
        identifier: Identifier,
    },
    MapResponse {
        identifier: Identifier,
    },
    MapResponsePoint {
        identifier: Identifier,
    },
    Null,
    RandomInteger {
        min: IntOrVariable,
        max: IntOrVariable,
        #[serde(default)]
        step: IntOrVariable,
    },
    RandomFloat {
        min: FloatOrVariable,
        max: FloatOrVariable,
    },
    MathConstant(MathConstant),

    // test aggregates
    NumberCorrect(ItemSubset),
    NumberIncorrect(ItemSubset),
    NumberPresented(ItemSubset),
    NumberResponded(ItemSubset),
    NumberSelected(ItemSubset),
    #[serde(rename_all = "camelCase")]
    OutcomeMaximum {
        #[serde(default)]
        subset: ItemSubset,
        outcome_identifier: Identifier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_identifier: Option<Identifier>,
    },
    #[serde(rename_all = "camelCase")]
    OutcomeMinimum {
        #[serde(default)]
        subset: ItemSubset,
        outcome_identifier: Identifier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_identifier: Option<Identifier>,
    },
    #[serde(rename_all = "camelCase")]
    TestVariables {
        #[serde(default)]
        subset: ItemSubset,
        variable_identifier: Identifier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weight_identifier: Option<Identifier>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_type: Option<BaseType>,
    },

    // containers
    Multiple(Vec<Expression>),
    Ordered(Vec<Expression>),
    ContainerSize(Box<Expression>),
    IsNull(Box<Expression>),
    Index {
        n: IntOrVariable,
        expression: Box<Expression>,
    },
    #[serde(rename_all = "camelCase")]
    FieldValue {
        field_identifier: Identifier,
        expression: Box<Expression>,
    },
    Random(Box<Expression>),
    Member(Box<[Expression; 2]>),
    Delete(Box<[Expression; 2]>),
    Contains(Box<[Expression; 2]>),
    #[serde(rename_all = "camelCase")]
    Repeat {
        number_repeats: IntOrVariable,
        expressions: Vec<Expression>,
    },

    // logic
    Not(Box<Expression>),
    And(Vec<Expression>),
    Or(Vec<Expression>),
    AnyN {
        min: IntOrVariable,
        max: IntOrVariable,
        expressions: Vec<Expression>,
    },
    Match(Box<[Expression; 2]>),
    #[serde(rename_all = "camelCase")]
    Equal {
        #[serde(default)]
        tolerance_mode: ToleranceMode,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tolerance: Vec<FloatOrVariable>,
        #[serde(default = "yes")]
        include_lower_bound: bool,
        #[serde(default = "yes")]
        include_upper_bound: bool,
        operands: Box<[Expression; 2]>,
    },
    #[serde(rename_all = "camelCase")]
    EqualRounded {
        #[serde(default)]
        rounding_mode: RoundingMode,
        figures: IntOrVariable,
        operands: Box<[Expression; 2]>,
    },
    Lt(Box<[Expression; 2]>),
    Gt(Box<[Expression; 2]>),
    Lte(Box<[Expression; 2]>),
    Gte(Box<[Expression; 2]>),
    #[serde(rename = "durationLT")]
    DurationLt(Box<[Expression; 2]>),
    #[serde(rename = "durationGTE")]
    DurationGte(Box<[Expression; 2]>),
    Inside {
        shape: Shape,
        expression: Box<Expression>,
    },

    // strings
    #[serde(rename_all = "camelCase")]
    Substring {
        #[serde(default = "yes")]
        case_sensitive: bool,
        operands: Box<[Expression; 2]>,
    },
    #[serde(rename_all = "camelCase")]
    StringMatch {
        #[serde(default = "yes")]
        case_sensitive: bool,
        #[serde(default)]
        substring: bool,
        operands: Box<[Expression; 2]>,
    },
    PatternMatch {
        pattern: String,
        expression: Box<Expression>,
    },

    // arithmetic
    Sum(Vec<Expression>),
    Product(Vec<Expression>),
    Subtract(Box<[Expression; 2]>),
    Divide(Box<[Expression; 2]>),
    Power(Box<[Expression; 2]>),
    IntegerDivide(Box<[Expression; 2]>),
    IntegerModulus(Box<[Expression; 2]>),
    Truncate(Box<Expression>),
    Round(Box<Expression>),
    #[serde(rename_all = "camelCase")]
    RoundTo {
        #[serde(default)]
        rounding_mode: RoundingMode,
        figures: IntOrVariable,
        expression: Box<Expression>,
    },
    IntegerToFloat(Box<Expression>),
    Max(Vec<Expression>),
    Min(Vec<Expression>),
    Gcd(Vec<Expression>),
    Lcm(Vec<Expression>),
    StatsOperator {
        name: StatsFunction,
        expression: Box<Expression>,
    },
    MathOperator {
        name: MathFunction,
        expressions: Vec<Expression>,
    },

    // extension
    CustomOperator {
        class: String,
        #[serde(default)]
        expressions: Vec<Expression>,
    },
}

impl Expression {
    pub fn base_value(value: SingleValue) -> Self {
        Expression::BaseValue(value)
    }

    pub fn variable(identifier: &str) -> Self {
        Expression::Variable {
            identifier: VariableRef::local(identifier),
            weight_identifier: None,
        }
    }

    pub fn pair(op: fn(Box<[Expression; 2]>) -> Expression, a: Expression, b: Expression) -> Self {
        op(Box::new([a, b]))
    }

    /// QTI element name, used in notifications and validation findings.
    pub fn name(&self) -> &'static str {
        use Expression::*;
        match self {
            BaseValue(_) => "baseValue",
            Variable { .. } => "variable",
            Default { .. } => "default",
            Correct { .. } => "correct",
            MapResponse { .. } => "mapResponse",
            MapResponsePoint { .. } => "mapResponsePoint",
            Null => "null",
            RandomInteger { .. } => "randomInteger",
            RandomFloat { .. } => "randomFloat",
            Expression::MathConstant(_) => "mathConstant",
            NumberCorrect(_) => "numberCorrect",
            NumberIncorrect(_) => "numberIncorrect",
            NumberPresented(_) => "numberPresented",
            NumberResponded(_) => "numberResponded",
            NumberSelected(_) => "numberSelected",
            OutcomeMaximum { .. } => "outcomeMaximum",
            OutcomeMinimum { .. } => "outcomeMinimum",
            TestVariables { .. } => "testVariables",
            Multiple(_) => "multiple",
            Ordered(_) => "ordered",
            ContainerSize(_) => "containerSize",
            IsNull(_) => "isNull",
            Index { .. } => "index",
            FieldValue { .. } => "fieldValue",
            Random(_) => "random",
            Member(_) => "member",
            Delete(_) => "delete",
            Contains(_) => "contains",
            Repeat { .. } => "repeat",
            Not(_) => "not",
            And(_) => "and",
            Or(_) => "or",
            AnyN { .. } => "anyN",
            Match(_) => "match",
            Equal { .. } => "equal",
            EqualRounded { .. } => "equalRounded",
            Lt(_) => "lt",
            Gt(_) => "gt",
            Lte(_) => "lte",
            Gte(_) => "gte",
            DurationLt(_) => "durationLT",
            DurationGte(_) => "durationGTE",
            Inside { .. } => "inside",
            Substring { .. } => "substring",
            StringMatch { .. } => "stringMatch",
            PatternMatch { .. } => "patternMatch",
            Sum(_) => "sum",
            Product(_) => "product",
            Subtract(_) => "subtract",
            Divide(_) => "divide",
            Power(_) => "power",
            IntegerDivide(_) => "integerDivide",
            IntegerModulus(_) => "integerModulus",
            Truncate(_) => "truncate",
            Round(_) => "round",
            RoundTo { .. } => "roundTo",
            IntegerToFloat(_) => "integerToFloat",
            Max(_) => "max",
            Min(_) => "min",
            Gcd(_) => "gcd",
            Lcm(_) => "lcm",
            StatsOperator { .. } => "statsOperator",
            MathOperator { .. } => "mathOperator",
            CustomOperator { .. } => "customOperator",
        }
    }

    /// Direct sub-expressions in evaluation order.
    pub fn children(&self) -> Vec<&Expression> {
        use Expression::*;
        match self {
            BaseValue(_)
            | Variable { .. }
            | Default { .. }
            | Correct { .. }
            | MapResponse { .. }
            | MapResponsePoint { .. }
            | Null
            | RandomInteger { .. }
            | RandomFloat { .. }
            | Expression::MathConstant(_)
            | NumberCorrect(_)
            | NumberIncorrect(_)
            | NumberPresented(_)
            | NumberResponded(_)
            | NumberSelected(_)
            | OutcomeMaximum { .. }
            | OutcomeMinimum { .. }
            | TestVariables { .. } => Vec::new(),

            ContainerSize(e)
            | IsNull(e)
            | Random(e)
            | Not(e)
            | Truncate(e)
            | Round(e)
            | IntegerToFloat(e)
            | Index { expression: e, .. }
            | FieldValue { expression: e, .. }
            | Inside { expression: e, .. }
            | PatternMatch { expression: e, .. }
            | RoundTo { expression: e, .. }
            | StatsOperator { expression: e, .. } => vec![e.as_ref()],

            Member(pair)
            | Delete(pair)
            | Contains(pair)
            | Match(pair)
            | Lt(pair)
            | Gt(pair)
            | Lte(pair)
            | Gte(pair)
            | DurationLt(pair)
            | DurationGte(pair)
            | Subtract(pair)
            | Divide(pair)
            | Power(pair)
            | IntegerDivide(pair)
            | IntegerModulus(pair)
            | Equal { operands: pair, .. }
            | EqualRounded { operands: pair, .. }
            | Substring { operands: pair, .. }
            | StringMatch { operands: pair, .. } => pair.iter().collect(),

            Multiple(list)
            | Ordered(list)
            | And(list)
            | Or(list)
            | Sum(list)
            | Product(list)
            | Max(list)
            | Min(list)
            | Gcd(list)
            | Lcm(list)
            | Repeat {
                expressions: list, ..
            }
            | AnyN {
                expressions: list, ..
            }
            | MathOperator {
                expressions: list, ..
            }
            | CustomOperator {
                expressions: list, ..
            } => list.iter().collect(),
        }
    }

    /// True for nodes that read state only a test session has.
    pub fn is_test_only(&self) -> bool {
        use Expression::*;
        match self {
            NumberCorrect(_)
            | NumberIncorrect(_)
            | NumberPresented(_)
            | NumberResponded(_)
            | NumberSelected(_)
            | OutcomeMaximum { .. }
            | OutcomeMinimum { .. }
            | TestVariables { .. } => true,
            Variable { identifier, .. } => identifier.is_dotted(),
            _ => false,
        }
    }

    /// Calls `f` on this node and every descendant, parents first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }
}
