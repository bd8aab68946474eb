//! Tree-walking evaluator for [`Expression`].
//!
//! Children evaluate first, then the node's operator. NULL operands give a
//! NULL result unless the operator says otherwise. Division by zero and
//! out-of-range indexing give NULL plus a warning notification; an
//! unresolved variable is an error for the calling rule to handle.

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;

use crate::context::{read_item_variable, EvalContext, ItemView};
use crate::error::EvalError;
use crate::expression::{
    Expression, FloatOrVariable, IntOrVariable, ItemSubset, MathConstant, MathFunction,
    ToleranceMode,
};
use crate::notification::Notification;
use crate::numeric;
use crate::response::{item_correctness, Correctness};
use crate::types::{
    bag_contains, BaseType, Cardinality, Identifier, SingleValue, Value, VariableKind,
    VariableRef,
};

/// Evaluates `expr` against `ctx`.
pub fn evaluate(expr: &Expression, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
    let value = eval_node(expr, ctx)?;
    tracing::trace!(node = expr.name(), %value, "evaluated");
    Ok(value)
}

fn mismatch(expr: &Expression, message: impl Into<String>) -> EvalError {
    EvalError::TypeMismatch {
        node: expr.name(),
        message: message.into(),
    }
}

/// Largest container `repeat` will build.
pub const MAX_CONTAINER_SIZE: usize = 1 << 20;

/// NULL result plus a warning for operators whose QTI contract says so.
fn null_with_warning(
    expr: &Expression,
    error: EvalError,
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    ctx.runtime.notify(Notification::warning(
        expr.name(),
        format!("{}; result is NULL", error),
    ));
    Ok(Value::Null)
}

fn eval_all(list: &[Expression], ctx: &mut EvalContext<'_>) -> Result<Vec<Value>, EvalError> {
    list.iter().map(|e| evaluate(e, ctx)).collect()
}

fn eval_pair(
    pair: &[Expression; 2],
    ctx: &mut EvalContext<'_>,
) -> Result<(Value, Value), EvalError> {
    Ok((evaluate(&pair[0], ctx)?, evaluate(&pair[1], ctx)?))
}

fn resolve_int(
    expr: &Expression,
    value: &IntOrVariable,
    ctx: &EvalContext<'_>,
) -> Result<Option<i64>, EvalError> {
    match value {
        IntOrVariable::Int(n) => Ok(Some(*n)),
        IntOrVariable::Variable(id) => {
            let v = ctx.scope.lookup(&VariableRef::local(id.clone()))?;
            match v {
                Value::Null => Ok(None),
                other => other
                    .as_i64()
                    .map(Some)
                    .ok_or_else(|| mismatch(expr, format!("'{}' is not an integer", id))),
            }
        }
    }
}

fn resolve_float(
    expr: &Expression,
    value: &FloatOrVariable,
    ctx: &EvalContext<'_>,
) -> Result<Option<f64>, EvalError> {
    match value {
        FloatOrVariable::Float(x) => Ok(Some(*x)),
        FloatOrVariable::Variable(id) => {
            let v = ctx.scope.lookup(&VariableRef::local(id.clone()))?;
            match v {
                Value::Null => Ok(None),
                other => other
                    .as_f64()
                    .map(Some)
                    .ok_or_else(|| mismatch(expr, format!("'{}' is not numeric", id))),
            }
        }
    }
}

// ──────────────────────────────────────────────
// Numeric operands
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(x) => x,
        }
    }
}

fn to_num(expr: &Expression, v: &SingleValue) -> Result<Num, EvalError> {
    match v {
        SingleValue::Integer(n) => Ok(Num::Int(*n)),
        SingleValue::Float(x) => Ok(Num::Float(*x)),
        other => Err(mismatch(
            expr,
            format!("expected a number, got {}", other.base_type()),
        )),
    }
}

/// A single numeric operand; `None` for NULL.
fn single_num(expr: &Expression, value: &Value) -> Result<Option<Num>, EvalError> {
    match value {
        Value::Null => Ok(None),
        Value::Single(v) => to_num(expr, v).map(Some),
        other => Err(mismatch(
            expr,
            format!("expected a single number, got {}", describe(other)),
        )),
    }
}

/// Numbers from single or container operands; `None` if any operand is NULL.
fn flatten_nums(expr: &Expression, values: &[Value]) -> Result<Option<Vec<Num>>, EvalError> {
    let mut out = Vec::new();
    for value in values {
        if value.is_null_like() {
            return Ok(None);
        }
        match value.members() {
            Some(members) => {
                for m in members {
                    out.push(to_num(expr, m)?);
                }
            }
            None => return Err(mismatch(expr, "records are not numeric")),
        }
    }
    Ok(Some(out))
}

fn flatten_ints(expr: &Expression, values: &[Value]) -> Result<Option<Vec<i64>>, EvalError> {
    flatten_nums(expr, values)?
        .map(|nums| {
            nums.into_iter()
                .map(|n| match n {
                    Num::Int(i) => Ok(i),
                    Num::Float(_) => Err(mismatch(expr, "expected integers")),
                })
                .collect()
        })
        .transpose()
}

fn describe(value: &Value) -> String {
    value
        .signature()
        .map_or_else(|| "NULL".to_string(), |s| s.to_string())
}

fn single_bool(expr: &Expression, value: &Value) -> Result<Option<bool>, EvalError> {
    match value {
        Value::Null => Ok(None),
        other => other
            .as_bool()
            .map(Some)
            .ok_or_else(|| mismatch(expr, format!("expected boolean, got {}", describe(other)))),
    }
}

fn single_str<'v>(expr: &Expression, value: &'v Value) -> Result<Option<&'v str>, EvalError> {
    match value {
        Value::Null => Ok(None),
        Value::Single(SingleValue::String(s)) if s.is_empty() => Ok(None),
        Value::Single(SingleValue::String(s)) => Ok(Some(s)),
        other => Err(mismatch(
            expr,
            format!("expected string, got {}", describe(other)),
        )),
    }
}

fn float_or_null(x: f64) -> Value {
    if x.is_finite() {
        Value::float(x)
    } else {
        Value::Null
    }
}

// ──────────────────────────────────────────────
// Dispatch
// ──────────────────────────────────────────────

fn eval_node(expr: &Expression, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
    use Expression as E;
    match expr {
        E::BaseValue(v) => Ok(Value::Single(v.clone())),
        E::Variable {
            identifier,
            weight_identifier,
        } => {
            let value = ctx.scope.lookup(identifier)?;
            let weight = weight_identifier
                .as_ref()
                .and_then(|w| ctx.scope.weight(identifier, w));
            Ok(match (weight, &value) {
                (Some(w), Value::Single(SingleValue::Integer(n))) => Value::float(*n as f64 * w),
                (Some(w), Value::Single(SingleValue::Float(x))) => Value::float(x * w),
                _ => value,
            })
        }
        E::Default { identifier } => ctx.scope.default_value(identifier),
        E::Correct { identifier } => ctx.scope.correct_response(identifier),
        E::MapResponse { identifier } => {
            let mapping = ctx
                .scope
                .declaration(identifier.as_str())
                .and_then(|d| d.mapping().cloned())
                .ok_or_else(|| mismatch(expr, format!("'{}' has no mapping", identifier)))?;
            let value = ctx.scope.lookup(&VariableRef::local(identifier.clone()))?;
            Ok(Value::float(mapping.map(&value)))
        }
        E::MapResponsePoint { identifier } => {
            let mapping = ctx
                .scope
                .declaration(identifier.as_str())
                .and_then(|d| d.area_mapping().cloned())
                .ok_or_else(|| mismatch(expr, format!("'{}' has no area mapping", identifier)))?;
            let value = ctx.scope.lookup(&VariableRef::local(identifier.clone()))?;
            Ok(Value::float(mapping.map(&value)))
        }
        E::Null => Ok(Value::Null),
        E::RandomInteger { min, max, step } => {
            let (min, max, step) = match (
                resolve_int(expr, min, ctx)?,
                resolve_int(expr, max, ctx)?,
                resolve_int(expr, step, ctx)?,
            ) {
                (Some(a), Some(b), Some(s)) => (a, b, s.max(1)),
                _ => return Ok(Value::Null),
            };
            if min > max {
                return null_with_warning(
                    expr,
                    mismatch(expr, format!("min {} exceeds max {}", min, max)),
                    ctx,
                );
            }
            let Some(span) = max.checked_sub(min) else {
                return null_with_warning(
                    expr,
                    EvalError::Overflow {
                        message: format!("range [{}, {}] is too wide", min, max),
                    },
                    ctx,
                );
            };
            let steps = span / step;
            let k = ctx.runtime.rng().gen_range(0..=steps);
            Ok(Value::integer(min + k * step))
        }
        E::RandomFloat { min, max } => {
            let (min, max) = match (resolve_float(expr, min, ctx)?, resolve_float(expr, max, ctx)?)
            {
                (Some(a), Some(b)) => (a, b),
                _ => return Ok(Value::Null),
            };
            if min > max || !min.is_finite() || !max.is_finite() {
                return null_with_warning(
                    expr,
                    mismatch(expr, format!("invalid range [{}, {}]", min, max)),
                    ctx,
                );
            }
            if min == max {
                return Ok(Value::float(min));
            }
            Ok(Value::float(ctx.runtime.rng().gen_range(min..=max)))
        }
        E::MathConstant(c) => Ok(Value::float(match c {
            MathConstant::Pi => std::f64::consts::PI,
            MathConstant::E => std::f64::consts::E,
        })),

        E::NumberCorrect(subset) => count_items(expr, subset, ctx, |view| {
            item_correctness(view.item, view.state) == Correctness::Correct
        }),
        E::NumberIncorrect(subset) => count_items(expr, subset, ctx, |view| {
            view.state.num_attempts > 0
                && item_correctness(view.item, view.state) == Correctness::Incorrect
        }),
        E::NumberPresented(subset) => {
            count_items(expr, subset, ctx, |view| view.state.presented)
        }
        E::NumberResponded(subset) => {
            count_items(expr, subset, ctx, |view| view.state.responded)
        }
        E::NumberSelected(subset) => count_items(expr, subset, ctx, |_| true),
        E::OutcomeMaximum {
            subset,
            outcome_identifier,
            weight_identifier,
        } => outcome_bound(
            expr,
            subset,
            outcome_identifier,
            weight_identifier.as_ref(),
            true,
            ctx,
        ),
        E::OutcomeMinimum {
            subset,
            outcome_identifier,
            weight_identifier,
        } => outcome_bound(
            expr,
            subset,
            outcome_identifier,
            weight_identifier.as_ref(),
            false,
            ctx,
        ),
        E::TestVariables {
            subset,
            variable_identifier,
            weight_identifier,
            base_type,
        } => test_variables(
            expr,
            subset,
            variable_identifier,
            weight_identifier.as_ref(),
            *base_type,
            ctx,
        ),

        E::Multiple(list) => {
            let values = eval_all(list, ctx)?;
            build_container(expr, Cardinality::Multiple, &values)
        }
        E::Ordered(list) => {
            let values = eval_all(list, ctx)?;
            build_container(expr, Cardinality::Ordered, &values)
        }
        E::ContainerSize(inner) => {
            let v = evaluate(inner, ctx)?;
            match v {
                Value::Null => Ok(Value::integer(0)),
                Value::Multiple { values, .. } | Value::Ordered { values, .. } => {
                    Ok(Value::integer(values.len() as i64))
                }
                other => Err(mismatch(
                    expr,
                    format!("expected a container, got {}", describe(&other)),
                )),
            }
        }
        E::IsNull(inner) => Ok(Value::boolean(evaluate(inner, ctx)?.is_null_like())),
        E::Index { n, expression } => {
            let v = evaluate(expression, ctx)?;
            if v.is_null_like() {
                return Ok(Value::Null);
            }
            let values = match &v {
                Value::Ordered { values, .. } => values,
                other => {
                    return Err(mismatch(
                        expr,
                        format!("expected ordered, got {}", describe(other)),
                    ))
                }
            };
            let Some(index) = resolve_int(expr, n, ctx)? else {
                return Ok(Value::Null);
            };
            if index < 1 || index as usize > values.len() {
                let error = EvalError::IndexOutOfRange {
                    index,
                    size: values.len(),
                };
                return null_with_warning(expr, error, ctx);
            }
            Ok(Value::Single(values[index as usize - 1].clone()))
        }
        E::FieldValue {
            field_identifier,
            expression,
        } => match evaluate(expression, ctx)? {
            Value::Null => Ok(Value::Null),
            Value::Record(fields) => Ok(fields
                .get(field_identifier.as_str())
                .cloned()
                .map_or(Value::Null, Value::Single)),
            other => Err(mismatch(
                expr,
                format!("expected record, got {}", describe(&other)),
            )),
        },
        E::Random(inner) => {
            let v = evaluate(inner, ctx)?;
            match v.container_values() {
                Some(values) if !values.is_empty() => {
                    let pick = values.choose(ctx.runtime.rng()).cloned();
                    Ok(pick.map_or(Value::Null, Value::Single))
                }
                Some(_) => Ok(Value::Null),
                None if v.is_null() => Ok(Value::Null),
                None => Err(mismatch(
                    expr,
                    format!("expected a container, got {}", describe(&v)),
                )),
            }
        }
        E::Member(pair) => {
            let (needle, haystack) = eval_pair(pair, ctx)?;
            if needle.is_null_like() || haystack.is_null_like() {
                return Ok(Value::Null);
            }
            let needle = needle
                .as_single()
                .ok_or_else(|| mismatch(expr, "first operand must be single"))?;
            if haystack.container_values().is_none() {
                return Err(mismatch(expr, "second operand must be a container"));
            }
            Ok(Value::boolean(haystack.contains(needle)))
        }
        E::Delete(pair) => {
            let (needle, haystack) = eval_pair(pair, ctx)?;
            if needle.is_null_like() || haystack.is_null() {
                return Ok(Value::Null);
            }
            let needle = needle
                .as_single()
                .ok_or_else(|| mismatch(expr, "first operand must be single"))?;
            match haystack {
                Value::Multiple { base_type, values } => Ok(Value::multiple(
                    base_type,
                    values.into_iter().filter(|v| v != needle).collect(),
                )),
                Value::Ordered { base_type, values } => Ok(Value::ordered(
                    base_type,
                    values.into_iter().filter(|v| v != needle).collect(),
                )),
                other => Err(mismatch(
                    expr,
                    format!("expected a container, got {}", describe(&other)),
                )),
            }
        }
        E::Contains(pair) => {
            let (outer, inner) = eval_pair(pair, ctx)?;
            if outer.is_null_like() || inner.is_null_like() {
                return Ok(Value::Null);
            }
            match (&outer, &inner) {
                (Value::Multiple { values: a, .. }, Value::Multiple { values: b, .. }) => {
                    Ok(Value::boolean(bag_contains(a, b)))
                }
                (Value::Ordered { values: a, .. }, Value::Ordered { values: b, .. }) => {
                    Ok(Value::boolean(a.windows(b.len()).any(|w| w == b.as_slice())))
                }
                _ => Err(mismatch(
                    expr,
                    "operands must be containers of the same cardinality",
                )),
            }
        }
        E::Repeat {
            number_repeats,
            expressions,
        } => {
            let Some(n) = resolve_int(expr, number_repeats, ctx)? else {
                return Ok(Value::Null);
            };
            if n < 1 {
                return Ok(Value::Null);
            }
            let values = eval_all(expressions, ctx)?;
            let once = build_container(expr, Cardinality::Ordered, &values)?;
            match once {
                Value::Ordered { base_type, values } if !values.is_empty() => {
                    let count = usize::try_from(n).ok().filter(|&n| {
                        values
                            .len()
                            .checked_mul(n)
                            .is_some_and(|total| total <= MAX_CONTAINER_SIZE)
                    });
                    let Some(count) = count else {
                        return null_with_warning(
                            expr,
                            EvalError::ContainerTooLarge {
                                node: expr.name(),
                                limit: MAX_CONTAINER_SIZE,
                            },
                            ctx,
                        );
                    };
                    let mut repeated = Vec::with_capacity(values.len() * count);
                    for _ in 0..count {
                        repeated.extend(values.iter().cloned());
                    }
                    Ok(Value::ordered(base_type, repeated))
                }
                other => Ok(other),
            }
        }

        E::Not(inner) => {
            let v = evaluate(inner, ctx)?;
            Ok(single_bool(expr, &v)?.map_or(Value::Null, |b| Value::boolean(!b)))
        }
        E::And(list) => {
            let mut saw_null = false;
            for v in eval_all(list, ctx)? {
                match single_bool(expr, &v)? {
                    Some(false) => return Ok(Value::boolean(false)),
                    Some(true) => {}
                    None => saw_null = true,
                }
            }
            Ok(if saw_null { Value::Null } else { Value::boolean(true) })
        }
        E::Or(list) => {
            let mut saw_null = false;
            for v in eval_all(list, ctx)? {
                match single_bool(expr, &v)? {
                    Some(true) => return Ok(Value::boolean(true)),
                    Some(false) => {}
                    None => saw_null = true,
                }
            }
            Ok(if saw_null { Value::Null } else { Value::boolean(false) })
        }
        E::AnyN {
            min,
            max,
            expressions,
        } => {
            let (Some(min), Some(max)) = (resolve_int(expr, min, ctx)?, resolve_int(expr, max, ctx)?)
            else {
                return Ok(Value::Null);
            };
            let (mut trues, mut nulls) = (0i64, 0i64);
            for v in eval_all(expressions, ctx)? {
                match single_bool(expr, &v)? {
                    Some(true) => trues += 1,
                    Some(false) => {}
                    None => nulls += 1,
                }
            }
            if trues >= min && trues <= max && nulls == 0 {
                Ok(Value::boolean(true))
            } else if trues > max || trues + nulls < min {
                Ok(Value::boolean(false))
            } else if trues >= min && trues + nulls <= max {
                Ok(Value::boolean(true))
            } else {
                Ok(Value::Null)
            }
        }
        E::Match(pair) => {
            let (a, b) = eval_pair(pair, ctx)?;
            if a.is_null_like() || b.is_null_like() {
                return Ok(Value::Null);
            }
            if a.signature() != b.signature() {
                return Err(mismatch(
                    expr,
                    format!("cannot match {} with {}", describe(&a), describe(&b)),
                ));
            }
            Ok(Value::boolean(a == b))
        }
        E::Equal {
            tolerance_mode,
            tolerance,
            include_lower_bound,
            include_upper_bound,
            operands,
        } => {
            let (a, b) = eval_pair(operands, ctx)?;
            let (Some(x), Some(y)) = (single_num(expr, &a)?, single_num(expr, &b)?) else {
                return Ok(Value::Null);
            };
            let (x, y) = (x.as_f64(), y.as_f64());
            if *tolerance_mode == ToleranceMode::Exact {
                return Ok(Value::boolean(x == y));
            }
            let mut bounds = Vec::with_capacity(2);
            for t in tolerance.iter().take(2) {
                match resolve_float(expr, t, ctx)? {
                    Some(t) => bounds.push(t),
                    None => return Ok(Value::Null),
                }
            }
            let (t0, t1) = match bounds.as_slice() {
                [t0] => (*t0, *t0),
                [t0, t1] => (*t0, *t1),
                _ => return Err(mismatch(expr, "tolerance mode needs a tolerance")),
            };
            if t0 <= 0.0 || t1 <= 0.0 {
                return null_with_warning(
                    expr,
                    EvalError::InvalidTolerance {
                        first: t0,
                        second: t1,
                    },
                    ctx,
                );
            }
            let (lower, upper) = match tolerance_mode {
                ToleranceMode::Absolute => (y - t0, y + t1),
                _ => (y * (1.0 - t0 / 100.0), y * (1.0 + t1 / 100.0)),
            };
            Ok(Value::boolean(numeric::within_bounds(
                x,
                lower,
                upper,
                *include_lower_bound,
                *include_upper_bound,
            )))
        }
        E::EqualRounded {
            rounding_mode,
            figures,
            operands,
        } => {
            let (a, b) = eval_pair(operands, ctx)?;
            let (Some(x), Some(y)) = (single_num(expr, &a)?, single_num(expr, &b)?) else {
                return Ok(Value::Null);
            };
            let Some(figures) = resolve_int(expr, figures, ctx)? else {
                return Ok(Value::Null);
            };
            let rx = numeric::round_to(x.as_f64(), *rounding_mode, figures)?;
            let ry = numeric::round_to(y.as_f64(), *rounding_mode, figures)?;
            Ok(Value::boolean(rx == ry))
        }
        E::Lt(pair) => compare(expr, pair, ctx, |a, b| a < b),
        E::Gt(pair) => compare(expr, pair, ctx, |a, b| a > b),
        E::Lte(pair) => compare(expr, pair, ctx, |a, b| a <= b),
        E::Gte(pair) => compare(expr, pair, ctx, |a, b| a >= b),
        E::DurationLt(pair) => compare_durations(expr, pair, ctx, |a, b| a < b),
        E::DurationGte(pair) => compare_durations(expr, pair, ctx, |a, b| a >= b),
        E::Inside { shape, expression } => {
            let v = evaluate(expression, ctx)?;
            if v.is_null_like() {
                return Ok(Value::Null);
            }
            let members = v
                .members()
                .ok_or_else(|| mismatch(expr, "records have no points"))?;
            let mut inside = false;
            for m in members {
                match m {
                    SingleValue::Point { x, y } => inside |= shape.contains(*x as f64, *y as f64),
                    other => {
                        return Err(mismatch(
                            expr,
                            format!("expected points, got {}", other.base_type()),
                        ))
                    }
                }
            }
            Ok(Value::boolean(inside))
        }

        E::Substring {
            case_sensitive,
            operands,
        } => {
            let (a, b) = eval_pair(operands, ctx)?;
            let (Some(needle), Some(haystack)) = (single_str(expr, &a)?, single_str(expr, &b)?)
            else {
                return Ok(Value::Null);
            };
            Ok(Value::boolean(if *case_sensitive {
                haystack.contains(needle)
            } else {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }))
        }
        E::StringMatch {
            case_sensitive,
            substring,
            operands,
        } => {
            let (a, b) = eval_pair(operands, ctx)?;
            let (Some(first), Some(second)) = (single_str(expr, &a)?, single_str(expr, &b)?)
            else {
                return Ok(Value::Null);
            };
            let (first, second) = if *case_sensitive {
                (first.to_string(), second.to_string())
            } else {
                (first.to_lowercase(), second.to_lowercase())
            };
            Ok(Value::boolean(if *substring {
                first.contains(&second)
            } else {
                first == second
            }))
        }
        E::PatternMatch {
            pattern,
            expression,
        } => {
            let v = evaluate(expression, ctx)?;
            let Some(text) = single_str(expr, &v)? else {
                return Ok(Value::Null);
            };
            let regex = anchored_regex(pattern)?;
            Ok(Value::boolean(regex.is_match(text)))
        }

        E::Sum(list) => {
            let values = eval_all(list, ctx)?;
            let Some(nums) = flatten_nums(expr, &values)? else {
                return Ok(Value::Null);
            };
            fold_nums(expr, &nums, 0, 0.0, i64::checked_add, |a, b| a + b, ctx)
        }
        E::Product(list) => {
            let values = eval_all(list, ctx)?;
            let Some(nums) = flatten_nums(expr, &values)? else {
                return Ok(Value::Null);
            };
            fold_nums(expr, &nums, 1, 1.0, i64::checked_mul, |a, b| a * b, ctx)
        }
        E::Subtract(pair) => {
            let (a, b) = eval_pair(pair, ctx)?;
            match (single_num(expr, &a)?, single_num(expr, &b)?) {
                (Some(Num::Int(x)), Some(Num::Int(y))) => match x.checked_sub(y) {
                    Some(d) => Ok(Value::integer(d)),
                    None => null_with_warning(
                        expr,
                        EvalError::Overflow {
                            message: format!("{} - {}", x, y),
                        },
                        ctx,
                    ),
                },
                (Some(x), Some(y)) => Ok(float_or_null(x.as_f64() - y.as_f64())),
                _ => Ok(Value::Null),
            }
        }
        E::Divide(pair) => {
            let (a, b) = eval_pair(pair, ctx)?;
            let (Some(x), Some(y)) = (single_num(expr, &a)?, single_num(expr, &b)?) else {
                return Ok(Value::Null);
            };
            if y.as_f64() == 0.0 {
                return null_with_warning(expr, EvalError::DivisionByZero, ctx);
            }
            Ok(float_or_null(x.as_f64() / y.as_f64()))
        }
        E::Power(pair) => {
            let (a, b) = eval_pair(pair, ctx)?;
            let (Some(x), Some(y)) = (single_num(expr, &a)?, single_num(expr, &b)?) else {
                return Ok(Value::Null);
            };
            Ok(float_or_null(x.as_f64().powf(y.as_f64())))
        }
        E::IntegerDivide(pair) | E::IntegerModulus(pair) => {
            let (a, b) = eval_pair(pair, ctx)?;
            let (x, y) = match (single_num(expr, &a)?, single_num(expr, &b)?) {
                (Some(Num::Int(x)), Some(Num::Int(y))) => (x, y),
                (None, _) | (_, None) => return Ok(Value::Null),
                _ => return Err(mismatch(expr, "operands must be integers")),
            };
            let result = if matches!(expr, E::IntegerDivide(_)) {
                numeric::floor_div(x, y)
            } else {
                numeric::floor_mod(x, y)
            };
            match result {
                Ok(n) => Ok(Value::integer(n)),
                Err(error) => null_with_warning(expr, error, ctx),
            }
        }
        E::Truncate(inner) | E::Round(inner) => {
            let v = evaluate(inner, ctx)?;
            match single_num(expr, &v)? {
                None => Ok(Value::Null),
                Some(Num::Int(n)) => Ok(Value::integer(n)),
                Some(Num::Float(x)) => {
                    let n = if matches!(expr, E::Truncate(_)) {
                        numeric::truncate(x)
                    } else {
                        numeric::round_half_up(x)
                    };
                    Ok(n.map_or(Value::Null, Value::integer))
                }
            }
        }
        E::RoundTo {
            rounding_mode,
            figures,
            expression,
        } => {
            let v = evaluate(expression, ctx)?;
            let Some(x) = single_num(expr, &v)? else {
                return Ok(Value::Null);
            };
            let Some(figures) = resolve_int(expr, figures, ctx)? else {
                return Ok(Value::Null);
            };
            Ok(Value::float(numeric::round_to(
                x.as_f64(),
                *rounding_mode,
                figures,
            )?))
        }
        E::IntegerToFloat(inner) => {
            let v = evaluate(inner, ctx)?;
            match single_num(expr, &v)? {
                None => Ok(Value::Null),
                Some(Num::Int(n)) => Ok(Value::float(n as f64)),
                Some(Num::Float(_)) => Err(mismatch(expr, "operand must be an integer")),
            }
        }
        E::Max(list) | E::Min(list) => {
            let values = eval_all(list, ctx)?;
            let Some(nums) = flatten_nums(expr, &values)? else {
                return Ok(Value::Null);
            };
            if nums.is_empty() {
                return Ok(Value::Null);
            }
            let want_max = matches!(expr, E::Max(_));
            if nums.iter().all(|n| matches!(n, Num::Int(_))) {
                let ints = nums.iter().filter_map(|n| match n {
                    Num::Int(i) => Some(*i),
                    Num::Float(_) => None,
                });
                let best = if want_max { ints.max() } else { ints.min() };
                return Ok(best.map_or(Value::Null, Value::integer));
            }
            let floats = nums.iter().map(|n| n.as_f64());
            let best = if want_max {
                floats.fold(f64::NEG_INFINITY, f64::max)
            } else {
                floats.fold(f64::INFINITY, f64::min)
            };
            Ok(Value::float(best))
        }
        E::Gcd(list) => {
            let values = eval_all(list, ctx)?;
            Ok(flatten_ints(expr, &values)?
                .map_or(Value::Null, |ints| Value::integer(numeric::gcd(&ints))))
        }
        E::Lcm(list) => {
            let values = eval_all(list, ctx)?;
            let Some(ints) = flatten_ints(expr, &values)? else {
                return Ok(Value::Null);
            };
            match numeric::lcm(&ints) {
                Ok(n) => Ok(Value::integer(n)),
                Err(error) => null_with_warning(expr, error, ctx),
            }
        }
        E::StatsOperator { name, expression } => {
            let v = evaluate(expression, ctx)?;
            if v.is_null_like() {
                return Ok(Value::Null);
            }
            if v.container_values().is_none() {
                return Err(mismatch(expr, "operand must be a container"));
            }
            let Some(nums) = flatten_nums(expr, &[v])? else {
                return Ok(Value::Null);
            };
            let floats: Vec<f64> = nums.iter().map(|n| n.as_f64()).collect();
            Ok(numeric::stats(*name, &floats).map_or(Value::Null, float_or_null))
        }
        E::MathOperator { name, expressions } => {
            let values = eval_all(expressions, ctx)?;
            if values.len() != name.arity() {
                return Err(mismatch(
                    expr,
                    format!("expected {} operand(s), got {}", name.arity(), values.len()),
                ));
            }
            let mut args = Vec::with_capacity(values.len());
            for v in &values {
                match single_num(expr, v)? {
                    Some(n) => args.push(n),
                    None => return Ok(Value::Null),
                }
            }
            if *name == MathFunction::Abs {
                if let [Num::Int(n)] = args.as_slice() {
                    return Ok(n.checked_abs().map_or(Value::Null, Value::integer));
                }
            }
            let floats: Vec<f64> = args.iter().map(|n| n.as_f64()).collect();
            let Some(result) = numeric::math(*name, &floats) else {
                return Ok(Value::Null);
            };
            if numeric::math_returns_integer(*name) {
                return Ok(numeric::truncate(result).map_or(Value::Null, Value::integer));
            }
            Ok(Value::float(result))
        }

        E::CustomOperator { class, expressions } => {
            let args = eval_all(expressions, ctx)?;
            let operator = ctx
                .extensions
                .operator(class)
                .ok_or_else(|| EvalError::UnknownExtension {
                    class: class.clone(),
                })?;
            operator.evaluate(&args)
        }
    }
}

// ──────────────────────────────────────────────
// Operator helpers
// ──────────────────────────────────────────────

/// `^(?:pattern)$`: QTI patterns match the whole string.
pub(crate) fn anchored_regex(pattern: &str) -> Result<Regex, EvalError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| EvalError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

fn compare(
    expr: &Expression,
    pair: &[Expression; 2],
    ctx: &mut EvalContext<'_>,
    op: fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    let (a, b) = eval_pair(pair, ctx)?;
    match (single_num(expr, &a)?, single_num(expr, &b)?) {
        (Some(x), Some(y)) => Ok(Value::boolean(op(x.as_f64(), y.as_f64()))),
        _ => Ok(Value::Null),
    }
}

fn compare_durations(
    expr: &Expression,
    pair: &[Expression; 2],
    ctx: &mut EvalContext<'_>,
    op: fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    let (a, b) = eval_pair(pair, ctx)?;
    let seconds = |v: &Value| -> Result<Option<f64>, EvalError> {
        match v {
            Value::Null => Ok(None),
            Value::Single(SingleValue::Duration(s)) => Ok(Some(*s)),
            // the built-in `duration` variable is declared float
            Value::Single(SingleValue::Float(s)) => Ok(Some(*s)),
            other => Err(mismatch(
                expr,
                format!("expected duration, got {}", describe(other)),
            )),
        }
    };
    match (seconds(&a)?, seconds(&b)?) {
        (Some(x), Some(y)) => Ok(Value::boolean(op(x, y))),
        _ => Ok(Value::Null),
    }
}

fn fold_nums(
    expr: &Expression,
    nums: &[Num],
    int_start: i64,
    float_start: f64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    if nums.iter().all(|n| matches!(n, Num::Int(_))) {
        let mut acc = int_start;
        for n in nums {
            if let Num::Int(i) = n {
                match int_op(acc, *i) {
                    Some(next) => acc = next,
                    None => {
                        let error = EvalError::Overflow {
                            message: "integer result out of range".to_string(),
                        };
                        return null_with_warning(expr, error, ctx);
                    }
                }
            }
        }
        return Ok(Value::integer(acc));
    }
    let total = nums
        .iter()
        .fold(float_start, |acc, n| float_op(acc, n.as_f64()));
    Ok(float_or_null(total))
}

/// Flattens the operands of `multiple`/`ordered`; NULLs are dropped and an
/// all-NULL result is NULL.
fn build_container(
    expr: &Expression,
    cardinality: Cardinality,
    values: &[Value],
) -> Result<Value, EvalError> {
    let mut base_type: Option<BaseType> = None;
    let mut out = Vec::new();
    for value in values {
        if value.is_null() {
            continue;
        }
        let allowed = match value.cardinality() {
            Some(Cardinality::Single) => true,
            Some(c) => c == cardinality,
            None => false,
        };
        if !allowed {
            return Err(mismatch(
                expr,
                format!("cannot contain {}", describe(value)),
            ));
        }
        let bt = value.base_type();
        match (base_type, bt) {
            (None, Some(b)) => base_type = Some(b),
            (Some(a), Some(b)) if a != b => {
                return Err(mismatch(
                    expr,
                    format!("mixed base types {} and {}", a, b),
                ))
            }
            _ => {}
        }
        if let Some(members) = value.members() {
            out.extend(members.into_iter().cloned());
        }
    }
    match base_type {
        Some(base_type) if !out.is_empty() => {
            Ok(Value::container(cardinality, base_type, out).unwrap_or_default())
        }
        _ => Ok(Value::Null),
    }
}

fn test_items<'c>(
    expr: &Expression,
    subset: &ItemSubset,
    ctx: &'c EvalContext<'_>,
) -> Result<Vec<ItemView<'c>>, EvalError> {
    ctx.scope
        .items(subset)
        .ok_or(EvalError::NotInTestContext { node: expr.name() })
}

fn count_items(
    expr: &Expression,
    subset: &ItemSubset,
    ctx: &mut EvalContext<'_>,
    predicate: impl Fn(&ItemView<'_>) -> bool,
) -> Result<Value, EvalError> {
    let items = test_items(expr, subset, ctx)?;
    Ok(Value::integer(
        items.iter().filter(|v| predicate(v)).count() as i64,
    ))
}

fn outcome_bound(
    expr: &Expression,
    subset: &ItemSubset,
    outcome: &Identifier,
    weight: Option<&Identifier>,
    maximum: bool,
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    let items = test_items(expr, subset, ctx)?;
    let mut bounds = Vec::new();
    for view in &items {
        let Some(declaration) = view
            .item
            .declaration(outcome.as_str())
            .filter(|d| d.kind == VariableKind::Outcome)
        else {
            continue;
        };
        let data = declaration.outcome.as_ref();
        let bound = if maximum {
            data.and_then(|o| o.normal_maximum)
        } else {
            data.and_then(|o| o.normal_minimum)
        };
        let Some(bound) = bound else {
            return Ok(Value::Null);
        };
        let w = weight
            .and_then(|w| view.item_ref.weight(w.as_str()))
            .unwrap_or(1.0);
        bounds.push(SingleValue::Float(bound * w));
    }
    if bounds.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::multiple(BaseType::Float, bounds))
}

fn test_variables(
    expr: &Expression,
    subset: &ItemSubset,
    variable: &Identifier,
    weight: Option<&Identifier>,
    base_type: Option<BaseType>,
    ctx: &mut EvalContext<'_>,
) -> Result<Value, EvalError> {
    let items = test_items(expr, subset, ctx)?;
    let mut nums = Vec::new();
    let mut weighted = false;
    for view in &items {
        let Some(Value::Single(value)) = read_item_variable(view.item, view.state, variable.as_str())
        else {
            continue;
        };
        if base_type.is_some_and(|bt| value.base_type() != bt) {
            continue;
        }
        let Ok(num) = to_num(expr, &value) else {
            continue;
        };
        match weight.and_then(|w| view.item_ref.weight(w.as_str())) {
            Some(w) => {
                weighted = true;
                nums.push(Num::Float(num.as_f64() * w));
            }
            None => nums.push(num),
        }
    }
    if nums.is_empty() {
        return Ok(Value::Null);
    }
    let all_int = !weighted
        && base_type != Some(BaseType::Float)
        && nums.iter().all(|n| matches!(n, Num::Int(_)));
    if all_int {
        let ints = nums
            .iter()
            .filter_map(|n| match n {
                Num::Int(i) => Some(SingleValue::Integer(*i)),
                Num::Float(_) => None,
            })
            .collect();
        Ok(Value::multiple(BaseType::Integer, ints))
    } else {
        let floats = nums
            .iter()
            .map(|n| SingleValue::Float(n.as_f64()))
            .collect();
        Ok(Value::multiple(BaseType::Float, floats))
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
