//! Numeric helpers for the arithmetic operators.
//!
//! QTI floats are `f64`. Decimal rounding (`roundTo`, `equalRounded`) goes
//! through `rust_decimal` so that `2.675` rounds the way a person reading
//! the literal expects, half away from zero.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::EvalError;
use crate::expression::{MathFunction, RoundingMode, StatsFunction};

/// Rounds `value` to `figures` significant figures or decimal places.
///
/// Non-finite input is returned unchanged. Significant figures must be at
/// least 1 and decimal places at least 0.
pub fn round_to(value: f64, mode: RoundingMode, figures: i64) -> Result<f64, EvalError> {
    if !value.is_finite() {
        return Ok(value);
    }
    let digits = match mode {
        RoundingMode::SignificantFigures if figures >= 1 => figures as u32,
        RoundingMode::DecimalPlaces if figures >= 0 => figures as u32,
        _ => {
            return Err(EvalError::TypeMismatch {
                node: "roundTo",
                message: format!("invalid figures value {} for {:?}", figures, mode),
            })
        }
    };
    let decimal = to_decimal(value)?;
    let rounded = match mode {
        RoundingMode::SignificantFigures => decimal
            .round_sf_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero)
            .ok_or_else(|| EvalError::Overflow {
                message: format!("cannot round {} to {} significant figures", value, digits),
            })?,
        RoundingMode::DecimalPlaces => {
            decimal.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero)
        }
    };
    rounded
        .to_string()
        .parse::<f64>()
        .map_err(|_| EvalError::Overflow {
            message: format!("rounded value {} does not fit a float", rounded),
        })
}

/// Decimal from the shortest round-trip rendering of `value`.
fn to_decimal(value: f64) -> Result<Decimal, EvalError> {
    let text = format!("{}", value);
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&format!("{:e}", value)))
        .map_err(|_| EvalError::Overflow {
            message: format!("{} is outside the decimal range", value),
        })
}

/// QTI `round`: `n + 0.5` rounds up to `n + 1`. `None` for non-finite input
/// or a result outside the integer range.
pub fn round_half_up(value: f64) -> Option<i64> {
    float_to_int((value + 0.5).floor())
}

/// Truncates towards zero. `None` for non-finite input.
pub fn truncate(value: f64) -> Option<i64> {
    float_to_int(value.trunc())
}

fn float_to_int(value: f64) -> Option<i64> {
    if value.is_finite() && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

/// Division rounding towards negative infinity.
pub fn floor_div(x: i64, y: i64) -> Result<i64, EvalError> {
    if y == 0 {
        return Err(EvalError::DivisionByZero);
    }
    let q = x.checked_div(y).ok_or_else(|| EvalError::Overflow {
        message: format!("{} / {} overflows", x, y),
    })?;
    if (x % y != 0) && ((x < 0) != (y < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

/// `x - y * floor(x / y)`; the result takes the sign of `y`.
pub fn floor_mod(x: i64, y: i64) -> Result<i64, EvalError> {
    let q = floor_div(x, y)?;
    y.checked_mul(q)
        .and_then(|p| x.checked_sub(p))
        .ok_or_else(|| EvalError::Overflow {
            message: format!("{} mod {} overflows", x, y),
        })
}

pub fn gcd(values: &[i64]) -> i64 {
    values.iter().fold(0i64, |acc, v| gcd2(acc, v.abs()))
}

fn gcd2(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

/// Least common multiple; 0 when any operand is 0.
pub fn lcm(values: &[i64]) -> Result<i64, EvalError> {
    let mut acc: i64 = 1;
    for v in values {
        if *v == 0 {
            return Ok(0);
        }
        let g = gcd2(acc, v.abs());
        acc = (acc / g)
            .checked_mul(v.abs())
            .ok_or_else(|| EvalError::Overflow {
                message: "lcm overflows".to_string(),
            })?;
    }
    Ok(acc)
}

/// Summary statistic of `values`; `None` when it is undefined (empty input,
/// or fewer than two samples for the sample statistics).
pub fn stats(function: StatsFunction, values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>();
    match function {
        StatsFunction::Mean => Some(mean),
        StatsFunction::SampleVariance if n > 1 => Some(squares / (n - 1) as f64),
        StatsFunction::SampleSd if n > 1 => Some((squares / (n - 1) as f64).sqrt()),
        StatsFunction::PopVariance => Some(squares / n as f64),
        StatsFunction::PopSd => Some((squares / n as f64).sqrt()),
        StatsFunction::SampleVariance | StatsFunction::SampleSd => None,
    }
}

/// Applies a math function. NaN results are reported as `None`.
pub fn math(function: MathFunction, args: &[f64]) -> Option<f64> {
    let x = *args.first()?;
    let y = args.get(1).copied();
    let result = match function {
        MathFunction::Sin => x.sin(),
        MathFunction::Cos => x.cos(),
        MathFunction::Tan => x.tan(),
        MathFunction::Sec => 1.0 / x.cos(),
        MathFunction::Csc => 1.0 / x.sin(),
        MathFunction::Cot => 1.0 / x.tan(),
        MathFunction::Asin => x.asin(),
        MathFunction::Acos => x.acos(),
        MathFunction::Atan => x.atan(),
        MathFunction::Atan2 => x.atan2(y?),
        MathFunction::Asec => (1.0 / x).acos(),
        MathFunction::Acsc => (1.0 / x).asin(),
        MathFunction::Acot => (1.0 / x).atan(),
        MathFunction::Sinh => x.sinh(),
        MathFunction::Cosh => x.cosh(),
        MathFunction::Tanh => x.tanh(),
        MathFunction::Sech => 1.0 / x.cosh(),
        MathFunction::Csch => 1.0 / x.sinh(),
        MathFunction::Coth => 1.0 / x.tanh(),
        MathFunction::Log => x.log10(),
        MathFunction::Ln => x.ln(),
        MathFunction::Exp => x.exp(),
        MathFunction::Abs => x.abs(),
        MathFunction::Signum => {
            if x == 0.0 {
                0.0
            } else {
                x.signum()
            }
        }
        MathFunction::Floor => x.floor(),
        MathFunction::Ceil => x.ceil(),
        MathFunction::ToDegrees => x.to_degrees(),
        MathFunction::ToRadians => x.to_radians(),
    };
    if result.is_nan() {
        None
    } else {
        Some(result)
    }
}

/// Functions whose result is an integer.
pub fn math_returns_integer(function: MathFunction) -> bool {
    matches!(
        function,
        MathFunction::Signum | MathFunction::Floor | MathFunction::Ceil
    )
}

/// Interval test used by `equal` in its tolerance modes.
pub fn within_bounds(
    x: f64,
    lower: f64,
    upper: f64,
    include_lower: bool,
    include_upper: bool,
) -> bool {
    let above = if include_lower { x >= lower } else { x > lower };
    let below = if include_upper { x <= upper } else { x < upper };
    above && below
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
