//! Arithmetic on the numeric tower: i64 fast path, `BigInt` on overflow,
//! IEEE doubles for floats. Every function returns `None` when the
//! operands are not both numbers so the caller can try dunder methods.
use std::cmp::Ordering;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::{BinaryOp, ExcType, RunError, RunResult, Value};

fn zero_division(message: &str) -> RunError {
    RunError::new(ExcType::ZeroDivisionError, message)
}

pub fn binary(op: BinaryOp, a: &Value, b: &Value) -> Option<RunResult<Value>> {
    if let (Value::Bool(x), Value::Bool(y)) = (a, b) {
        match op {
            BinaryOp::And => return Some(Ok(Value::Bool(*x & *y))),
            BinaryOp::Or => return Some(Ok(Value::Bool(*x | *y))),
            BinaryOp::Xor => return Some(Ok(Value::Bool(*x ^ *y))),
            _ => (),
        }
    }
    if a.is_int() && b.is_int() {
        return Some(match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => small(op, x, y),
            _ => big(op, a.to_bigint()?, b.to_bigint()?),
        });
    }
    if a.is_number() && b.is_number() {
        return float(op, a.to_f64()?, b.to_f64()?);
    }
    None
}

fn small(op: BinaryOp, a: i64, b: i64) -> RunResult<Value> {
    let fast = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::TrueDiv => {
            if b == 0 {
                return Err(zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            if a == i64::MIN && b == -1 {
                None
            } else {
                Some(a.div_floor(&b))
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer modulo by zero"));
            }
            if b == -1 { Some(0) } else { Some(a.mod_floor(&b)) }
        }
        BinaryOp::Pow => {
            if b < 0 {
                return float_pow(a as f64, b as f64);
            }
            u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp))
        }
        BinaryOp::LShift => {
            if b < 0 {
                return Err(RunError::value_error("negative shift count"));
            }
            if a == 0 {
                Some(0)
            } else if b < 63 && (a << b) >> b == a {
                Some(a << b)
            } else {
                None
            }
        }
        BinaryOp::RShift => {
            if b < 0 {
                return Err(RunError::value_error("negative shift count"));
            }
            Some(if b >= 64 { if a < 0 { -1 } else { 0 } } else { a >> b })
        }
        BinaryOp::And => Some(a & b),
        BinaryOp::Or => Some(a | b),
        BinaryOp::Xor => Some(a ^ b),
    };
    match fast {
        Some(result) => Ok(Value::Int(result)),
        None => big(op, BigInt::from(a), BigInt::from(b)),
    }
}

fn big(op: BinaryOp, a: BigInt, b: BigInt) -> RunResult<Value> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b.is_zero() {
                return Err(zero_division("division by zero"));
            }
            let (x, y) = (big_to_f64(&a)?, big_to_f64(&b)?);
            return Ok(Value::Float(x / y));
        }
        BinaryOp::FloorDiv => {
            if b.is_zero() {
                return Err(zero_division("integer division or modulo by zero"));
            }
            a.div_floor(&b)
        }
        BinaryOp::Mod => {
            if b.is_zero() {
                return Err(zero_division("integer modulo by zero"));
            }
            a.mod_floor(&b)
        }
        BinaryOp::Pow => {
            if b.is_negative() {
                return float_pow(big_to_f64(&a)?, big_to_f64(&b)?);
            }
            let exp = b.to_u32().ok_or_else(|| {
                RunError::new(ExcType::OverflowError, "exponent too large")
            })?;
            num_traits::pow(a, exp as usize)
        }
        BinaryOp::LShift | BinaryOp::RShift => {
            if b.is_negative() {
                return Err(RunError::value_error("negative shift count"));
            }
            let shift = b.to_usize().ok_or_else(|| {
                RunError::new(ExcType::OverflowError, "shift count too large")
            })?;
            if op == BinaryOp::LShift { a << shift } else { a >> shift }
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
    };
    Ok(Value::from_bigint(result))
}

fn big_to_f64(n: &BigInt) -> RunResult<f64> {
    n.to_f64().filter(|f| f.is_finite()).ok_or_else(|| {
        RunError::new(ExcType::OverflowError, "int too large to convert to float")
    })
}

fn float(op: BinaryOp, a: f64, b: f64) -> Option<RunResult<Value>> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b == 0.0 {
                return Some(Err(zero_division("float division by zero")));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Some(Err(zero_division("float floor division by zero")));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Some(Err(zero_division("float modulo")));
            }
            let rem = a % b;
            if rem != 0.0 && (rem < 0.0) != (b < 0.0) { rem + b } else { rem }
        }
        BinaryOp::Pow => return Some(float_pow(a, b)),
        BinaryOp::LShift
        | BinaryOp::RShift
        | BinaryOp::And
        | BinaryOp::Or
        | BinaryOp::Xor => return None,
    };
    Some(Ok(Value::Float(result)))
}

fn float_pow(a: f64, b: f64) -> RunResult<Value> {
    if a == 0.0 && b < 0.0 {
        return Err(zero_division("0.0 cannot be raised to a negative power"));
    }
    if a < 0.0 && b.fract() != 0.0 {
        return Err(RunError::value_error(
            "negative number cannot be raised to a fractional power",
        ));
    }
    Ok(Value::Float(a.powf(b)))
}

pub fn negate(value: &Value) -> Option<Value> {
    Some(match value {
        Value::Int(i) => i
            .checked_neg()
            .map_or_else(|| Value::from_bigint(-BigInt::from(*i)), Value::Int),
        Value::Bool(b) => Value::Int(-i64::from(*b)),
        Value::BigInt(b) => Value::from_bigint(-(**b).clone()),
        Value::Float(f) => Value::Float(-f),
        _ => return None,
    })
}

pub fn positive(value: &Value) -> Option<Value> {
    Some(match value {
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Int(_) | Value::BigInt(_) | Value::Float(_) => value.clone(),
        _ => return None,
    })
}

pub fn invert(value: &Value) -> Option<Value> {
    Some(match value {
        Value::Int(i) => Value::Int(!i),
        Value::Bool(b) => Value::Int(!i64::from(*b)),
        Value::BigInt(b) => Value::from_bigint(!(**b).clone()),
        _ => return None,
    })
}

/// Orders two numbers. The outer `None` means "not both numbers", the
/// inner one an unordered comparison involving NaN.
pub fn compare(a: &Value, b: &Value) -> Option<Option<Ordering>> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Some(Some(x.cmp(&y)));
    }
    if a.is_int() && b.is_int() {
        return Some(Some(a.to_bigint()?.cmp(&b.to_bigint()?)));
    }
    if a.is_number() && b.is_number() {
        return Some(a.to_f64()?.partial_cmp(&b.to_f64()?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(op: BinaryOp, a: impl Into<Value>, b: impl Into<Value>) -> Value {
        binary(op, &a.into(), &b.into()).unwrap().unwrap()
    }

    #[test]
    fn overflow_promotes_to_big_ints() {
        let sum = eval(BinaryOp::Add, i64::MAX, 1);
        assert!(matches!(sum, Value::BigInt(_)));
        assert_eq!(sum.to_bigint().unwrap(), BigInt::from(i64::MAX) + 1);

        let back = binary(BinaryOp::Sub, &sum, &Value::Int(1)).unwrap().unwrap();
        assert_eq!(back, Value::Int(i64::MAX));

        let pow = eval(BinaryOp::Pow, 2, 100);
        assert_eq!(pow.to_bigint().unwrap(), BigInt::from(1) << 100usize);
    }

    #[test]
    fn floor_division_and_modulo_round_down() {
        assert_eq!(eval(BinaryOp::FloorDiv, -7, 2), Value::Int(-4));
        assert_eq!(eval(BinaryOp::Mod, -7, 2), Value::Int(1));
        assert_eq!(eval(BinaryOp::Mod, 7, -2), Value::Int(-1));
        assert_eq!(eval(BinaryOp::Mod, -7.5, 2.0), Value::Float(0.5));
        let min = eval(BinaryOp::FloorDiv, i64::MIN, -1);
        assert!(matches!(min, Value::BigInt(_)));
    }

    #[test]
    fn division_by_zero() {
        for op in [BinaryOp::TrueDiv, BinaryOp::FloorDiv, BinaryOp::Mod] {
            let err = binary(op, &Value::Int(1), &Value::Int(0))
                .unwrap()
                .unwrap_err();
            assert!(err.is_instance(ExcType::ZeroDivisionError));
        }
    }

    #[test]
    fn mixed_arithmetic_promotes_to_float() {
        assert_eq!(eval(BinaryOp::Add, 1, 0.5), Value::Float(1.5));
        assert_eq!(eval(BinaryOp::TrueDiv, 1, 2), Value::Float(0.5));
        assert_eq!(eval(BinaryOp::Pow, 2, -1), Value::Float(0.5));
        assert_eq!(eval(BinaryOp::Add, true, 1), Value::Int(2));
    }

    #[test]
    fn shifts() {
        assert_eq!(eval(BinaryOp::RShift, -5, 1), Value::Int(-3));
        let shifted = eval(BinaryOp::LShift, 1, 70);
        assert!(matches!(shifted, Value::BigInt(_)));
        let err = binary(BinaryOp::LShift, &Value::Int(1), &Value::Int(-1))
            .unwrap()
            .unwrap_err();
        assert!(err.is_instance(ExcType::ValueError));
    }

    #[test]
    fn non_numbers_are_left_to_the_caller() {
        assert!(binary(BinaryOp::Add, &Value::str("a"), &Value::Int(1)).is_none());
        assert!(binary(BinaryOp::LShift, &Value::Float(1.0), &Value::Int(1)).is_none());
    }

    #[test]
    fn comparisons_across_types() {
        let big = Value::from_bigint(BigInt::from(i64::MAX) * 2);
        assert_eq!(compare(&Value::Int(1), &big), Some(Some(Ordering::Less)));
        assert_eq!(compare(&Value::Int(1), &Value::Float(1.0)), Some(Some(Ordering::Equal)));
        assert_eq!(compare(&Value::Float(f64::NAN), &Value::Int(1)), Some(None));
        assert_eq!(compare(&Value::str("a"), &Value::Int(1)), None);
    }
}
