//! Operator semantics: arithmetic with Python's int/float rules, sequence
//! concatenation and repetition, comparisons, membership and slicing.

use crate::lang::ast::{BinOp, CmpOp, UnaryOp};
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use crate::lang::format::percent_format;
use crate::lang::meter::Meter;
use crate::lang::value::{compare_values, values_equal, Set, Value};
use std::cmp::Ordering;

fn overflow() -> ScriptError {
    ScriptError::new(ErrorKind::Overflow, "integer result too large for the sandbox")
}

fn unsupported(op: &str, a: &Value, b: &Value) -> ScriptError {
    ScriptError::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        a.type_name(),
        b.type_name()
    ))
}

pub fn floor_div(a: i64, b: i64) -> ScriptResult<i64> {
    if b == 0 {
        return Err(ScriptError::new(
            ErrorKind::ZeroDivision,
            "integer division or modulo by zero",
        ));
    }
    let q = a.checked_div(b).ok_or_else(overflow)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

pub fn floor_mod(a: i64, b: i64) -> ScriptResult<i64> {
    if b == 0 {
        return Err(ScriptError::new(
            ErrorKind::ZeroDivision,
            "integer division or modulo by zero",
        ));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn float_floor_div(a: f64, b: f64) -> ScriptResult<f64> {
    if b == 0.0 {
        return Err(ScriptError::new(
            ErrorKind::ZeroDivision,
            "float floor division by zero",
        ));
    }
    Ok((a / b).floor())
}

fn float_mod(a: f64, b: f64) -> ScriptResult<f64> {
    if b == 0.0 {
        return Err(ScriptError::new(ErrorKind::ZeroDivision, "float modulo"));
    }
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

pub fn int_pow(base: i64, exp: i64) -> ScriptResult<Value> {
    if exp < 0 {
        return float_pow(base as f64, exp as f64);
    }
    let exp = u32::try_from(exp).map_err(|_| overflow())?;
    base.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
}

fn float_pow(a: f64, b: f64) -> ScriptResult<Value> {
    if a == 0.0 && b < 0.0 {
        return Err(ScriptError::new(
            ErrorKind::ZeroDivision,
            "0.0 cannot be raised to a negative power",
        ));
    }
    if a < 0.0 && b.fract() != 0.0 {
        return Err(ScriptError::value_error(
            "negative number cannot be raised to a fractional power in the sandbox",
        ));
    }
    let result = a.powf(b);
    if result.is_infinite() && a.is_finite() && b.is_finite() {
        return Err(ScriptError::new(ErrorKind::Overflow, "(34, 'Numerical result out of range')"));
    }
    Ok(Value::Float(result))
}

fn repeat_count(n: i64) -> usize {
    usize::try_from(n.max(0)).unwrap_or(usize::MAX)
}

fn repeat_seq(items: &[Value], n: i64, meter: &Meter) -> ScriptResult<Vec<Value>> {
    let n = repeat_count(n);
    let total = items.len().saturating_mul(n);
    meter.guard_slots(total)?;
    let mut out = Vec::with_capacity(total);
    for _ in 0..n {
        out.extend(items.iter().cloned());
    }
    Ok(out)
}

fn repeat_str(text: &str, n: i64, meter: &Meter) -> ScriptResult<Value> {
    let n = repeat_count(n);
    meter.guard_bytes((text.len() as u64).saturating_mul(n as u64))?;
    Ok(Value::str(text.repeat(n)))
}

pub fn binary(op: BinOp, a: &Value, b: &Value, meter: &Meter) -> ScriptResult<Value> {
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if !(matches!(a, Value::Bool(_)) && matches!(b, Value::Bool(_)) && is_bitwise(op)) {
            return int_binary(op, x, y);
        }
        let r = match op {
            BinOp::BitAnd => x & y,
            BinOp::BitOr => x | y,
            _ => x ^ y,
        };
        return Ok(Value::Bool(r != 0));
    }
    if a.is_number() && b.is_number() {
        let (x, y) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
        return float_binary(op, x, y, a, b);
    }
    match (op, a, b) {
        (BinOp::Add, Value::Str(x), Value::Str(y)) => {
            meter.guard_bytes((x.len() + y.len()) as u64)?;
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Ok(Value::str(s))
        }
        (BinOp::Add, Value::List(x), Value::List(y)) => {
            let mut items = x.borrow().clone();
            items.extend(y.borrow().iter().cloned());
            meter.guard_slots(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(x), Value::Tuple(y)) => {
            let mut items = x.as_ref().clone();
            items.extend(y.iter().cloned());
            Ok(Value::tuple(items))
        }
        (BinOp::Add, Value::Str(_), other) => Err(ScriptError::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            other.type_name()
        ))),
        (BinOp::Add, Value::List(_), other) => Err(ScriptError::type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            other.type_name()
        ))),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_int().is_some() => {
            repeat_str(s, n.as_int().unwrap_or(0), meter)
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_int().is_some() =>
        {
            let snapshot = items.borrow().clone();
            Ok(Value::list(repeat_seq(&snapshot, n.as_int().unwrap_or(0), meter)?))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
            if n.as_int().is_some() =>
        {
            Ok(Value::tuple(repeat_seq(items, n.as_int().unwrap_or(0), meter)?))
        }
        (BinOp::Mod, Value::Str(template), args) => {
            let text = percent_format(template, args)?;
            meter.guard_bytes(text.len() as u64)?;
            Ok(Value::str(text))
        }
        (BinOp::BitOr | BinOp::BitAnd | BinOp::BitXor | BinOp::Sub, Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            Ok(Value::set(set_op(op, &x, &y)?))
        }
        (BinOp::BitOr, Value::Dict(x), Value::Dict(y)) => {
            let mut merged = x.borrow().clone();
            for (k, v) in y.borrow().items() {
                merged.insert(k, v)?;
            }
            Ok(Value::dict(merged))
        }
        _ => Err(unsupported(op.symbol(), a, b)),
    }
}

fn is_bitwise(op: BinOp) -> bool {
    matches!(op, BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor)
}

fn int_binary(op: BinOp, x: i64, y: i64) -> ScriptResult<Value> {
    let checked = |r: Option<i64>| r.map(Value::Int).ok_or_else(overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(ScriptError::new(ErrorKind::ZeroDivision, "division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => floor_div(x, y).map(Value::Int),
        BinOp::Mod => floor_mod(x, y).map(Value::Int),
        BinOp::Pow => int_pow(x, y),
        BinOp::BitAnd => Ok(Value::Int(x & y)),
        BinOp::BitOr => Ok(Value::Int(x | y)),
        BinOp::BitXor => Ok(Value::Int(x ^ y)),
        BinOp::LShift => {
            if y < 0 {
                return Err(ScriptError::value_error("negative shift count"));
            }
            if x == 0 {
                return Ok(Value::Int(0));
            }
            let shift = u32::try_from(y).map_err(|_| overflow())?;
            let shifted = x.checked_shl(shift).ok_or_else(overflow)?;
            if shifted >> shift != x {
                return Err(overflow());
            }
            Ok(Value::Int(shifted))
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(ScriptError::value_error("negative shift count"));
            }
            Ok(Value::Int(x >> y.min(63)))
        }
    }
}

fn float_binary(op: BinOp, x: f64, y: f64, a: &Value, b: &Value) -> ScriptResult<Value> {
    Ok(Value::Float(match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(ScriptError::new(
                    ErrorKind::ZeroDivision,
                    "float division by zero",
                ));
            }
            x / y
        }
        BinOp::FloorDiv => float_floor_div(x, y)?,
        BinOp::Mod => float_mod(x, y)?,
        BinOp::Pow => return float_pow(x, y),
        _ => return Err(unsupported(op.symbol(), a, b)),
    }))
}

fn set_op(op: BinOp, x: &Set, y: &Set) -> ScriptResult<Set> {
    let mut out = Set::new();
    match op {
        BinOp::BitOr => {
            for v in x.values().into_iter().chain(y.values()) {
                out.insert(v)?;
            }
        }
        BinOp::BitAnd => {
            for v in x.values() {
                if y.contains(&v)? {
                    out.insert(v)?;
                }
            }
        }
        BinOp::Sub => {
            for v in x.values() {
                if !y.contains(&v)? {
                    out.insert(v)?;
                }
            }
        }
        _ => {
            for v in x.values() {
                if !y.contains(&v)? {
                    out.insert(v)?;
                }
            }
            for v in y.values() {
                if !x.contains(&v)? {
                    out.insert(v)?;
                }
            }
        }
    }
    Ok(out)
}

pub fn unary(op: UnaryOp, v: &Value) -> ScriptResult<Value> {
    match (op, v) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, v) if v.as_int().is_some() => v
            .as_int()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(overflow),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Pos, v) if v.as_int().is_some() => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (UnaryOp::Invert, v) if v.as_int().is_some() => Ok(Value::Int(!v.as_int().unwrap_or(0))),
        (op, v) => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                _ => "~",
            };
            Err(ScriptError::type_error(format!(
                "bad operand type for unary {symbol}: '{}'",
                v.type_name()
            )))
        }
    }
}

/// Membership test for `in`.
pub fn contains(container: &Value, item: &Value) -> ScriptResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_ref())),
            other => Err(ScriptError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => {
            let items = items.borrow().clone();
            any_equal(&items, item)
        }
        Value::Tuple(items) => any_equal(items, item),
        Value::Dict(d) => d.borrow().contains(item),
        Value::Set(s) => s.borrow().contains(item),
        Value::Range(r) => Ok(match item {
            Value::Float(f) if f.fract() == 0.0 => r.contains(*f as i64),
            v => v.as_int().is_some_and(|i| r.contains(i)),
        }),
        other => Err(ScriptError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn any_equal(items: &[Value], item: &Value) -> ScriptResult<bool> {
    for candidate in items {
        if candidate.identical(item) || values_equal(candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn compare(op: CmpOp, a: &Value, b: &Value) -> ScriptResult<bool> {
    match op {
        CmpOp::Eq => values_equal(a, b),
        CmpOp::NotEq => values_equal(a, b).map(|eq| !eq),
        CmpOp::Is => Ok(a.identical(b)),
        CmpOp::IsNot => Ok(!a.identical(b)),
        CmpOp::In => contains(b, a),
        CmpOp::NotIn => contains(b, a).map(|found| !found),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => ordered(op, a, b),
    }
}

fn ordered(op: CmpOp, a: &Value, b: &Value) -> ScriptResult<bool> {
    if let (Value::Set(x), Value::Set(y)) = (a, b) {
        let (x, y) = (x.borrow(), y.borrow());
        let subset = x.keys().all(|k| y.contains_key(k));
        let superset = y.keys().all(|k| x.contains_key(k));
        return Ok(match op {
            CmpOp::Lt => subset && x.len() < y.len(),
            CmpOp::LtE => subset,
            CmpOp::Gt => superset && x.len() > y.len(),
            _ => superset,
        });
    }
    if let (Some(x), Some(y)) = (a.as_float(), b.as_float()) {
        if a.as_int().is_none() || b.as_int().is_none() {
            return Ok(match op {
                CmpOp::Lt => x < y,
                CmpOp::LtE => x <= y,
                CmpOp::Gt => x > y,
                _ => x >= y,
            });
        }
    }
    let ordering = compare_values(a, b).map_err(|err| {
        if err.kind == ErrorKind::Type {
            ScriptError::type_error(format!(
                "'{}' not supported between instances of '{}' and '{}'",
                op.symbol(),
                a.type_name(),
                b.type_name()
            ))
        } else {
            err
        }
    })?;
    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::LtE => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    })
}

/// Resolve a possibly negative index against `len`.
pub fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

/// A resolved slice: `count` positions starting at `start`, `step` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSpan {
    pub start: i128,
    pub step: i128,
    pub count: u64,
}

impl SliceSpan {
    pub fn position(&self, k: u64) -> i128 {
        self.start + k as i128 * self.step
    }
}

/// Resolve `[lower:upper:step]` against a sequence of `len` elements.
/// Computed in i128 so neither huge bounds nor huge steps can wrap.
pub fn slice_span(
    len: u64,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> ScriptResult<SliceSpan> {
    let step = i128::from(step.unwrap_or(1));
    if step == 0 {
        return Err(ScriptError::value_error("slice step cannot be zero"));
    }
    let len = i128::from(len);
    let clamp = |bound: i64, low: i128, high: i128| {
        let b = i128::from(bound);
        let b = if b < 0 { b + len } else { b };
        b.clamp(low, high)
    };
    let (start, count) = if step > 0 {
        let start = lower.map_or(0, |b| clamp(b, 0, len));
        let stop = upper.map_or(len, |b| clamp(b, 0, len));
        let count = if start < stop {
            (stop - start + step - 1) / step
        } else {
            0
        };
        (start, count)
    } else {
        let start = lower.map_or(len - 1, |b| clamp(b, -1, len - 1));
        let stop = upper.map_or(-1, |b| clamp(b, -1, len - 1));
        let count = if start > stop {
            (start - stop - step - 1) / (-step)
        } else {
            0
        };
        (start, count)
    };
    Ok(SliceSpan {
        start,
        step,
        count: count as u64,
    })
}

/// Positions selected by `[lower:upper:step]` on a sequence of `len`.
pub fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> ScriptResult<Vec<usize>> {
    let span = slice_span(len as u64, lower, upper, step)?;
    Ok((0..span.count).map(|k| span.position(k) as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Int(i)
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(7, 2).unwrap(), 3);
        assert_eq!(floor_div(-7, 2).unwrap(), -4);
        assert_eq!(floor_mod(-7, 2).unwrap(), 1);
        assert_eq!(floor_mod(7, -2).unwrap(), -1);
        assert_eq!(floor_div(1, 0).unwrap_err().kind, ErrorKind::ZeroDivision);
    }

    #[test]
    fn true_division_yields_float() {
        let meter = Meter::unlimited();
        let v = binary(BinOp::Div, &int(7), &int(2), &meter).unwrap();
        assert!(matches!(v, Value::Float(f) if f == 3.5));
        let err = binary(BinOp::Div, &int(1), &int(0), &meter).unwrap_err();
        assert_eq!(err.to_string(), "ZeroDivisionError: division by zero");
    }

    #[test]
    fn integer_overflow_is_reported() {
        let meter = Meter::unlimited();
        let err = binary(BinOp::Mul, &int(i64::MAX), &int(2), &meter).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overflow);
        let err = binary(BinOp::Pow, &int(10), &int(100), &meter).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overflow);
    }

    #[test]
    fn str_concat_with_int_is_a_type_error() {
        let meter = Meter::unlimited();
        let err = binary(BinOp::Add, &Value::str("a"), &int(1), &meter).unwrap_err();
        assert_eq!(
            err.message,
            "can only concatenate str (not \"int\") to str"
        );
    }

    #[test]
    fn slices_follow_python_bounds() {
        assert_eq!(slice_indices(5, Some(1), Some(3), None).unwrap(), vec![1, 2]);
        assert_eq!(slice_indices(5, None, None, Some(-1)).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, None).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(3, Some(10), None, None).unwrap(), Vec::<usize>::new());
        assert!(slice_indices(3, None, None, Some(0)).is_err());
    }

    #[test]
    fn huge_slice_steps_stop_instead_of_wrapping() {
        let m = Some(i64::MAX);
        assert_eq!(slice_indices(3, Some(1), m, m).unwrap(), vec![1]);
        assert_eq!(slice_indices(3, Some(i64::MIN), m, m).unwrap(), vec![0]);
        assert_eq!(slice_indices(3, None, None, Some(i64::MIN)).unwrap(), vec![2]);
        let span = slice_span(u64::MAX, None, None, Some(2)).unwrap();
        assert_eq!(span.count, u64::MAX / 2 + 1);
    }

    #[test]
    fn mixed_comparisons() {
        assert!(compare(CmpOp::Lt, &int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOp::In, &int(2), &Value::list(vec![int(1), int(2)])).unwrap());
        let err = compare(CmpOp::Lt, &int(1), &Value::str("x")).unwrap_err();
        assert_eq!(
            err.message,
            "'<' not supported between instances of 'int' and 'str'"
        );
    }

    #[test]
    fn bool_bitwise_stays_bool() {
        let meter = Meter::unlimited();
        let v = binary(BinOp::BitAnd, &Value::Bool(true), &Value::Bool(false), &meter).unwrap();
        assert!(matches!(v, Value::Bool(false)));
        let v = binary(BinOp::Add, &Value::Bool(true), &Value::Bool(true), &meter).unwrap();
        assert!(matches!(v, Value::Int(2)));
    }
}
