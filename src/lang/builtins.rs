//! Built-in functions reachable through granted capabilities.

use crate::capability::Capability;
use crate::lang::ast::BinOp;
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use crate::lang::format::{format_with_spec, repr, to_str};
use crate::lang::interp::Interpreter;
use crate::lang::ops::{self, floor_div, floor_mod};
use crate::lang::value::{compare_values, Dict, RangeValue, Set, Value};
use std::cmp::Ordering;

type Kwargs = Vec<(String, Value)>;

pub fn call(
    interp: &mut Interpreter,
    capability: Capability,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    let name = capability.name();
    match capability {
        Capability::Print => print(interp, args, kwargs),
        Capability::Len => {
            no_kwargs(name, &kwargs)?;
            let [value] = exact::<1>(name, args)?;
            len(&value).map(|n| Value::Int(n as i64))
        }
        Capability::Range => {
            no_kwargs(name, &kwargs)?;
            range(args)
        }
        Capability::Enumerate => {
            let start = take_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let iterable = args.next().unwrap_or(Value::None);
            let start = match args.next().or(start) {
                Some(v) => expect_int(&v)?,
                None => 0,
            };
            let items = interp.collect(&iterable)?;
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let index = start.checked_add(i as i64).ok_or_else(overflow)?;
                out.push(Value::tuple(vec![Value::Int(index), item]));
            }
            Ok(Value::list(out))
        }
        Capability::Sum => {
            let start = take_kwarg(&mut kwargs, "start");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let iterable = args.next().unwrap_or(Value::None);
            let mut total = args.next().or(start).unwrap_or(Value::Int(0));
            if let Value::Str(_) = total {
                return Err(ScriptError::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                ));
            }
            interp.for_each(&iterable, &mut |interp, item| {
                total = ops::binary(BinOp::Add, &total, &item, &interp.meter)?;
                Ok(true)
            })?;
            Ok(total)
        }
        Capability::Min => extreme(interp, name, args, kwargs, Ordering::Less),
        Capability::Max => extreme(interp, name, args, kwargs, Ordering::Greater),
        Capability::Abs => {
            no_kwargs(name, &kwargs)?;
            let [value] = exact::<1>(name, args)?;
            match value {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                v => match v.as_int() {
                    Some(i) => i.checked_abs().map(Value::Int).ok_or_else(overflow),
                    None => Err(ScriptError::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        v.type_name()
                    ))),
                },
            }
        }
        Capability::Int => {
            let base = take_kwarg(&mut kwargs, "base");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 2)?;
            let mut args = args.into_iter();
            let value = args.next();
            let base = args.next().or(base);
            to_int(value, base)
        }
        Capability::Float => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.into_iter().next() {
                None => Ok(Value::Float(0.0)),
                Some(v) => to_float(&v).map(Value::Float),
            }
        }
        Capability::Str => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::str(args.first().map(to_str).unwrap_or_default()))
        }
        Capability::Bool => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
        }
        Capability::List => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::list(Vec::new())),
                Some(v) => Ok(Value::list(interp.collect(v)?)),
            }
        }
        Capability::Tuple => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::tuple(Vec::new())),
                Some(Value::Tuple(items)) => Ok(Value::Tuple(items.clone())),
                Some(v) => Ok(Value::tuple(interp.collect(v)?)),
            }
        }
        Capability::Set => {
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::set(Set::new())),
                Some(v) => Ok(Value::set(Set::from_values(interp.collect(v)?)?)),
            }
        }
        Capability::Dict => {
            arity(name, &args, 0, 1)?;
            let mut dict = match args.first() {
                None => Dict::new(),
                Some(source) => dict_from(interp, source)?,
            };
            for (key, value) in kwargs {
                dict.insert(Value::str(key), value)?;
            }
            Ok(Value::dict(dict))
        }
        Capability::Sorted => {
            let key = take_kwarg(&mut kwargs, "key");
            let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
            no_kwargs(name, &kwargs)?;
            let [iterable] = exact::<1>(name, args)?;
            let items = interp.collect(&iterable)?;
            Ok(Value::list(interp.sort_values(items, key.as_ref(), reverse)?))
        }
        Capability::Reversed => {
            no_kwargs(name, &kwargs)?;
            let [sequence] = exact::<1>(name, args)?;
            if matches!(sequence, Value::Set(_)) {
                return Err(ScriptError::type_error("'set' object is not reversible"));
            }
            let mut items = interp.collect(&sequence)?;
            items.reverse();
            Ok(Value::list(items))
        }
        Capability::Zip => {
            no_kwargs(name, &kwargs)?;
            let mut columns = Vec::with_capacity(args.len());
            for arg in &args {
                columns.push(interp.collect(arg)?);
            }
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let out = (0..rows)
                .map(|row| Value::tuple(columns.iter().map(|c| c[row].clone()).collect()))
                .collect();
            Ok(Value::list(out))
        }
        Capability::Round => {
            let ndigits = take_kwarg(&mut kwargs, "ndigits");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let number = args.next().unwrap_or(Value::None);
            match args.next().or(ndigits) {
                None | Some(Value::None) => round_to_int(&number),
                Some(digits) => round_digits(&number, expect_int(&digits)?),
            }
        }
        Capability::Any | Capability::All => {
            no_kwargs(name, &kwargs)?;
            let [iterable] = exact::<1>(name, args)?;
            let want = capability == Capability::Any;
            let mut decided = false;
            interp.for_each(&iterable, &mut |_, item| {
                decided = item.truthy() == want;
                Ok(!decided)
            })?;
            Ok(Value::Bool(decided == want))
        }
        Capability::Map => {
            no_kwargs(name, &kwargs)?;
            if args.len() < 2 {
                return Err(ScriptError::type_error("map() must have at least two arguments."));
            }
            let mut args = args.into_iter();
            let function = args.next().unwrap_or(Value::None);
            let mut columns = Vec::new();
            for arg in args {
                columns.push(interp.collect(&arg)?);
            }
            let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(rows);
            for row in 0..rows {
                let call_args = columns.iter().map(|c| c[row].clone()).collect();
                out.push(interp.call_value(&function, call_args, Vec::new())?);
            }
            Ok(Value::list(out))
        }
        Capability::Filter => {
            no_kwargs(name, &kwargs)?;
            let [predicate, iterable] = exact::<2>(name, args)?;
            let mut out = Vec::new();
            for item in interp.collect(&iterable)? {
                let keep = match &predicate {
                    Value::None => item.truthy(),
                    f => interp.call_value(f, vec![item.clone()], Vec::new())?.truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
            Ok(Value::list(out))
        }
        Capability::Repr => {
            no_kwargs(name, &kwargs)?;
            let [value] = exact::<1>(name, args)?;
            Ok(Value::str(repr(&value)))
        }
        Capability::Divmod => {
            no_kwargs(name, &kwargs)?;
            let [a, b] = exact::<2>(name, args)?;
            if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
                return Ok(Value::tuple(vec![
                    Value::Int(floor_div(x, y)?),
                    Value::Int(floor_mod(x, y)?),
                ]));
            }
            let q = ops::binary(BinOp::FloorDiv, &a, &b, &interp.meter)?;
            let r = ops::binary(BinOp::Mod, &a, &b, &interp.meter)?;
            Ok(Value::tuple(vec![q, r]))
        }
        Capability::Pow => {
            let modulus = take_kwarg(&mut kwargs, "mod");
            no_kwargs(name, &kwargs)?;
            arity(name, &args, 2, 3)?;
            let mut args = args.into_iter();
            let base = args.next().unwrap_or(Value::None);
            let exp = args.next().unwrap_or(Value::None);
            match args.next().or(modulus) {
                None | Some(Value::None) => ops::binary(BinOp::Pow, &base, &exp, &interp.meter),
                Some(m) => mod_pow(&base, &exp, &m),
            }
        }
        Capability::Chr => {
            no_kwargs(name, &kwargs)?;
            let [code] = exact::<1>(name, args)?;
            let code = expect_int(&code)?;
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .map(|c| Value::str(c.to_string()))
                .ok_or_else(|| ScriptError::value_error("chr() arg not in range(0x110000)"))
        }
        Capability::Ord => {
            no_kwargs(name, &kwargs)?;
            let [text] = exact::<1>(name, args)?;
            let text = text.expect_str("ord() argument")?;
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                _ => Err(ScriptError::type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    text.chars().count()
                ))),
            }
        }
        Capability::Isinstance => {
            no_kwargs(name, &kwargs)?;
            let [value, class] = exact::<2>(name, args)?;
            is_instance(&value, &class).map(Value::Bool)
        }
    }
}

fn overflow() -> ScriptError {
    ScriptError::new(ErrorKind::Overflow, "integer result too large for the sandbox")
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ScriptResult<()> {
    let given = args.len();
    if given < min {
        return Err(ScriptError::type_error(format!(
            "{name}() expected at least {min} argument{}, got {given}",
            if min == 1 { "" } else { "s" }
        )));
    }
    if given > max {
        return Err(ScriptError::type_error(format!(
            "{name}() expected at most {max} argument{}, got {given}",
            if max == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> ScriptResult<[Value; N]> {
    let given = args.len();
    args.try_into().map_err(|_| {
        ScriptError::type_error(format!(
            "{name}() takes exactly {N} argument{} ({given} given)",
            if N == 1 { "" } else { "s" }
        ))
    })
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> ScriptResult<()> {
    match kwargs.first() {
        None => Ok(()),
        Some((key, _)) => Err(ScriptError::type_error(format!(
            "{name}() got an unexpected keyword argument '{key}'"
        ))),
    }
}

pub(crate) fn take_kwarg(kwargs: &mut Kwargs, key: &str) -> Option<Value> {
    let pos = kwargs.iter().position(|(k, _)| k == key)?;
    Some(kwargs.remove(pos).1)
}

pub(crate) fn expect_int(value: &Value) -> ScriptResult<i64> {
    value.as_int().ok_or_else(|| {
        ScriptError::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

fn print(interp: &mut Interpreter, args: Vec<Value>, mut kwargs: Kwargs) -> ScriptResult<Value> {
    let separator = |value: Option<Value>, default: &str, what: &str| match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(ScriptError::type_error(format!(
            "{what} must be None or a string, not {}",
            other.type_name()
        ))),
    };
    let sep = separator(take_kwarg(&mut kwargs, "sep"), " ", "sep")?;
    let end = separator(take_kwarg(&mut kwargs, "end"), "\n", "end")?;
    no_kwargs("print", &kwargs)?;
    let mut line = args.iter().map(to_str).collect::<Vec<_>>().join(&sep);
    line.push_str(&end);
    interp.write_output(&line)?;
    Ok(Value::None)
}

pub(crate) fn len(value: &Value) -> ScriptResult<usize> {
    Ok(match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(d) => d.borrow().len(),
        Value::Set(s) => s.borrow().len(),
        Value::Range(r) => r.len()?,
        other => {
            return Err(ScriptError::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    })
}

fn range(args: Vec<Value>) -> ScriptResult<Value> {
    arity("range", &args, 1, 3)?;
    let bounds = args.iter().map(expect_int).collect::<ScriptResult<Vec<_>>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => (0, 0, 1),
    };
    if step == 0 {
        return Err(ScriptError::value_error("range() arg 3 must not be zero"));
    }
    Ok(Value::Range(RangeValue { start, stop, step }))
}

fn extreme(
    interp: &mut Interpreter,
    name: &str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
    want: Ordering,
) -> ScriptResult<Value> {
    let key = take_kwarg(&mut kwargs, "key").filter(|k| !matches!(k, Value::None));
    let default = take_kwarg(&mut kwargs, "default");
    no_kwargs(name, &kwargs)?;
    let mut best: Option<(Value, Value)> = None;
    let mut consider = |interp: &mut Interpreter, item: Value| -> ScriptResult<bool> {
        let rank = match &key {
            Some(f) => interp.call_value(f, vec![item.clone()], Vec::new())?,
            None => item.clone(),
        };
        let better = match &best {
            None => true,
            Some((_, best_rank)) => compare_values(&rank, best_rank)? == want,
        };
        if better {
            best = Some((item, rank));
        }
        Ok(true)
    };
    match args.len() {
        0 => {
            return Err(ScriptError::type_error(format!(
                "{name} expected at least 1 argument, got 0"
            )))
        }
        1 => interp.for_each(&args[0], &mut consider)?,
        _ => {
            for item in args {
                consider(interp, item)?;
            }
        }
    }
    match (best, default) {
        (Some((item, _)), _) => Ok(item),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(ScriptError::value_error(format!(
            "{name}() arg is an empty sequence"
        ))),
    }
}

fn to_int(value: Option<Value>, base: Option<Value>) -> ScriptResult<Value> {
    let Some(value) = value else {
        return Ok(Value::Int(0));
    };
    if let Some(base) = base {
        let base = expect_int(&base)?;
        let text = value.expect_str("int() can't convert non-string with explicit base; argument")?;
        return parse_int(&text, base).map(Value::Int);
    }
    match &value {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => float_to_int(f.trunc()).map(Value::Int),
        Value::Str(s) => parse_int(s, 10).map(Value::Int),
        other => Err(ScriptError::type_error(format!(
            "int() argument must be a string, a bytes-like object or a real number, not '{}'",
            other.type_name()
        ))),
    }
}

fn float_to_int(f: f64) -> ScriptResult<i64> {
    if f.is_nan() {
        return Err(ScriptError::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(ScriptError::new(
            ErrorKind::Overflow,
            "cannot convert float infinity to integer",
        ));
    }
    if f < -9.223_372_036_854_776e18 || f >= 9.223_372_036_854_776e18 {
        return Err(overflow());
    }
    Ok(f as i64)
}

fn parse_int(text: &str, base: i64) -> ScriptResult<i64> {
    let invalid = || {
        ScriptError::value_error(format!(
            "invalid literal for int() with base {base}: {}",
            repr(&Value::str(text))
        ))
    };
    if base != 0 && !(2..=36).contains(&base) {
        return Err(ScriptError::value_error("int() base must be >= 2 and <= 36, or 0"));
    }
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = digits.to_ascii_lowercase();
    let prefixed = |prefix: &str, radix: u32| lower.strip_prefix(prefix).map(|rest| (rest, radix));
    let (body, radix) = match base {
        0 => prefixed("0x", 16)
            .or_else(|| prefixed("0o", 8))
            .or_else(|| prefixed("0b", 2))
            .unwrap_or((lower.as_str(), 10)),
        16 => prefixed("0x", 16).unwrap_or((lower.as_str(), 16)),
        8 => prefixed("0o", 8).unwrap_or((lower.as_str(), 8)),
        2 => prefixed("0b", 2).unwrap_or((lower.as_str(), 2)),
        b => (lower.as_str(), b as u32),
    };
    if body.is_empty() || body.starts_with('_') || body.ends_with('_') || body.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = body.chars().filter(|c| *c != '_').collect();
    if !cleaned.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid());
    }
    let magnitude = u64::from_str_radix(&cleaned, radix).map_err(|_| overflow())?;
    if negative {
        0i64.checked_sub_unsigned(magnitude).ok_or_else(overflow)
    } else {
        i64::try_from(magnitude).map_err(|_| overflow())
    }
}

pub(crate) fn to_float(value: &Value) -> ScriptResult<f64> {
    match value {
        Value::Str(s) => {
            let trimmed = s.trim();
            let lowered = trimmed.to_ascii_lowercase();
            let unsigned = lowered.trim_start_matches(['+', '-']);
            if matches!(unsigned, "inf" | "infinity" | "nan") {
                let magnitude = if unsigned == "nan" { f64::NAN } else { f64::INFINITY };
                return Ok(if lowered.starts_with('-') { -magnitude } else { magnitude });
            }
            let cleaned: String = trimmed.chars().filter(|c| *c != '_').collect();
            let looks_numeric = !cleaned.is_empty()
                && cleaned
                    .chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|_| looks_numeric)
                .ok_or_else(|| {
                    ScriptError::value_error(format!(
                        "could not convert string to float: {}",
                        repr(value)
                    ))
                })
        }
        other => other.as_float().ok_or_else(|| {
            ScriptError::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

/// Round half to even.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        rounded
    }
}

fn round_to_int(number: &Value) -> ScriptResult<Value> {
    match number {
        Value::Float(f) => float_to_int(round_half_even(*f)).map(Value::Int),
        v => match v.as_int() {
            Some(i) => Ok(Value::Int(i)),
            None => Err(ScriptError::type_error(format!(
                "type {} doesn't define __round__ method",
                v.type_name()
            ))),
        },
    }
}

fn round_digits(number: &Value, digits: i64) -> ScriptResult<Value> {
    match number {
        Value::Float(f) => {
            if !f.is_finite() {
                return Ok(Value::Float(*f));
            }
            if digits >= 0 {
                let digits = digits.min(300) as usize;
                let text = format_with_spec(&Value::Float(*f), &format!(".{digits}f"))?;
                return Ok(Value::Float(text.parse().unwrap_or(*f)));
            }
            let factor = 10f64.powi(digits.unsigned_abs().min(308) as i32);
            Ok(Value::Float(round_half_even(f / factor) * factor))
        }
        v => {
            let Some(i) = v.as_int() else {
                return Err(ScriptError::type_error(format!(
                    "type {} doesn't define __round__ method",
                    v.type_name()
                )));
            };
            if digits >= 0 {
                return Ok(Value::Int(i));
            }
            let Some(power) = u32::try_from(digits.unsigned_abs())
                .ok()
                .and_then(|p| 10i64.checked_pow(p))
            else {
                return Ok(Value::Int(0));
            };
            let quotient = floor_div(i, power)?;
            let remainder = i - quotient * power;
            let up = remainder * 2 > power || (remainder * 2 == power && quotient % 2 != 0);
            let quotient = if up { quotient + 1 } else { quotient };
            quotient.checked_mul(power).map(Value::Int).ok_or_else(overflow)
        }
    }
}

fn mod_pow(base: &Value, exp: &Value, modulus: &Value) -> ScriptResult<Value> {
    let (Some(base), Some(exp), Some(m)) = (base.as_int(), exp.as_int(), modulus.as_int()) else {
        return Err(ScriptError::type_error(
            "pow() 3rd argument not allowed unless all arguments are integers",
        ));
    };
    if m == 0 {
        return Err(ScriptError::value_error("pow() 3rd argument cannot be 0"));
    }
    if exp < 0 {
        return Err(ScriptError::value_error(
            "pow() negative exponent with a modulus is not supported in the sandbox",
        ));
    }
    let modulus = i128::from(m);
    let mut result: i128 = 1;
    let mut factor = i128::from(base).rem_euclid(modulus.abs());
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = (result * factor).rem_euclid(modulus.abs());
        }
        factor = (factor * factor).rem_euclid(modulus.abs());
        e >>= 1;
    }
    let mut result = result.rem_euclid(modulus.abs());
    if m < 0 && result != 0 {
        result += modulus;
    }
    Ok(Value::Int(result as i64))
}

fn dict_from(interp: &mut Interpreter, source: &Value) -> ScriptResult<Dict> {
    if let Value::Dict(d) = source {
        return Ok(d.borrow().clone());
    }
    let mut dict = Dict::new();
    for (n, pair) in interp.collect(source)?.into_iter().enumerate() {
        let items = interp.collect(&pair).map_err(|_| {
            ScriptError::type_error(format!(
                "cannot convert dictionary update sequence element #{n} to a sequence"
            ))
        })?;
        let [key, value]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
            ScriptError::value_error(format!(
                "dictionary update sequence element #{n} has length {}; 2 is required",
                items.len()
            ))
        })?;
        dict.insert(key, value)?;
    }
    Ok(dict)
}

fn is_instance(value: &Value, class: &Value) -> ScriptResult<bool> {
    match class {
        Value::Builtin(capability) if capability.is_type() => Ok(match capability {
            Capability::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
            Capability::Float => matches!(value, Value::Float(_)),
            Capability::Str => matches!(value, Value::Str(_)),
            Capability::Bool => matches!(value, Value::Bool(_)),
            Capability::List => matches!(value, Value::List(_)),
            Capability::Tuple => matches!(value, Value::Tuple(_)),
            Capability::Dict => matches!(value, Value::Dict(_)),
            Capability::Set => matches!(value, Value::Set(_)),
            _ => matches!(value, Value::Range(_)),
        }),
        Value::ExceptionType(kind) => Ok(match value {
            Value::Exception(err) => kind.handles(err.kind),
            _ => false,
        }),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ScriptError::type_error(
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_parsing_handles_bases_and_signs() {
        assert_eq!(parse_int(" -42 ", 10).unwrap(), -42);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("0b101", 0).unwrap(), 5);
        assert_eq!(parse_int("1_000", 10).unwrap(), 1000);
        let err = parse_int("abc", 10).unwrap_err();
        assert_eq!(err.message, "invalid literal for int() with base 10: 'abc'");
        assert_eq!(parse_int("-9223372036854775808", 10).unwrap(), i64::MIN);
        assert_eq!(
            parse_int("9223372036854775808", 10).unwrap_err().kind,
            ErrorKind::Overflow
        );
    }

    #[test]
    fn float_parsing() {
        assert_eq!(to_float(&Value::str(" 2.5 ")).unwrap(), 2.5);
        assert!(to_float(&Value::str("-inf")).unwrap().is_infinite());
        assert!(to_float(&Value::str("nan")).unwrap().is_nan());
        assert!(to_float(&Value::str("abc")).is_err());
        assert!(to_float(&Value::str("infinite")).is_err());
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert!(matches!(round_to_int(&Value::Float(2.5)).unwrap(), Value::Int(2)));
        assert!(matches!(round_to_int(&Value::Float(3.5)).unwrap(), Value::Int(4)));
        assert!(matches!(round_to_int(&Value::Float(-2.5)).unwrap(), Value::Int(-2)));
        assert!(matches!(round_digits(&Value::Int(1250), -2).unwrap(), Value::Int(1200)));
        assert!(matches!(round_digits(&Value::Int(1350), -2).unwrap(), Value::Int(1400)));
        match round_digits(&Value::Float(3.14159), 2).unwrap() {
            Value::Float(f) => assert_eq!(f, 3.14),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn modular_power() {
        let v = mod_pow(&Value::Int(3), &Value::Int(200), &Value::Int(13)).unwrap();
        assert!(matches!(v, Value::Int(9)));
        let v = mod_pow(&Value::Int(-2), &Value::Int(3), &Value::Int(5)).unwrap();
        assert!(matches!(v, Value::Int(2)));
    }

    #[test]
    fn isinstance_treats_bool_as_int() {
        let int = Value::Builtin(Capability::Int);
        assert!(is_instance(&Value::Bool(true), &int).unwrap());
        assert!(!is_instance(&Value::Float(1.0), &int).unwrap());
        let pair = Value::tuple(vec![Value::Builtin(Capability::Str), int]);
        assert!(is_instance(&Value::str("x"), &pair).unwrap());
    }

    #[test]
    fn range_rejects_zero_step() {
        let err = range(vec![Value::Int(0), Value::Int(5), Value::Int(0)]).unwrap_err();
        assert_eq!(err.message, "range() arg 3 must not be zero");
    }
}
