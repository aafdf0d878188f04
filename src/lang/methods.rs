//! Methods on built-in value types.
//!
//! The method surface is fixed; it is part of the language rather than a
//! grantable capability. Receivers are never borrowed mutably while user
//! code runs.

use crate::lang::builtins::{expect_int, take_kwarg};
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use crate::lang::format::{format_with_spec, repr, to_str};
use crate::lang::interp::Interpreter;
use crate::lang::ops::normalize_index;
use crate::lang::value::{values_equal, Set, Value};
use std::rc::Rc;

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "rsplit", "splitlines", "join",
    "replace", "startswith", "endswith", "find", "rfind", "index", "count", "isdigit", "isalpha",
    "isalnum", "isspace", "isupper", "islower", "title", "capitalize", "swapcase", "zfill",
    "center", "ljust", "rjust", "format",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "popitem", "update", "setdefault", "copy", "clear",
];

const SET_METHODS: &[&str] = &[
    "add", "remove", "discard", "pop", "union", "intersection", "difference",
    "symmetric_difference", "issubset", "issuperset", "isdisjoint", "update", "copy", "clear",
];

const FLOAT_METHODS: &[&str] = &["is_integer"];

type Kwargs = Vec<(String, Value)>;

/// Resolve `receiver.name` to a method name with static lifetime.
pub fn lookup(receiver: &Value, name: &str) -> Option<&'static str> {
    let table = match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Float(_) => FLOAT_METHODS,
        _ => return None,
    };
    table.iter().copied().find(|m| *m == name)
}

pub fn call(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    match receiver {
        Value::Str(s) => str_method(interp, s, name, args, kwargs),
        Value::List(_) => list_method(interp, receiver, name, args, kwargs),
        Value::Tuple(items) => {
            no_kwargs(name, &kwargs)?;
            sequence_search(items, name, args, "tuple")
        }
        Value::Dict(_) => dict_method(interp, receiver, name, args, kwargs),
        Value::Set(_) => set_method(interp, receiver, name, args, kwargs),
        Value::Float(f) if name == "is_integer" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::Bool(f.is_finite() && f.fract() == 0.0))
        }
        other => Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'{}' object has no attribute '{name}'", other.type_name()),
        )),
    }
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> ScriptResult<()> {
    let given = args.len();
    if given < min || given > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        return Err(ScriptError::type_error(format!(
            "{name}() takes {expected} argument{} ({given} given)",
            if min == max && min == 1 { "" } else { "s" }
        )));
    }
    Ok(())
}

fn no_kwargs(name: &str, kwargs: &Kwargs) -> ScriptResult<()> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(ScriptError::type_error(format!(
            "{name}() takes no keyword arguments"
        )))
    }
}

fn str_arg(value: &Value, name: &str) -> ScriptResult<Rc<str>> {
    value.expect_str(&format!("{name}() argument"))
}

fn char_count(text: &str) -> usize {
    text.chars().count()
}

/// Byte offset of the `n`th character, clamped to the end.
fn byte_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map_or(text.len(), |(i, _)| i)
}

/// Resolve optional `start`/`end` arguments to a byte window.
fn window(text: &str, start: Option<&Value>, end: Option<&Value>) -> ScriptResult<(usize, usize)> {
    let len = char_count(text) as i64;
    let clamp = |v: Option<&Value>, default: i64| -> ScriptResult<i64> {
        match v {
            None | Some(Value::None) => Ok(default),
            Some(v) => {
                let i = expect_int(v)?;
                Ok(if i < 0 { (i + len).max(0) } else { i.min(len) })
            }
        }
    };
    let start = clamp(start, 0)? as usize;
    let end = clamp(end, len)? as usize;
    Ok((byte_offset(text, start), byte_offset(text, end.max(start))))
}

fn str_method(
    interp: &mut Interpreter,
    s: &Rc<str>,
    name: &'static str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    let text: &str = s;
    if name == "format" {
        return format_method(interp, text, args, kwargs);
    }
    if matches!(name, "split" | "rsplit") {
        let sep = take_kwarg(&mut kwargs, "sep");
        let maxsplit = take_kwarg(&mut kwargs, "maxsplit");
        no_kwargs(name, &kwargs)?;
        expect_args(name, &args, 0, 2)?;
        let mut args = args.into_iter();
        let sep = args.next().or(sep);
        let maxsplit = match args.next().or(maxsplit) {
            Some(v) => expect_int(&v)?,
            None => -1,
        };
        let parts = match sep {
            None | Some(Value::None) => split_whitespace(text, maxsplit, name == "rsplit"),
            Some(sep) => {
                let sep = str_arg(&sep, name)?;
                if sep.is_empty() {
                    return Err(ScriptError::value_error("empty separator"));
                }
                split_on(text, &sep, maxsplit, name == "rsplit")
            }
        };
        return Ok(Value::list(parts.into_iter().map(Value::str).collect()));
    }
    no_kwargs(name, &kwargs)?;
    let arg = |i: usize| args.get(i);
    let value = match name {
        "upper" => {
            expect_args(name, &args, 0, 0)?;
            Value::str(text.to_uppercase())
        }
        "lower" => {
            expect_args(name, &args, 0, 0)?;
            Value::str(text.to_lowercase())
        }
        "swapcase" => {
            expect_args(name, &args, 0, 0)?;
            Value::str(
                text.chars()
                    .flat_map(|c| {
                        if c.is_uppercase() {
                            c.to_lowercase().collect::<Vec<_>>()
                        } else {
                            c.to_uppercase().collect::<Vec<_>>()
                        }
                    })
                    .collect::<String>(),
            )
        }
        "strip" | "lstrip" | "rstrip" => {
            expect_args(name, &args, 0, 1)?;
            let chars: Option<Vec<char>> = match arg(0) {
                None | Some(Value::None) => None,
                Some(v) => Some(str_arg(v, name)?.chars().collect()),
            };
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => text.trim_matches(matcher),
                "lstrip" => text.trim_start_matches(matcher),
                _ => text.trim_end_matches(matcher),
            })
        }
        "splitlines" => {
            expect_args(name, &args, 0, 0)?;
            Value::list(text.lines().map(Value::str).collect())
        }
        "join" => {
            expect_args(name, &args, 1, 1)?;
            let items = interp.collect(&args[0])?;
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Str(part) => parts.push(part.to_string()),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "sequence item {i}: expected str instance, {} found",
                            other.type_name()
                        )))
                    }
                }
            }
            let joined = parts.join(text);
            interp.meter.guard_bytes(joined.len() as u64)?;
            Value::str(joined)
        }
        "replace" => {
            expect_args(name, &args, 2, 3)?;
            let old = str_arg(&args[0], name)?;
            let new = str_arg(&args[1], name)?;
            let count = match arg(2) {
                Some(v) => expect_int(v)?,
                None => -1,
            };
            let occurrences = if old.is_empty() {
                char_count(text) + 1
            } else {
                text.matches(old.as_ref()).count()
            };
            let estimate = text.len() as u64 + (occurrences as u64).saturating_mul(new.len() as u64);
            interp.meter.guard_bytes(estimate)?;
            Value::str(if count < 0 {
                text.replace(old.as_ref(), &new)
            } else {
                text.replacen(old.as_ref(), &new, count as usize)
            })
        }
        "startswith" | "endswith" => {
            expect_args(name, &args, 1, 3)?;
            let (lo, hi) = window(text, arg(1), arg(2))?;
            let slice = &text[lo..hi];
            let candidates = match &args[0] {
                Value::Tuple(items) => items.as_ref().clone(),
                other => vec![other.clone()],
            };
            let mut found = false;
            for candidate in &candidates {
                let candidate = candidate.expect_str(&format!("{name} first arg"))?;
                let hit = if name == "startswith" {
                    slice.starts_with(candidate.as_ref())
                } else {
                    slice.ends_with(candidate.as_ref())
                };
                found |= hit;
            }
            Value::Bool(found)
        }
        "find" | "rfind" | "index" => {
            expect_args(name, &args, 1, 3)?;
            let needle = str_arg(&args[0], name)?;
            let (lo, hi) = window(text, arg(1), arg(2))?;
            let haystack = &text[lo..hi];
            let hit = if name == "rfind" {
                haystack.rfind(needle.as_ref())
            } else {
                haystack.find(needle.as_ref())
            };
            match hit {
                Some(byte) => Value::Int(char_count(&text[..lo + byte]) as i64),
                None if name == "index" => {
                    return Err(ScriptError::value_error("substring not found"))
                }
                None => Value::Int(-1),
            }
        }
        "count" => {
            expect_args(name, &args, 1, 3)?;
            let needle = str_arg(&args[0], name)?;
            let (lo, hi) = window(text, arg(1), arg(2))?;
            let haystack = &text[lo..hi];
            let n = if needle.is_empty() {
                char_count(haystack) + 1
            } else {
                haystack.matches(needle.as_ref()).count()
            };
            Value::Int(n as i64)
        }
        "isdigit" | "isalpha" | "isalnum" | "isspace" => {
            expect_args(name, &args, 0, 0)?;
            let test: fn(&char) -> bool = match name {
                "isdigit" => |c| c.is_ascii_digit(),
                "isalpha" => |c| c.is_alphabetic(),
                "isalnum" => |c| c.is_alphanumeric(),
                _ => |c| c.is_whitespace(),
            };
            Value::Bool(!text.is_empty() && text.chars().all(|c| test(&c)))
        }
        "isupper" | "islower" => {
            expect_args(name, &args, 0, 0)?;
            let cased: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
            let ok = if name == "isupper" {
                cased.iter().all(|c| !c.is_lowercase())
            } else {
                cased.iter().all(|c| !c.is_uppercase())
            };
            Value::Bool(!cased.is_empty() && ok)
        }
        "title" => {
            expect_args(name, &args, 0, 0)?;
            let mut out = String::with_capacity(text.len());
            let mut previous_cased = false;
            for c in text.chars() {
                if previous_cased {
                    out.extend(c.to_lowercase());
                } else {
                    out.extend(c.to_uppercase());
                }
                previous_cased = c.is_alphabetic();
            }
            Value::str(out)
        }
        "capitalize" => {
            expect_args(name, &args, 0, 0)?;
            let mut chars = text.chars();
            let out = match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            };
            Value::str(out)
        }
        "zfill" | "center" | "ljust" | "rjust" => {
            let max = if name == "zfill" { 1 } else { 2 };
            expect_args(name, &args, 1, max)?;
            let width = expect_int(&args[0])?.max(0) as usize;
            interp.meter.guard_bytes(width as u64 * 4)?;
            let fill = match arg(1) {
                None => ' ',
                Some(v) => {
                    let f = str_arg(v, name)?;
                    let mut chars = f.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => {
                            return Err(ScriptError::type_error(
                                "The fill character must be exactly one character long",
                            ))
                        }
                    }
                }
            };
            Value::str(justify(text, name, width, fill))
        }
        _ => {
            return Err(ScriptError::new(
                ErrorKind::Attribute,
                format!("'str' object has no attribute '{name}'"),
            ))
        }
    };
    Ok(value)
}

fn justify(text: &str, how: &str, width: usize, fill: char) -> String {
    let len = char_count(text);
    if len >= width {
        return text.to_string();
    }
    let padding = width - len;
    let run = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match how {
        "zfill" => {
            let (sign, digits) = match text.chars().next() {
                Some(c @ ('+' | '-')) => (c.to_string(), &text[1..]),
                _ => (String::new(), text),
            };
            format!("{sign}{}{digits}", "0".repeat(padding))
        }
        "ljust" => format!("{text}{}", run(padding)),
        "rjust" => format!("{}{text}", run(padding)),
        _ => {
            let left = padding / 2 + (padding & width & 1);
            format!("{}{text}{}", run(left), run(padding - left))
        }
    }
}

fn split_whitespace(text: &str, maxsplit: i64, from_right: bool) -> Vec<String> {
    if maxsplit < 0 {
        return text.split_whitespace().map(str::to_string).collect();
    }
    let mut parts = Vec::new();
    let mut rest = if from_right { text.trim_end() } else { text.trim_start() };
    let mut remaining = maxsplit;
    while !rest.is_empty() {
        if remaining == 0 {
            parts.push(rest.to_string());
            break;
        }
        if from_right {
            match rest.rfind(char::is_whitespace) {
                Some(i) => {
                    let ws_len = rest[i..].chars().next().map_or(1, char::len_utf8);
                    parts.push(rest[i + ws_len..].to_string());
                    rest = rest[..i].trim_end();
                }
                None => {
                    parts.push(rest.to_string());
                    break;
                }
            }
        } else {
            match rest.find(char::is_whitespace) {
                Some(i) => {
                    parts.push(rest[..i].to_string());
                    rest = rest[i..].trim_start();
                }
                None => {
                    parts.push(rest.to_string());
                    break;
                }
            }
        }
        remaining -= 1;
    }
    if from_right {
        parts.reverse();
    }
    parts
}

fn split_on(text: &str, sep: &str, maxsplit: i64, from_right: bool) -> Vec<String> {
    match (maxsplit < 0, from_right) {
        (true, _) => text.split(sep).map(str::to_string).collect(),
        (false, false) => text
            .splitn(maxsplit as usize + 1, sep)
            .map(str::to_string)
            .collect(),
        (false, true) => {
            let mut parts: Vec<String> = text
                .rsplitn(maxsplit as usize + 1, sep)
                .map(str::to_string)
                .collect();
            parts.reverse();
            parts
        }
    }
}

/// `str.format` with positional and keyword fields.
fn format_method(
    interp: &mut Interpreter,
    template: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    let mut out = String::new();
    let mut auto_index = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(ScriptError::value_error(
                    "Single '}' encountered in format string",
                ))
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => {
                            return Err(ScriptError::value_error(
                                "expected '}' before end of string",
                            ))
                        }
                    }
                }
                let (head, spec) = match field.split_once(':') {
                    Some((head, spec)) => (head.to_string(), spec.to_string()),
                    None => (field.clone(), String::new()),
                };
                let (key, conversion) = match head.split_once('!') {
                    Some((key, conv)) => (key.to_string(), conv.chars().next()),
                    None => (head, None),
                };
                let value = if key.is_empty() {
                    let value = args.get(auto_index).cloned().ok_or_else(|| {
                        ScriptError::new(
                            ErrorKind::Index,
                            format!("Replacement index {auto_index} out of range for positional args tuple"),
                        )
                    })?;
                    auto_index += 1;
                    value
                } else if let Ok(index) = key.parse::<usize>() {
                    args.get(index).cloned().ok_or_else(|| {
                        ScriptError::new(
                            ErrorKind::Index,
                            format!("Replacement index {index} out of range for positional args tuple"),
                        )
                    })?
                } else if key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    kwargs
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| ScriptError::new(ErrorKind::Key, repr(&Value::str(&key))))?
                } else {
                    return Err(ScriptError::value_error(format!(
                        "field '{key}' is not supported in the sandbox"
                    )));
                };
                let value = match conversion {
                    Some('r') | Some('a') => Value::str(repr(&value)),
                    Some(_) => Value::str(to_str(&value)),
                    None => value,
                };
                if spec.is_empty() {
                    out.push_str(&to_str(&value));
                } else {
                    out.push_str(&format_with_spec(&value, &spec)?);
                }
                interp.meter.guard_bytes(out.len() as u64)?;
            }
            other => out.push(other),
        }
    }
    Ok(Value::str(out))
}

fn sequence_search(
    items: &[Value],
    name: &str,
    args: Vec<Value>,
    type_name: &str,
) -> ScriptResult<Value> {
    expect_args(name, &args, 1, 1)?;
    let needle = &args[0];
    match name {
        "count" => {
            let mut n = 0;
            for item in items {
                if values_equal(item, needle)? {
                    n += 1;
                }
            }
            Ok(Value::Int(n))
        }
        _ => {
            for (i, item) in items.iter().enumerate() {
                if values_equal(item, needle)? {
                    return Ok(Value::Int(i as i64));
                }
            }
            Err(ScriptError::value_error(format!(
                "{type_name}.index(x): x not in {type_name}"
            )))
        }
    }
}

fn list_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: Vec<Value>,
    mut kwargs: Kwargs,
) -> ScriptResult<Value> {
    let Value::List(list) = receiver else {
        return Err(ScriptError::type_error("expected a list"));
    };
    if name == "sort" {
        let key = take_kwarg(&mut kwargs, "key");
        let reverse = take_kwarg(&mut kwargs, "reverse").is_some_and(|v| v.truthy());
        no_kwargs(name, &kwargs)?;
        expect_args(name, &args, 0, 0)?;
        let snapshot = list.borrow().clone();
        let sorted = interp.sort_values(snapshot, key.as_ref(), reverse)?;
        *list.borrow_mut() = sorted;
        return Ok(Value::None);
    }
    no_kwargs(name, &kwargs)?;
    match name {
        "append" => {
            expect_args(name, &args, 1, 1)?;
            let len = list.borrow().len();
            interp.meter.guard_slots(len + 1)?;
            list.borrow_mut().extend(args);
            Ok(Value::None)
        }
        "extend" => {
            expect_args(name, &args, 1, 1)?;
            let extra = interp.collect(&args[0])?;
            let len = list.borrow().len();
            interp.meter.guard_slots(len + extra.len())?;
            list.borrow_mut().extend(extra);
            Ok(Value::None)
        }
        "insert" => {
            expect_args(name, &args, 2, 2)?;
            let mut args = args.into_iter();
            let index = expect_int(&args.next().unwrap_or(Value::None))?;
            let value = args.next().unwrap_or(Value::None);
            let len = list.borrow().len() as i64;
            let pos = if index < 0 { (index + len).max(0) } else { index.min(len) };
            list.borrow_mut().insert(pos as usize, value);
            Ok(Value::None)
        }
        "pop" => {
            expect_args(name, &args, 0, 1)?;
            let len = list.borrow().len();
            if len == 0 {
                return Err(ScriptError::new(ErrorKind::Index, "pop from empty list"));
            }
            let index = match args.first() {
                Some(v) => expect_int(v)?,
                None => -1,
            };
            let pos = normalize_index(index, len)
                .ok_or_else(|| ScriptError::new(ErrorKind::Index, "pop index out of range"))?;
            Ok(list.borrow_mut().remove(pos))
        }
        "remove" => {
            expect_args(name, &args, 1, 1)?;
            let snapshot = list.borrow().clone();
            for (i, item) in snapshot.iter().enumerate() {
                if values_equal(item, &args[0])? {
                    list.borrow_mut().remove(i);
                    return Ok(Value::None);
                }
            }
            Err(ScriptError::value_error("list.remove(x): x not in list"))
        }
        "index" | "count" => {
            let snapshot = list.borrow().clone();
            if name == "index" {
                expect_args(name, &args, 1, 1)?;
                for (i, item) in snapshot.iter().enumerate() {
                    if values_equal(item, &args[0])? {
                        return Ok(Value::Int(i as i64));
                    }
                }
                return Err(ScriptError::value_error(format!(
                    "{} is not in list",
                    repr(&args[0])
                )));
            }
            sequence_search(&snapshot, name, args, "list")
        }
        "reverse" => {
            expect_args(name, &args, 0, 0)?;
            list.borrow_mut().reverse();
            Ok(Value::None)
        }
        "copy" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::list(list.borrow().clone()))
        }
        "clear" => {
            expect_args(name, &args, 0, 0)?;
            list.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'list' object has no attribute '{name}'"),
        )),
    }
}

fn dict_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    let Value::Dict(dict) = receiver else {
        return Err(ScriptError::type_error("expected a dict"));
    };
    if name == "update" {
        expect_args(name, &args, 0, 1)?;
        let mut incoming = Vec::new();
        if let Some(source) = args.first() {
            match source {
                Value::Dict(other) => incoming.extend(other.borrow().items()),
                other => {
                    for pair in interp.collect(other)? {
                        let items = interp.collect(&pair)?;
                        let [k, v]: [Value; 2] = items.try_into().map_err(|_| {
                            ScriptError::value_error(
                                "dictionary update sequence element has the wrong length; 2 is required",
                            )
                        })?;
                        incoming.push((k, v));
                    }
                }
            }
        }
        incoming.extend(kwargs.into_iter().map(|(k, v)| (Value::str(k), v)));
        let mut target = dict.borrow_mut();
        for (k, v) in incoming {
            target.insert(k, v)?;
        }
        return Ok(Value::None);
    }
    no_kwargs(name, &kwargs)?;
    match name {
        "get" => {
            expect_args(name, &args, 1, 2)?;
            let found = dict.borrow().get(&args[0])?;
            Ok(found.or_else(|| args.get(1).cloned()).unwrap_or(Value::None))
        }
        "keys" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::list(dict.borrow().keys()))
        }
        "values" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::list(dict.borrow().values()))
        }
        "items" => {
            expect_args(name, &args, 0, 0)?;
            let items = dict.borrow().items();
            Ok(Value::list(
                items
                    .into_iter()
                    .map(|(k, v)| Value::tuple(vec![k, v]))
                    .collect(),
            ))
        }
        "pop" => {
            expect_args(name, &args, 1, 2)?;
            let removed = dict.borrow_mut().remove(&args[0])?;
            match (removed, args.get(1)) {
                (Some(value), _) => Ok(value),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err(ScriptError::new(ErrorKind::Key, repr(&args[0]))),
            }
        }
        "popitem" => {
            expect_args(name, &args, 0, 0)?;
            let last = dict.borrow_mut().pop_last();
            last.map(|(k, v)| Value::tuple(vec![k, v])).ok_or_else(|| {
                ScriptError::new(ErrorKind::Key, "'popitem(): dictionary is empty'")
            })
        }
        "setdefault" => {
            expect_args(name, &args, 1, 2)?;
            let existing = dict.borrow().get(&args[0])?;
            if let Some(value) = existing {
                return Ok(value);
            }
            let default = args.get(1).cloned().unwrap_or(Value::None);
            dict.borrow_mut().insert(args[0].clone(), default.clone())?;
            Ok(default)
        }
        "copy" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::dict(dict.borrow().clone()))
        }
        "clear" => {
            expect_args(name, &args, 0, 0)?;
            dict.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'dict' object has no attribute '{name}'"),
        )),
    }
}

fn set_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &'static str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> ScriptResult<Value> {
    let Value::Set(set) = receiver else {
        return Err(ScriptError::type_error("expected a set"));
    };
    no_kwargs(name, &kwargs)?;
    let others = |interp: &mut Interpreter, args: &[Value]| -> ScriptResult<Vec<Set>> {
        args.iter()
            .map(|arg| Set::from_values(interp.collect(arg)?))
            .collect()
    };
    match name {
        "add" => {
            expect_args(name, &args, 1, 1)?;
            set.borrow_mut().insert(args[0].clone())?;
            Ok(Value::None)
        }
        "remove" => {
            expect_args(name, &args, 1, 1)?;
            if set.borrow_mut().remove(&args[0])? {
                Ok(Value::None)
            } else {
                Err(ScriptError::new(ErrorKind::Key, repr(&args[0])))
            }
        }
        "discard" => {
            expect_args(name, &args, 1, 1)?;
            set.borrow_mut().remove(&args[0])?;
            Ok(Value::None)
        }
        "pop" => {
            expect_args(name, &args, 0, 0)?;
            let first = set.borrow_mut().pop_first();
            first.ok_or_else(|| ScriptError::new(ErrorKind::Key, "'pop from an empty set'"))
        }
        "union" | "update" => {
            let mut merged = set.borrow().clone();
            for other in others(interp, &args)? {
                for value in other.values() {
                    merged.insert(value)?;
                }
            }
            if name == "update" {
                *set.borrow_mut() = merged;
                return Ok(Value::None);
            }
            Ok(Value::set(merged))
        }
        "intersection" | "difference" => {
            let mut current = set.borrow().clone();
            for other in others(interp, &args)? {
                let mut next = Set::new();
                for value in current.values() {
                    if other.contains(&value)? == (name == "intersection") {
                        next.insert(value)?;
                    }
                }
                current = next;
            }
            Ok(Value::set(current))
        }
        "symmetric_difference" => {
            expect_args(name, &args, 1, 1)?;
            let mine = set.borrow().clone();
            let other = others(interp, &args)?.remove(0);
            let mut out = Set::new();
            for value in mine.values() {
                if !other.contains(&value)? {
                    out.insert(value)?;
                }
            }
            for value in other.values() {
                if !mine.contains(&value)? {
                    out.insert(value)?;
                }
            }
            Ok(Value::set(out))
        }
        "issubset" | "issuperset" | "isdisjoint" => {
            expect_args(name, &args, 1, 1)?;
            let mine = set.borrow().clone();
            let other = others(interp, &args)?.remove(0);
            let result = match name {
                "issubset" => mine.keys().all(|k| other.contains_key(k)),
                "issuperset" => other.keys().all(|k| mine.contains_key(k)),
                _ => mine.keys().all(|k| !other.contains_key(k)),
            };
            Ok(Value::Bool(result))
        }
        "copy" => {
            expect_args(name, &args, 0, 0)?;
            Ok(Value::set(set.borrow().clone()))
        }
        "clear" => {
            expect_args(name, &args, 0, 0)?;
            set.borrow_mut().clear();
            Ok(Value::None)
        }
        _ => Err(ScriptError::new(
            ErrorKind::Attribute,
            format!("'set' object has no attribute '{name}'"),
        )),
    }
}
