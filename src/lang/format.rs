//! Text renderings of values: `str()`, `repr()`, format specs and `%`
//! interpolation, following Python's conventions.

use crate::lang::error::{ScriptError, ScriptResult};
use crate::lang::value::{Value, MAX_VALUE_DEPTH};
use std::fmt::Write;
use std::rc::Rc;

pub fn to_str(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        Value::Exception(e) => e.message.clone(),
        other => repr(other),
    }
}

pub fn repr(value: &Value) -> String {
    let mut out = String::new();
    let mut active = Vec::new();
    write_repr(&mut out, value, &mut active);
    out
}

fn write_repr(out: &mut String, value: &Value, active: &mut Vec<usize>) {
    if active.len() > MAX_VALUE_DEPTH {
        out.push_str("...");
        return;
    }
    match value {
        Value::None => out.push_str("None"),
        Value::Ellipsis => out.push_str("Ellipsis"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&repr_str(s)),
        Value::List(items) => {
            let id = Rc::as_ptr(items) as usize;
            if active.contains(&id) {
                out.push_str("[...]");
                return;
            }
            active.push(id);
            let items = items.borrow().clone();
            out.push('[');
            write_items(out, &items, active);
            out.push(']');
            active.pop();
        }
        Value::Tuple(items) => {
            // Tuples cannot contain themselves but still count toward depth.
            active.push(Rc::as_ptr(items) as usize);
            out.push('(');
            write_items(out, items, active);
            if items.len() == 1 {
                out.push(',');
            }
            out.push(')');
            active.pop();
        }
        Value::Dict(dict) => {
            let id = Rc::as_ptr(dict) as usize;
            if active.contains(&id) {
                out.push_str("{...}");
                return;
            }
            active.push(id);
            let items = dict.borrow().items();
            out.push('{');
            for (i, (k, v)) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(out, k, active);
                out.push_str(": ");
                write_repr(out, v, active);
            }
            out.push('}');
            active.pop();
        }
        Value::Set(set) => {
            let members = set.borrow().values();
            if members.is_empty() {
                out.push_str("set()");
                return;
            }
            active.push(Rc::as_ptr(set) as usize);
            out.push('{');
            write_items(out, &members, active);
            out.push('}');
            active.pop();
        }
        Value::Range(r) => {
            if r.step == 1 {
                let _ = write!(out, "range({}, {})", r.start, r.stop);
            } else {
                let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
            }
        }
        Value::Function(f) => {
            let _ = write!(out, "<function {}>", f.def.name);
        }
        Value::Generator(_) => out.push_str("<generator object <genexpr>>"),
        Value::Builtin(c) if c.is_type() => {
            let _ = write!(out, "<class '{}'>", c.name());
        }
        Value::Builtin(c) => {
            let _ = write!(out, "<built-in function {}>", c.name());
        }
        Value::Method(m) => {
            let _ = write!(
                out,
                "<built-in method {} of {} object>",
                m.name,
                m.receiver.type_name()
            );
        }
        Value::ExceptionType(kind) => {
            let _ = write!(out, "<class '{}'>", kind.python_name());
        }
        Value::Exception(e) => {
            if e.message.is_empty() {
                let _ = write!(out, "{}()", e.kind.python_name());
            } else {
                let _ = write!(out, "{}({})", e.kind.python_name(), repr_str(&e.message));
            }
        }
    }
}

fn write_items(out: &mut String, items: &[Value], active: &mut Vec<usize>) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(out, item, active);
    }
}

/// Quote a string the way `repr()` does.
pub fn repr_str(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Shortest round-trip rendering with Python's exponent thresholds.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let sci = format!("{f:e}");
    let (mantissa, exponent) = split_exponent(&sci);
    if (-4..16).contains(&exponent) {
        let plain = format!("{f}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        format!("{}{}", mantissa, python_exponent(exponent))
    }
}

fn split_exponent(sci: &str) -> (&str, i32) {
    match sci.split_once('e') {
        Some((m, e)) => (m, e.parse().unwrap_or(0)),
        None => (sci, 0),
    }
}

fn python_exponent(exponent: i32) -> String {
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("e{}{:02}", sign, exponent.abs())
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alternate: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_spec(spec: &str) -> ScriptResult<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut out = Spec::default();
    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'#') {
        out.alternate = true;
        i += 1;
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
    }
    if i > start {
        let digits: String = chars[start..i].iter().collect();
        out.width = digits
            .parse()
            .map_err(|_| ScriptError::value_error("Too many decimal digits in format string"))?;
    }
    if let Some(&c) = chars.get(i) {
        if c == ',' || c == '_' {
            out.grouping = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i == start {
            return Err(ScriptError::value_error("Format specifier missing precision"));
        }
        let digits: String = chars[start..i].iter().collect();
        out.precision = Some(
            digits
                .parse()
                .map_err(|_| ScriptError::value_error("Too many decimal digits in format string"))?,
        );
    }
    if let Some(&c) = chars.get(i) {
        out.kind = Some(c);
        i += 1;
    }
    if i != chars.len() || out.width > 10_000 || out.precision.is_some_and(|p| p > 1_000) {
        return Err(ScriptError::value_error("Invalid format specifier"));
    }
    Ok(out)
}

/// Apply a format spec such as `>8.2f` to a value.
pub fn format_with_spec(value: &Value, spec: &str) -> ScriptResult<String> {
    if spec.is_empty() {
        return Ok(to_str(value));
    }
    let spec = parse_spec(spec)?;
    match value {
        Value::Str(s) => format_text(s, &spec),
        Value::Bool(_) if spec.kind.is_none() => format_text(&to_str(value), &spec),
        Value::Bool(_) | Value::Int(_) => {
            let i = value.as_int().unwrap_or(0);
            match spec.kind {
                None | Some('d') | Some('n') | Some('b') | Some('o') | Some('x') | Some('X')
                | Some('c') => format_int(i, &spec),
                Some('e') | Some('E') | Some('f') | Some('F') | Some('g') | Some('G')
                | Some('%') => format_float(i as f64, &spec),
                Some(other) => Err(unknown_code(other, "int")),
            }
        }
        Value::Float(f) => match spec.kind {
            None | Some('e') | Some('E') | Some('f') | Some('F') | Some('g') | Some('G')
            | Some('%') => format_float(*f, &spec),
            Some(other) => Err(unknown_code(other, "float")),
        },
        other => Err(ScriptError::type_error(format!(
            "unsupported format string passed to {}.__format__",
            other.type_name()
        ))),
    }
}

fn unknown_code(code: char, type_name: &str) -> ScriptError {
    ScriptError::value_error(format!(
        "Unknown format code '{code}' for object of type '{type_name}'"
    ))
}

fn format_text(text: &str, spec: &Spec) -> ScriptResult<String> {
    if let Some(kind) = spec.kind {
        if kind != 's' {
            return Err(unknown_code(kind, "str"));
        }
    }
    if spec.sign.is_some() {
        return Err(ScriptError::value_error(
            "Sign not allowed in string format specifier",
        ));
    }
    let body: String = match spec.precision {
        Some(p) => text.chars().take(p).collect(),
        None => text.to_string(),
    };
    Ok(pad(String::new(), body, spec, '<'))
}

fn sign_prefix(negative: bool, spec: &Spec) -> String {
    if negative {
        "-".to_string()
    } else {
        match spec.sign {
            Some('+') => "+".to_string(),
            Some(' ') => " ".to_string(),
            _ => String::new(),
        }
    }
}

fn format_int(i: i64, spec: &Spec) -> ScriptResult<String> {
    if spec.precision.is_some() {
        return Err(ScriptError::value_error(
            "Precision not allowed in integer format specifier",
        ));
    }
    if spec.kind == Some('c') {
        let c = u32::try_from(i)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ScriptError::new(crate::lang::error::ErrorKind::Overflow, "%c arg not in range(0x110000)"))?;
        return Ok(pad(String::new(), c.to_string(), spec, '<'));
    }
    let magnitude = i.unsigned_abs();
    let (digits, prefix) = match spec.kind {
        Some('b') => (format!("{magnitude:b}"), "0b"),
        Some('o') => (format!("{magnitude:o}"), "0o"),
        Some('x') => (format!("{magnitude:x}"), "0x"),
        Some('X') => (format!("{magnitude:X}"), "0X"),
        _ => (magnitude.to_string(), ""),
    };
    let digits = match spec.grouping {
        Some(sep) => group_digits(&digits, sep, if prefix.is_empty() { 3 } else { 4 }),
        None => digits,
    };
    let mut head = sign_prefix(i < 0, spec);
    if spec.alternate {
        head.push_str(prefix);
    }
    Ok(pad(head, digits, spec, '>'))
}

fn format_float(f: f64, spec: &Spec) -> ScriptResult<String> {
    let negative = f.is_sign_negative() && !f.is_nan();
    let magnitude = f.abs();
    let upper = matches!(spec.kind, Some('E') | Some('F') | Some('G'));
    let mut body = if !magnitude.is_finite() {
        if magnitude.is_nan() {
            "nan".to_string()
        } else {
            "inf".to_string()
        }
    } else {
        match spec.kind {
            Some('f') | Some('F') => format!("{:.*}", spec.precision.unwrap_or(6), magnitude),
            Some('e') | Some('E') => sci(magnitude, spec.precision.unwrap_or(6)),
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), magnitude * 100.0),
            Some('g') | Some('G') => general(magnitude, spec.precision.unwrap_or(6), spec.alternate),
            None => match spec.precision {
                Some(p) => {
                    let g = general(magnitude, p, false);
                    if g.contains('.') || g.contains('e') || g.contains("inf") {
                        g
                    } else {
                        format!("{g}.0")
                    }
                }
                None => float_repr(magnitude),
            },
            Some(other) => return Err(unknown_code(other, "float")),
        }
    };
    if upper {
        body = body.to_uppercase();
    }
    if let Some(sep) = spec.grouping {
        let split = body
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(body.len());
        let (int_part, rest) = body.split_at(split);
        body = format!("{}{}", group_digits(int_part, sep, 3), rest);
    }
    let head = sign_prefix(negative, spec);
    Ok(pad(head, body, spec, '>'))
}

/// `{:e}` with Python's two-digit signed exponent.
fn sci(magnitude: f64, precision: usize) -> String {
    let raw = format!("{:.*e}", precision, magnitude);
    let (mantissa, exponent) = split_exponent(&raw);
    format!("{}{}", mantissa, python_exponent(exponent))
}

fn general(magnitude: f64, precision: usize, keep_zeros: bool) -> String {
    let p = precision.max(1);
    if magnitude == 0.0 {
        return if keep_zeros {
            format!("{:.*}", p - 1, 0.0)
        } else {
            "0".to_string()
        };
    }
    let raw = format!("{:.*e}", p - 1, magnitude);
    let (_, exponent) = split_exponent(&raw);
    let text = if exponent >= -4 && (exponent as i64) < p as i64 {
        let decimals = (p as i64 - 1 - exponent as i64).max(0) as usize;
        format!("{:.*}", decimals, magnitude)
    } else {
        sci(magnitude, p - 1)
    };
    if keep_zeros {
        return text;
    }
    strip_trailing_zeros(&text)
}

fn strip_trailing_zeros(text: &str) -> String {
    let (mantissa, exponent) = match text.find('e') {
        Some(idx) => text.split_at(idx),
        None => (text, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{mantissa}{exponent}")
}

fn group_digits(digits: &str, sep: char, every: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(chars.len() + chars.len() / every);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % every == 0 {
            out.push(sep);
        }
        out.push(*c);
    }
    out
}

fn pad(head: String, body: String, spec: &Spec, default_align: char) -> String {
    let (fill, align) = if spec.zero && spec.align.is_none() && default_align == '>' {
        ('0', '=')
    } else {
        (spec.fill.unwrap_or(' '), spec.align.unwrap_or(default_align))
    };
    let len = head.chars().count() + body.chars().count();
    if len >= spec.width {
        return format!("{head}{body}");
    }
    let missing = spec.width - len;
    let filler = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match align {
        '<' => format!("{head}{body}{}", filler(missing)),
        '^' => {
            let left = missing / 2;
            format!("{}{head}{body}{}", filler(left), filler(missing - left))
        }
        '=' => format!("{head}{}{body}", filler(missing)),
        _ => format!("{}{head}{body}", filler(missing)),
    }
}

/// `template % args` string interpolation.
pub fn percent_format(template: &str, args: &Value) -> ScriptResult<String> {
    let values: Vec<Value> = match args {
        Value::Tuple(items) => items.as_ref().clone(),
        other => vec![other.clone()],
    };
    let mut next = values.iter();
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        let mut flags = String::new();
        while let Some(&c) = chars.get(i) {
            if matches!(c, '-' | '+' | ' ' | '0' | '#') {
                flags.push(c);
                i += 1;
            } else {
                break;
            }
        }
        let mut width = String::new();
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            width.push(chars[i]);
            i += 1;
        }
        let mut precision = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut digits = String::new();
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                digits.push(chars[i]);
                i += 1;
            }
            precision = Some(digits);
        }
        let Some(&kind) = chars.get(i) else {
            return Err(ScriptError::value_error("incomplete format"));
        };
        i += 1;
        if kind == '%' {
            out.push('%');
            continue;
        }
        let value = next
            .next()
            .ok_or_else(|| ScriptError::type_error("not enough arguments for format string"))?;

        let mut spec = String::new();
        if flags.contains('-') {
            spec.push('<');
        }
        if flags.contains('+') {
            spec.push('+');
        } else if flags.contains(' ') {
            spec.push(' ');
        }
        if flags.contains('#') {
            spec.push('#');
        }
        if flags.contains('0') && !flags.contains('-') {
            spec.push('0');
        }
        spec.push_str(&width);
        let precision: Option<usize> = precision.map(|p| p.parse().unwrap_or(0));

        let rendered = match kind {
            's' | 'r' => {
                let text = if kind == 's' { to_str(value) } else { repr(value) };
                let text_spec = if flags.contains('-') {
                    format!("<{width}")
                } else {
                    format!(">{width}")
                };
                let text = match precision {
                    Some(p) => text.chars().take(p).collect(),
                    None => text,
                };
                format_with_spec(&Value::str(text), &text_spec)?
            }
            'd' | 'i' | 'x' | 'X' | 'o' => {
                let number = match value {
                    Value::Float(f) => Value::Int(f.trunc() as i64),
                    v if v.as_int().is_some() => Value::Int(v.as_int().unwrap_or(0)),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "%{kind} format: a real number is required, not {}",
                            other.type_name()
                        )))
                    }
                };
                let code = if kind == 'i' { 'd' } else { kind };
                format_with_spec(&number, &format!("{spec}{code}"))?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let number = value.as_float().ok_or_else(|| {
                    ScriptError::type_error(format!(
                        "must be real number, not {}",
                        value.type_name()
                    ))
                })?;
                let precision = precision.map(|p| format!(".{p}")).unwrap_or_default();
                format_with_spec(&Value::Float(number), &format!("{spec}{precision}{kind}"))?
            }
            other => {
                return Err(ScriptError::value_error(format!(
                    "unsupported format character '{other}'"
                )))
            }
        };
        out.push_str(&rendered);
    }
    if next.next().is_some() {
        return Err(ScriptError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::{Dict, Set};

    #[test]
    fn float_repr_matches_python() {
        assert_eq!(float_repr(4.0), "4.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(2.5), "2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1e15), "1000000000000000.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(0.00001), "1e-05");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(1.5e300), "1.5e+300");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn string_quoting() {
        assert_eq!(repr_str("abc"), "'abc'");
        assert_eq!(repr_str("it's"), "\"it's\"");
        assert_eq!(repr_str("a\nb"), "'a\\nb'");
        assert_eq!(repr_str("both ' and \""), "'both \\' and \"'");
    }

    #[test]
    fn container_reprs() {
        let list = Value::list(vec![Value::Int(0), Value::str("a"), Value::None]);
        assert_eq!(repr(&list), "[0, 'a', None]");
        assert_eq!(to_str(&list), "[0, 'a', None]");
        assert_eq!(repr(&Value::tuple(vec![Value::Int(1)])), "(1,)");
        assert_eq!(repr(&Value::tuple(vec![])), "()");
        let mut dict = Dict::new();
        dict.insert(Value::str("a"), Value::Bool(true)).unwrap();
        assert_eq!(repr(&Value::dict(dict)), "{'a': True}");
        assert_eq!(repr(&Value::set(Set::new())), "set()");
    }

    #[test]
    fn self_referencing_list_repr_is_elided() {
        let list = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(repr(&list), "[1, [...]]");
    }

    #[test]
    fn deep_tuples_are_elided_like_lists() {
        let mut nested = Value::Int(0);
        for _ in 0..1_000 {
            nested = Value::tuple(vec![nested]);
        }
        let text = repr(&nested);
        assert!(text.contains("..."), "{text}");
        assert!(text.len() < 4 * MAX_VALUE_DEPTH, "{}", text.len());

        let mut nested = Value::Int(0);
        for _ in 0..1_000 {
            let mut dict = Dict::new();
            dict.insert(Value::Int(1), nested).unwrap();
            nested = Value::dict(dict);
        }
        let text = to_str(&nested);
        assert!(text.contains("..."), "{text}");
        assert!(text.len() < 8 * MAX_VALUE_DEPTH, "{}", text.len());
    }

    #[test]
    fn numeric_format_specs() {
        assert_eq!(format_with_spec(&Value::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(format_with_spec(&Value::Float(3.14159), ">8.2f").unwrap(), "    3.14");
        assert_eq!(format_with_spec(&Value::Int(42), "05d").unwrap(), "00042");
        assert_eq!(format_with_spec(&Value::Int(-42), "05d").unwrap(), "-0042");
        assert_eq!(format_with_spec(&Value::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(format_with_spec(&Value::Int(255), "#x").unwrap(), "0xff");
        assert_eq!(format_with_spec(&Value::Float(0.256), ".1%").unwrap(), "25.6%");
        assert_eq!(format_with_spec(&Value::Float(1234.5), "e").unwrap(), "1.234500e+03");
        assert_eq!(format_with_spec(&Value::Float(0.0001234), "g").unwrap(), "0.0001234");
        assert_eq!(format_with_spec(&Value::Float(123456789.0), "g").unwrap(), "1.23457e+08");
        assert_eq!(format_with_spec(&Value::Int(7), "+").unwrap(), "+7");
    }

    #[test]
    fn text_format_specs() {
        assert_eq!(format_with_spec(&Value::str("ab"), "<4").unwrap(), "ab  ");
        assert_eq!(format_with_spec(&Value::str("ab"), "*^6").unwrap(), "**ab**");
        assert_eq!(format_with_spec(&Value::str("abcdef"), ".3").unwrap(), "abc");
        assert!(format_with_spec(&Value::str("ab"), "d").is_err());
        assert!(format_with_spec(&Value::list(vec![]), ">3").is_err());
    }

    #[test]
    fn percent_interpolation() {
        let args = Value::tuple(vec![Value::str("Ada"), Value::Int(36), Value::Float(1.5)]);
        assert_eq!(
            percent_format("%s is %d (%.2f) 100%%", &args).unwrap(),
            "Ada is 36 (1.50) 100%"
        );
        assert_eq!(percent_format("%5s|%-3d|", &Value::tuple(vec![Value::str("x"), Value::Int(1)])).unwrap(), "    x|1  |");
        assert!(percent_format("%s %s", &Value::str("x")).is_err());
        assert!(percent_format("%s", &Value::tuple(vec![Value::Int(1), Value::Int(2)])).is_err());
    }
}
