use crate::capability::Capability;
use crate::lang::ast::{CompClause, Expr, FunctionDef};
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use crate::lang::interp::Scope;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Nesting beyond this is reported instead of recursed into.
pub const MAX_VALUE_DEPTH: usize = 200;

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<Dict>>),
    Set(Rc<RefCell<Set>>),
    Range(RangeValue),
    Function(Rc<Function>),
    Generator(Rc<Generator>),
    Builtin(Capability),
    Method(Rc<BoundMethod>),
    ExceptionType(ErrorKind),
    Exception(Rc<ScriptError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    /// Exact number of elements. A range spanning every `i64` has
    /// `u64::MAX` of them, so this never truncates.
    pub fn count(&self) -> u64 {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / (-step)
        } else {
            0
        };
        n as u64
    }

    /// Length as reported by `len()`.
    pub fn len(&self) -> ScriptResult<usize> {
        let n = self.count();
        if n > i64::MAX as u64 {
            return Err(ScriptError::new(
                ErrorKind::Overflow,
                "Python int too large to convert to C ssize_t",
            ));
        }
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Element `index`, which must be below [`RangeValue::count`].
    pub fn get(&self, index: u64) -> i64 {
        (self.start as i128 + index as i128 * self.step as i128) as i64
    }

    /// Element at a possibly negative index.
    pub fn at(&self, index: i64) -> Option<i64> {
        let n = i128::from(self.count());
        let i = if index < 0 {
            i128::from(index) + n
        } else {
            i128::from(index)
        };
        (0..n).contains(&i).then(|| self.get(i as u64))
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            value >= self.start && value < self.stop
        } else {
            value <= self.start && value > self.stop
        };
        in_bounds && (value as i128 - self.start as i128) % self.step as i128 == 0
    }
}

/// A user-defined function or lambda, closed over its defining scope.
#[derive(Debug)]
pub struct Function {
    pub def: Rc<FunctionDef>,
    pub defaults: Vec<Value>,
    pub closure: Rc<Scope>,
}

/// A generator expression. Its first iterable is evaluated up front; the
/// remaining clauses run while it is consumed, at most once.
#[derive(Debug)]
pub struct Generator {
    pub body: Rc<GeneratorBody>,
    pub first: Value,
    pub scope: Rc<Scope>,
    pub exhausted: Cell<bool>,
}

#[derive(Debug)]
pub struct GeneratorBody {
    pub element: Expr,
    pub clauses: Vec<CompClause>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: &'static str,
}

/// Hashable projection of a value used for dict keys and set members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    None,
    Ellipsis,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<Key>),
    Builtin(Capability),
    ExceptionType(ErrorKind),
    Function(usize),
    Generator(usize),
}

impl Key {
    pub fn from_value(value: &Value) -> ScriptResult<Key> {
        Self::build(value, 0)
    }

    fn build(value: &Value, depth: usize) -> ScriptResult<Key> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ScriptError::new(
                ErrorKind::Recursion,
                "maximum recursion depth exceeded while hashing",
            ));
        }
        Ok(match value {
            Value::None => Key::None,
            Value::Ellipsis => Key::Ellipsis,
            Value::Bool(b) => Key::Int(i64::from(*b)),
            Value::Int(i) => Key::Int(*i),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 9.2e18 {
                    Key::Int(*f as i64)
                } else {
                    Key::Float(f.to_bits())
                }
            }
            Value::Str(s) => Key::Str(s.clone()),
            Value::Tuple(items) => Key::Tuple(
                items
                    .iter()
                    .map(|item| Self::build(item, depth + 1))
                    .collect::<ScriptResult<Vec<_>>>()?,
            ),
            Value::Builtin(c) => Key::Builtin(*c),
            Value::ExceptionType(k) => Key::ExceptionType(*k),
            Value::Function(f) => Key::Function(Rc::as_ptr(f) as usize),
            Value::Generator(g) => Key::Generator(Rc::as_ptr(g) as usize),
            other => {
                return Err(ScriptError::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }
}

/// Insertion-ordered mapping; keeps the original key value for iteration.
#[derive(Debug, Default, Clone)]
pub struct Dict {
    entries: IndexMap<Key, (Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> ScriptResult<Option<Value>> {
        let k = Key::from_value(key)?;
        Ok(self.entries.get(&k).map(|(_, v)| v.clone()))
    }

    pub fn contains(&self, key: &Value) -> ScriptResult<bool> {
        Ok(self.entries.contains_key(&Key::from_value(key)?))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> ScriptResult<()> {
        let k = Key::from_value(&key)?;
        match self.entries.get_mut(&k) {
            Some(slot) => slot.1 = value,
            None => {
                self.entries.insert(k, (key, value));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> ScriptResult<Option<Value>> {
        let k = Key::from_value(key)?;
        Ok(self.entries.shift_remove(&k).map(|(_, v)| v))
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.entries.pop().map(|(_, pair)| pair)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> Vec<Value> {
        self.entries.values().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries.values().map(|(_, v)| v.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Value, Value)> {
        self.entries.values().cloned().collect()
    }
}

/// Insertion-ordered set.
#[derive(Debug, Default, Clone)]
pub struct Set {
    members: IndexMap<Key, Value>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> ScriptResult<Self> {
        let mut set = Self::new();
        for value in values {
            set.insert(value)?;
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn insert(&mut self, value: Value) -> ScriptResult<bool> {
        let k = Key::from_value(&value)?;
        if self.members.contains_key(&k) {
            return Ok(false);
        }
        self.members.insert(k, value);
        Ok(true)
    }

    pub fn contains(&self, value: &Value) -> ScriptResult<bool> {
        Ok(self.members.contains_key(&Key::from_value(value)?))
    }

    pub fn remove(&mut self, value: &Value) -> ScriptResult<bool> {
        let k = Key::from_value(value)?;
        Ok(self.members.shift_remove(&k).is_some())
    }

    pub fn pop_first(&mut self) -> Option<Value> {
        self.members.shift_remove_index(0).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn values(&self) -> Vec<Value> {
        self.members.values().cloned().collect()
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.members.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.members.keys()
    }
}

impl Value {
    pub fn str(text: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(text.as_ref()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(dict: Dict) -> Value {
        Value::Dict(Rc::new(RefCell::new(dict)))
    }

    pub fn set(set: Set) -> Value {
        Value::Set(Rc::new(RefCell::new(set)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Ellipsis => "ellipsis",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Generator(_) => "generator",
            Value::Builtin(c) if c.is_type() => "type",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Method(_) => "method",
            Value::ExceptionType(_) => "type",
            Value::Exception(e) => e.kind.python_name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    /// Integer view of ints and bools.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any real number.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Bool(_) | Value::Float(_))
    }

    /// Index argument for sequences.
    pub fn expect_index(&self, what: &str) -> ScriptResult<i64> {
        self.as_int().ok_or_else(|| {
            ScriptError::type_error(format!(
                "{what} indices must be integers or slices, not {}",
                self.type_name()
            ))
        })
    }

    pub fn expect_str(&self, context: &str) -> ScriptResult<Rc<str>> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            other => Err(ScriptError::type_error(format!(
                "{context} must be str, not {}",
                other.type_name()
            ))),
        }
    }

    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Ellipsis, Value::Ellipsis) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Generator(a), Value::Generator(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::ExceptionType(a), Value::ExceptionType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Structural equality with Python's numeric cross-type rules.
pub fn values_equal(a: &Value, b: &Value) -> ScriptResult<bool> {
    equal_at(a, b, 0)
}

fn equal_at(a: &Value, b: &Value, depth: usize) -> ScriptResult<bool> {
    if depth > MAX_VALUE_DEPTH {
        return Err(ScriptError::new(
            ErrorKind::Recursion,
            "maximum recursion depth exceeded in comparison",
        ));
    }
    Ok(match (a, b) {
        (x, y) if x.is_number() && y.is_number() => match (x.as_int(), y.as_int()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_float() == y.as_float(),
        },
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            sequences_equal(&x, &y, depth)?
        }
        (Value::Tuple(x), Value::Tuple(y)) => sequences_equal(x, y, depth)?,
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (key, value) in x.items() {
                match y.get(&key)? {
                    Some(other) if equal_at(&value, &other, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.keys().all(|k| y.contains_key(k))
        }
        (Value::Range(x), Value::Range(y)) => {
            let (lx, ly) = (x.count(), y.count());
            lx == ly && (lx == 0 || (x.start == y.start && (lx == 1 || x.step == y.step)))
        }
        (Value::Exception(x), Value::Exception(y)) => Rc::ptr_eq(x, y),
        (x, y) => x.identical(y),
    })
}

fn sequences_equal(x: &[Value], y: &[Value], depth: usize) -> ScriptResult<bool> {
    if x.len() != y.len() {
        return Ok(false);
    }
    for (a, b) in x.iter().zip(y.iter()) {
        if !equal_at(a, b, depth + 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ordering for `<`, `sorted`, `min` and `max`.
pub fn compare_values(a: &Value, b: &Value) -> ScriptResult<std::cmp::Ordering> {
    compare_at(a, b, 0)
}

fn compare_at(a: &Value, b: &Value, depth: usize) -> ScriptResult<std::cmp::Ordering> {
    use std::cmp::Ordering;
    if depth > MAX_VALUE_DEPTH {
        return Err(ScriptError::new(
            ErrorKind::Recursion,
            "maximum recursion depth exceeded in comparison",
        ));
    }
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => match (x.as_int(), y.as_int()) {
            (Some(i), Some(j)) => Ok(i.cmp(&j)),
            _ => {
                let (fx, fy) = (x.as_float().unwrap_or(f64::NAN), y.as_float().unwrap_or(f64::NAN));
                Ok(fx.partial_cmp(&fy).unwrap_or(Ordering::Equal))
            }
        },
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            compare_sequences(&x, &y, depth)
        }
        (Value::Tuple(x), Value::Tuple(y)) => compare_sequences(x, y, depth),
        _ => Err(ScriptError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare_sequences(x: &[Value], y: &[Value], depth: usize) -> ScriptResult<std::cmp::Ordering> {
    for (a, b) in x.iter().zip(y.iter()) {
        if !equal_at(a, b, depth + 1)? {
            return compare_at(a, b, depth + 1);
        }
    }
    Ok(x.len().cmp(&y.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(values_equal(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(values_equal(&Value::Bool(true), &Value::Int(1)).unwrap());
        assert!(!values_equal(&Value::Int(1), &Value::str("1")).unwrap());
    }

    #[test]
    fn dict_keys_unify_equal_numbers() {
        let mut dict = Dict::new();
        dict.insert(Value::Int(1), Value::str("a")).unwrap();
        dict.insert(Value::Float(1.0), Value::str("b")).unwrap();
        assert_eq!(dict.len(), 1);
        assert!(matches!(dict.keys()[0], Value::Int(1)));
    }

    #[test]
    fn lists_are_unhashable() {
        let err = Key::from_value(&Value::list(vec![])).unwrap_err();
        assert_eq!(err.message, "unhashable type: 'list'");
    }

    #[test]
    fn range_length_and_membership() {
        let r = RangeValue { start: 0, stop: 10, step: 3 };
        assert_eq!(r.len().unwrap(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));
        let down = RangeValue { start: 5, stop: 0, step: -2 };
        assert_eq!(down.len().unwrap(), 3);
        assert!(down.contains(1));
    }

    #[test]
    fn full_width_ranges_index_without_overflow() {
        let full = RangeValue { start: i64::MIN, stop: i64::MAX, step: 1 };
        assert_eq!(full.count(), u64::MAX);
        assert_eq!(full.len().unwrap_err().kind, ErrorKind::Overflow);
        assert_eq!(full.at(5), Some(i64::MIN + 5));
        assert_eq!(full.at(-1), Some(i64::MAX - 1));

        let sparse = RangeValue { start: i64::MIN, stop: i64::MAX, step: 1 << 62 };
        assert_eq!(sparse.count(), 4);
        assert_eq!(sparse.at(3), Some(1 << 62));
        assert_eq!(sparse.at(4), None);
    }

    #[test]
    fn sequences_compare_lexicographically() {
        use std::cmp::Ordering;
        let a = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::tuple(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(compare_values(&a, &b).unwrap(), Ordering::Less);
        assert!(compare_values(&Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn self_containing_list_comparison_is_bounded() {
        let outer = Value::list(vec![]);
        let inner = Value::list(vec![]);
        if let (Value::List(o), Value::List(i)) = (&outer, &inner) {
            o.borrow_mut().push(inner.clone());
            i.borrow_mut().push(outer.clone());
        }
        let err = values_equal(&outer, &inner).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Recursion);
    }
}
