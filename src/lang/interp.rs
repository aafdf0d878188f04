//! Tree-walking evaluator.
//!
//! One `Interpreter` owns the module namespace of a submission. The source
//! runs once through [`Interpreter::run_program`]; each test expression is
//! then evaluated against the same namespace with
//! [`Interpreter::evaluate`]. Every statement, loop iteration and call ticks
//! the [`Meter`], so runaway programs surface as `Timeout` errors even before
//! the kernel limits fire.

use crate::capability::{CapabilitySet, Resolution};
use crate::config::types::{ResourceBudget, SandboxConfig};
use crate::lang::ast::{
    Arg, BinOp, Block, BoolOp, CmpOp, CompClause, CompKind, Expr, FPart, FunctionDef, Stmt,
    StmtKind,
};
use crate::lang::builtins;
use crate::lang::error::{ErrorKind, ScriptError, ScriptResult};
use crate::lang::format::{format_with_spec, repr, to_str};
use crate::lang::meter::Meter;
use crate::lang::methods;
use crate::lang::ops::{self, normalize_index, slice_indices, slice_span};
use crate::lang::parser::{parse_expression, parse_program};
use crate::lang::snapshot::Snapshot;
use crate::lang::value::{
    compare_values, values_equal, BoundMethod, Dict, Function, Generator, GeneratorBody, Set,
    Value,
};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Interpreter ceilings that do not depend on the phase budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub max_recursion_depth: usize,
    pub max_nesting_depth: usize,
    pub output_limit_bytes: usize,
}

impl Limits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            max_recursion_depth: config.max_recursion_depth,
            max_nesting_depth: config.max_nesting_depth,
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// A variable namespace. Function calls and comprehensions get a child of
/// the scope they were defined in.
#[derive(Debug, Default)]
pub struct Scope {
    pub(super) vars: RefCell<HashMap<String, Value>>,
    pub(super) globals: RefCell<HashSet<String>>,
    pub(super) parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn module() -> Rc<Scope> {
        Rc::new(Scope::default())
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            parent: Some(parent.clone()),
            ..Scope::default()
        })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        self.parent.as_ref()?.get(name)
    }

    fn root(self: &Rc<Self>) -> Rc<Scope> {
        let mut scope = self.clone();
        while let Some(parent) = scope.parent.clone() {
            scope = parent;
        }
        scope
    }

    fn is_global(&self, name: &str) -> bool {
        self.parent.is_some() && self.globals.borrow().contains(name)
    }

    pub fn set(self: &Rc<Self>, name: &str, value: Value) {
        if self.is_global(name) {
            self.root().vars.borrow_mut().insert(name.to_string(), value);
        } else {
            self.vars.borrow_mut().insert(name.to_string(), value);
        }
    }

    fn delete(self: &Rc<Self>, name: &str) -> bool {
        let target = if self.is_global(name) {
            self.root()
        } else {
            self.clone()
        };
        let removed = target.vars.borrow_mut().remove(name);
        removed.is_some()
    }

    fn declare_global(&self, name: &str) {
        self.globals.borrow_mut().insert(name.to_string());
    }
}

/// Non-local exits threaded through statement execution.
#[derive(Debug)]
enum Flow {
    Error(ScriptError),
    Return(Value),
    Break,
    Continue,
}

impl From<ScriptError> for Flow {
    fn from(err: ScriptError) -> Self {
        Flow::Error(err)
    }
}

type Exec = Result<(), Flow>;

/// Iteration over a value without materialising ranges.
pub enum ValueIter {
    Range {
        next: i64,
        step: i64,
        remaining: u64,
    },
    /// Lists are read by position so appends during a loop are observed.
    Shared {
        items: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    Owned(std::vec::IntoIter<Value>),
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::Range {
                next,
                step,
                remaining,
            } => {
                if *remaining == 0 {
                    return None;
                }
                let value = *next;
                *next = next.wrapping_add(*step);
                *remaining -= 1;
                Some(Value::Int(value))
            }
            ValueIter::Shared { items, index } => {
                let item = items.borrow().get(*index).cloned();
                *index += 1;
                item
            }
            ValueIter::Owned(items) => items.next(),
        }
    }
}

/// Generators are driven by [`Interpreter::for_each`] instead.
fn iterate(value: &Value) -> ScriptResult<ValueIter> {
    Ok(match value {
        Value::Range(r) => ValueIter::Range {
            next: r.start,
            step: r.step,
            remaining: r.count(),
        },
        Value::List(items) => ValueIter::Shared {
            items: items.clone(),
            index: 0,
        },
        Value::Tuple(items) => ValueIter::Owned(items.as_ref().clone().into_iter()),
        Value::Str(s) => ValueIter::Owned(
            s.chars()
                .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
                .collect::<Vec<_>>()
                .into_iter(),
        ),
        Value::Dict(d) => ValueIter::Owned(d.borrow().keys().into_iter()),
        Value::Set(s) => ValueIter::Owned(s.borrow().values().into_iter()),
        other => {
            return Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            )))
        }
    })
}

#[derive(Default)]
struct Collected {
    items: Vec<Value>,
    pairs: Dict,
}

pub struct Interpreter {
    globals: Rc<Scope>,
    capabilities: CapabilitySet,
    limits: Limits,
    pub(crate) meter: Meter,
    output: String,
    depth: usize,
    handling: Vec<Rc<ScriptError>>,
}

impl Interpreter {
    pub fn new(capabilities: CapabilitySet, limits: Limits) -> Self {
        Self {
            globals: Scope::module(),
            capabilities,
            limits,
            meter: Meter::unlimited(),
            output: String::new(),
            depth: 0,
            handling: Vec::new(),
        }
    }

    /// Execute a whole program in the module namespace.
    pub fn run_program(&mut self, source: &str, budget: &ResourceBudget) -> ScriptResult<()> {
        self.meter = Meter::start(budget);
        self.depth = 0;
        let program = parse_program(source, self.limits.max_nesting_depth)?;
        let globals = self.globals.clone();
        match self.exec_block(&program, &globals) {
            Ok(()) => Ok(()),
            Err(Flow::Error(err)) => Err(err),
            Err(Flow::Return(_)) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "'return' outside function",
            )),
            Err(Flow::Break) | Err(Flow::Continue) => {
                Err(ScriptError::new(ErrorKind::Syntax, "'break' outside loop"))
            }
        }
    }

    /// Evaluate one expression against the module namespace.
    pub fn evaluate(&mut self, expression: &str, budget: &ResourceBudget) -> ScriptResult<Value> {
        self.meter = Meter::start(budget);
        self.depth = 0;
        self.handling.clear();
        let expr = parse_expression(expression, self.limits.max_nesting_depth)?;
        let globals = self.globals.clone();
        self.eval(&expr, &globals)
    }

    /// Copy the module namespace as it stands now.
    pub fn snapshot(&self) -> ScriptResult<Snapshot> {
        Snapshot::take(&self.globals)
    }

    /// Put a fresh copy of `snapshot` back as the module namespace.
    pub fn restore(&mut self, snapshot: &Snapshot) -> ScriptResult<()> {
        snapshot.restore(&self.globals)
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub(crate) fn write_output(&mut self, text: &str) -> ScriptResult<()> {
        if self.output.len() + text.len() > self.limits.output_limit_bytes {
            return Err(ScriptError::new(
                ErrorKind::OutputLimit,
                format!(
                    "output limit of {} bytes exceeded",
                    self.limits.output_limit_bytes
                ),
            ));
        }
        self.output.push_str(text);
        Ok(())
    }

    fn exec_block(&mut self, block: &[Stmt], scope: &Rc<Scope>) -> Exec {
        for stmt in block {
            self.exec_stmt(stmt, scope)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Exec {
        let line = stmt.line;
        self.meter
            .tick()
            .map_err(|err| Flow::Error(err.at_line(line)))?;
        self.exec_kind(&stmt.kind, scope).map_err(|flow| match flow {
            Flow::Error(err) => Flow::Error(err.at_line(line)),
            other => other,
        })
    }

    fn exec_kind(&mut self, kind: &StmtKind, scope: &Rc<Scope>) -> Exec {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, scope)?,
            StmtKind::AnnAssign { target, value } => {
                if let Some(value) = value {
                    let value = self.eval(value, scope)?;
                    self.assign(target, value, scope)?;
                }
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                if let Some(orelse) = orelse {
                    return self.exec_block(orelse, scope);
                }
            }
            StmtKind::While { test, body, orelse } => {
                while self.eval(test, scope)?.truthy() {
                    self.meter.tick()?;
                    match self.exec_block(body, scope) {
                        Ok(()) | Err(Flow::Continue) => {}
                        Err(Flow::Break) => return Ok(()),
                        Err(other) => return Err(other),
                    }
                }
                if let Some(orelse) = orelse {
                    return self.exec_block(orelse, scope);
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter, scope)?;
                let mut exit = None;
                self.for_each(&iterable, &mut |interp, item| {
                    interp.assign(target, item, scope)?;
                    match interp.exec_block(body, scope) {
                        Ok(()) | Err(Flow::Continue) => Ok(true),
                        Err(Flow::Error(err)) => Err(err),
                        Err(flow) => {
                            exit = Some(flow);
                            Ok(false)
                        }
                    }
                })?;
                match exit {
                    Some(Flow::Break) => return Ok(()),
                    Some(flow) => return Err(flow),
                    None => {}
                }
                if let Some(orelse) = orelse {
                    return self.exec_block(orelse, scope);
                }
            }
            StmtKind::Break => return Err(Flow::Break),
            StmtKind::Continue => return Err(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def, scope)?;
                scope.set(&def.name, function);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Err(Flow::Return(value));
            }
            StmtKind::Global(names) => {
                for name in names {
                    scope.declare_global(name);
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
            }
            StmtKind::Assert { test, message } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match message {
                        Some(expr) => to_str(&self.eval(expr, scope)?),
                        None => String::new(),
                    };
                    return Err(ScriptError::new(ErrorKind::Assertion, message).into());
                }
            }
            StmtKind::Raise(expr) => {
                let err = match expr {
                    Some(expr) => {
                        let value = self.eval(expr, scope)?;
                        exception_from(&value)?
                    }
                    None => match self.handling.last() {
                        Some(active) => active.as_ref().clone(),
                        None => ScriptError::new(
                            ErrorKind::Runtime,
                            "No active exception to reraise",
                        ),
                    },
                };
                return Err(Flow::Error(err));
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse.as_ref(), finalbody.as_ref(), scope),
            StmtKind::Import(module) => {
                return Err(ScriptError::withheld(&format!("module '{module}'")).into());
            }
        }
        Ok(())
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[crate::lang::ast::Handler],
        orelse: Option<&Block>,
        finalbody: Option<&Block>,
        scope: &Rc<Scope>,
    ) -> Exec {
        let result = match self.exec_block(body, scope) {
            Err(Flow::Error(err)) if err.kind.is_catchable() && !handlers.is_empty() => {
                self.handle(err, handlers, scope)
            }
            Ok(()) => match orelse {
                Some(orelse) => self.exec_block(orelse, scope),
                None => Ok(()),
            },
            other => other,
        };
        let Some(finalbody) = finalbody else {
            return result;
        };
        if let Err(Flow::Error(err)) = &result {
            if !err.kind.is_catchable() {
                return result;
            }
        }
        self.exec_block(finalbody, scope)?;
        result
    }

    fn handle(
        &mut self,
        err: ScriptError,
        handlers: &[crate::lang::ast::Handler],
        scope: &Rc<Scope>,
    ) -> Exec {
        for handler in handlers {
            let matched = match &handler.matches {
                None => true,
                Some(expr) => {
                    let class = self
                        .eval(expr, scope)
                        .map_err(|e| Flow::Error(e.at_line(handler.line)))?;
                    exception_matches(&class, err.kind)?
                }
            };
            if !matched {
                continue;
            }
            let active = Rc::new(err);
            if let Some(name) = &handler.name {
                scope.set(name, Value::Exception(active.clone()));
            }
            self.handling.push(active);
            let outcome = self.exec_block(&handler.body, scope);
            self.handling.pop();
            return outcome;
        }
        Err(Flow::Error(err))
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>, scope: &Rc<Scope>) -> ScriptResult<Value> {
        let mut defaults = Vec::new();
        for param in &def.params {
            if let Some(default) = &param.default {
                defaults.push(self.eval(default, scope)?);
            }
        }
        Ok(Value::Function(Rc::new(Function {
            def: def.clone(),
            defaults,
            closure: scope.clone(),
        })))
    }

    fn assign(&mut self, target: &Expr, value: Value, scope: &Rc<Scope>) -> ScriptResult<()> {
        match target {
            Expr::Name(name) => {
                scope.set(name, value);
                Ok(())
            }
            Expr::Tuple(targets) | Expr::List(targets) => self.unpack(targets, value, scope),
            Expr::Subscript { value: container, index } => {
                let container = self.eval(container, scope)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.eval_slice(lower, upper, step, scope)?;
                    return self.set_slice(&container, lower, upper, step, value);
                }
                let index = self.eval(index, scope)?;
                self.set_item(&container, index, value)
            }
            Expr::Attribute { value: object, name } => {
                let object = self.eval(object, scope)?;
                Err(ScriptError::new(
                    ErrorKind::Attribute,
                    format!(
                        "'{}' object attribute '{name}' is read-only",
                        object.type_name()
                    ),
                ))
            }
            Expr::Starred(_) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "starred assignment target must be in a list or tuple",
            )),
            _ => Err(ScriptError::new(ErrorKind::Syntax, "cannot assign to expression")),
        }
    }

    fn unpack(&mut self, targets: &[Expr], value: Value, scope: &Rc<Scope>) -> ScriptResult<()> {
        let values = self.collect(&value)?;
        let star = targets.iter().position(|t| matches!(t, Expr::Starred(_)));
        match star {
            None => {
                if values.len() < targets.len() {
                    return Err(ScriptError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        values.len()
                    )));
                }
                if values.len() > targets.len() {
                    return Err(ScriptError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, value) in targets.iter().zip(values) {
                    self.assign(target, value, scope)?;
                }
                Ok(())
            }
            Some(star) => {
                let after = targets.len() - star - 1;
                if values.len() < targets.len() - 1 {
                    return Err(ScriptError::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        targets.len() - 1,
                        values.len()
                    )));
                }
                let mut values = values;
                let tail = values.split_off(values.len() - after);
                let middle = values.split_off(star);
                for (target, value) in targets[..star].iter().zip(values) {
                    self.assign(target, value, scope)?;
                }
                if let Expr::Starred(inner) = &targets[star] {
                    self.assign(inner, Value::list(middle), scope)?;
                }
                for (target, value) in targets[star + 1..].iter().zip(tail) {
                    self.assign(target, value, scope)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr, scope: &Rc<Scope>) -> ScriptResult<()> {
        match target {
            Expr::Name(name) => {
                let current = self.lookup(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.augmented(op, current, rhs)?;
                scope.set(name, updated);
                Ok(())
            }
            Expr::Subscript { value: container, index } if !matches!(index.as_ref(), Expr::Slice { .. }) => {
                let container = self.eval(container, scope)?;
                let index = self.eval(index, scope)?;
                let current = self.get_item(&container, &index)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.augmented(op, current, rhs)?;
                self.set_item(&container, index, updated)
            }
            Expr::Attribute { .. } => self.assign(target, Value::None, scope),
            _ => Err(ScriptError::new(
                ErrorKind::Syntax,
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `+=` extends lists in place; everything else rebinds.
    fn augmented(&mut self, op: BinOp, current: Value, rhs: Value) -> ScriptResult<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.collect(&rhs)?;
            self.meter.guard_slots(items.borrow().len() + extra.len())?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        ops::binary(op, &current, &rhs, &self.meter)
    }

    fn delete(&mut self, target: &Expr, scope: &Rc<Scope>) -> ScriptResult<()> {
        match target {
            Expr::Name(name) => {
                if scope.delete(name) {
                    Ok(())
                } else {
                    Err(ScriptError::undefined_name(name))
                }
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.delete(item, scope)?;
                }
                Ok(())
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, scope)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.eval_slice(lower, upper, step, scope)?;
                    return self.del_slice(&container, lower, upper, step);
                }
                let index = self.eval(index, scope)?;
                self.del_item(&container, &index)
            }
            _ => Err(ScriptError::new(ErrorKind::Syntax, "cannot delete expression")),
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> ScriptResult<Value> {
        match expr {
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::FString(parts) => self.eval_fstring(parts, scope),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Ellipsis => Ok(Value::Ellipsis),
            Expr::Name(name) => self.lookup(name, scope),
            Expr::List(items) => Ok(Value::list(self.eval_items(items, scope)?)),
            Expr::Tuple(items) => Ok(Value::tuple(self.eval_items(items, scope)?)),
            Expr::Set(items) => {
                let items = self.eval_items(items, scope)?;
                Ok(Value::set(Set::from_values(items)?))
            }
            Expr::Dict(pairs) => {
                let mut dict = Dict::new();
                for (key, value) in pairs {
                    let key = self.eval(key, scope)?;
                    let value = self.eval(value, scope)?;
                    dict.insert(key, value)?;
                }
                Ok(Value::dict(dict))
            }
            Expr::Starred(_) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "can't use starred expression here",
            )),
            Expr::Unary { op, operand } => {
                let operand = self.eval(operand, scope)?;
                ops::unary(*op, &operand)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                ops::binary(*op, &left, &right, &self.meter)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, scope)?;
                match op {
                    BoolOp::And if !left.truthy() => Ok(left),
                    BoolOp::Or if left.truthy() => Ok(left),
                    _ => self.eval(right, scope),
                }
            }
            Expr::Compare { left, ops: chain } => {
                let mut current = self.eval(left, scope)?;
                for (op, right) in chain {
                    let right = self.eval(right, scope)?;
                    let holds = match (op, &right) {
                        (CmpOp::In | CmpOp::NotIn, Value::Generator(_)) => {
                            self.yields(&right, &current)? == (*op == CmpOp::In)
                        }
                        _ => ops::compare(*op, &current, &right)?,
                    };
                    if !holds {
                        return Ok(Value::Bool(false));
                    }
                    current = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            Expr::Call { func, args } => {
                let callee = self.eval(func, scope)?;
                let (positional, keywords) = self.eval_args(args, scope)?;
                self.call_value(&callee, positional, keywords)
            }
            Expr::Attribute { value, name } => {
                let receiver = self.eval(value, scope)?;
                attribute(receiver, name)
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value, scope)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.eval_slice(lower, upper, step, scope)?;
                    return self.get_slice(&container, lower, upper, step);
                }
                let index = self.eval(index, scope)?;
                self.get_item(&container, &index)
            }
            Expr::Slice { .. } => Err(ScriptError::new(
                ErrorKind::Syntax,
                "slice is only valid inside a subscript",
            )),
            Expr::Lambda(def) => self.make_function(def, scope),
            Expr::Comprehension {
                kind: CompKind::Generator,
                element,
                clauses,
                ..
            } => self.make_generator(element, clauses, scope),
            Expr::Comprehension {
                kind,
                element,
                value,
                clauses,
            } => {
                let inner = Scope::child(scope);
                let value = value.as_deref();
                let mut out = Collected::default();
                self.comprehend(clauses, None, &inner, &mut |interp, scope| {
                    let item = interp.eval(element, scope)?;
                    match value {
                        Some(value) => {
                            let value = interp.eval(value, scope)?;
                            out.pairs.insert(item, value)?;
                        }
                        None => out.items.push(item),
                    }
                    interp.meter.guard_slots(out.items.len() + out.pairs.len())?;
                    Ok(true)
                })?;
                Ok(match kind {
                    CompKind::Set => Value::set(Set::from_values(out.items)?),
                    CompKind::Dict => Value::dict(out.pairs),
                    CompKind::List | CompKind::Generator => Value::list(out.items),
                })
            }
        }
    }

    fn lookup(&self, name: &str, scope: &Rc<Scope>) -> ScriptResult<Value> {
        if let Some(value) = scope.get(name) {
            return Ok(value);
        }
        match self.capabilities.resolve(name) {
            Resolution::Granted(capability) => Ok(Value::Builtin(capability)),
            Resolution::Withheld => Err(ScriptError::withheld(&format!("name '{name}'"))),
            Resolution::NotGranted(_) | Resolution::Unknown => ErrorKind::from_python_name(name)
                .map(Value::ExceptionType)
                .ok_or_else(|| ScriptError::undefined_name(name)),
        }
    }

    fn eval_items(&mut self, items: &[Expr], scope: &Rc<Scope>) -> ScriptResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Starred(inner) => {
                    let value = self.eval(inner, scope)?;
                    out.extend(self.collect(&value)?);
                }
                other => out.push(self.eval(other, scope)?),
            }
        }
        Ok(out)
    }

    fn eval_args(
        &mut self,
        args: &[Arg],
        scope: &Rc<Scope>,
    ) -> ScriptResult<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => positional.push(self.eval(expr, scope)?),
                Arg::Star(expr) => {
                    let value = self.eval(expr, scope)?;
                    positional.extend(self.collect(&value)?);
                }
                Arg::Keyword(name, expr) => {
                    if keywords.iter().any(|(k, _)| k == name) {
                        return Err(ScriptError::new(
                            ErrorKind::Syntax,
                            format!("keyword argument repeated: {name}"),
                        ));
                    }
                    let value = self.eval(expr, scope)?;
                    keywords.push((name.clone(), value));
                }
            }
        }
        Ok((positional, keywords))
    }

    fn eval_slice(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
        scope: &Rc<Scope>,
    ) -> ScriptResult<(Option<i64>, Option<i64>, Option<i64>)> {
        let mut bound = |expr: &Option<Box<Expr>>| -> ScriptResult<Option<i64>> {
            let Some(expr) = expr else {
                return Ok(None);
            };
            match self.eval(expr, scope)? {
                Value::None => Ok(None),
                value => value.as_int().map(Some).ok_or_else(|| {
                    ScriptError::type_error(
                        "slice indices must be integers or None or have an __index__ method",
                    )
                }),
            }
        };
        Ok((bound(lower)?, bound(upper)?, bound(step)?))
    }

    fn eval_fstring(&mut self, parts: &[FPart], scope: &Rc<Scope>) -> ScriptResult<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FPart::Literal(text) => out.push_str(text),
                FPart::Field {
                    expr,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr, scope)?;
                    let value = match conversion {
                        Some('r') | Some('a') => Value::str(repr(&value)),
                        Some(_) => Value::str(to_str(&value)),
                        None => value,
                    };
                    if spec.is_empty() {
                        out.push_str(&to_str(&value));
                    } else {
                        out.push_str(&format_with_spec(&value, spec)?);
                    }
                }
            }
            self.meter.guard_bytes(out.len() as u64)?;
        }
        Ok(Value::str(out))
    }

    /// Run comprehension `clauses` in `scope`, calling `leaf` for every
    /// binding that passes the conditions. `first` stands in for the first
    /// clause's iterable when it was evaluated already. Returns `false`
    /// once `leaf` has asked to stop.
    fn comprehend(
        &mut self,
        clauses: &[CompClause],
        first: Option<Value>,
        scope: &Rc<Scope>,
        leaf: &mut dyn FnMut(&mut Self, &Rc<Scope>) -> ScriptResult<bool>,
    ) -> ScriptResult<bool> {
        let Some((clause, rest)) = clauses.split_first() else {
            return leaf(self, scope);
        };
        let iterable = match first {
            Some(value) => value,
            None => self.eval(&clause.iter, scope)?,
        };
        let mut going = true;
        self.for_each(&iterable, &mut |interp, item| {
            interp.assign(&clause.target, item, scope)?;
            for condition in &clause.conditions {
                if !interp.eval(condition, scope)?.truthy() {
                    return Ok(true);
                }
            }
            going = interp.comprehend(rest, None, scope, leaf)?;
            Ok(going)
        })?;
        Ok(going)
    }

    fn make_generator(
        &mut self,
        element: &Expr,
        clauses: &[CompClause],
        scope: &Rc<Scope>,
    ) -> ScriptResult<Value> {
        let Some(clause) = clauses.first() else {
            return Err(ScriptError::new(
                ErrorKind::Syntax,
                "generator expression needs a 'for' clause",
            ));
        };
        let first = self.eval(&clause.iter, scope)?;
        if !is_iterable(&first) {
            return Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                first.type_name()
            )));
        }
        Ok(Value::Generator(Rc::new(Generator {
            body: Rc::new(GeneratorBody {
                element: element.clone(),
                clauses: clauses.to_vec(),
            }),
            first,
            scope: Scope::child(scope),
            exhausted: Cell::new(false),
        })))
    }

    /// Feed each element of `value` to `visit` until it returns `false`.
    /// Generators run here, one element at a time, and only once.
    pub(crate) fn for_each(
        &mut self,
        value: &Value,
        visit: &mut dyn FnMut(&mut Self, Value) -> ScriptResult<bool>,
    ) -> ScriptResult<()> {
        if let Value::Generator(generator) = value {
            if generator.exhausted.replace(true) {
                return Ok(());
            }
            let body = generator.body.clone();
            let scope = generator.scope.clone();
            self.comprehend(
                &body.clauses,
                Some(generator.first.clone()),
                &scope,
                &mut |interp, scope| {
                    let item = interp.eval(&body.element, scope)?;
                    visit(interp, item)
                },
            )?;
            return Ok(());
        }
        for item in iterate(value)? {
            self.meter.tick()?;
            if !visit(self, item)? {
                break;
            }
        }
        Ok(())
    }

    /// `needle in generator`, consuming it up to the first match.
    fn yields(&mut self, generator: &Value, needle: &Value) -> ScriptResult<bool> {
        let mut found = false;
        self.for_each(generator, &mut |_, item| {
            found = item.identical(needle) || values_equal(&item, needle)?;
            Ok(!found)
        })?;
        Ok(found)
    }

    /// Call any callable value.
    pub(crate) fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        match callee {
            Value::Function(function) => self.call_function(function, args, kwargs),
            Value::Builtin(capability) => builtins::call(self, *capability, args, kwargs),
            Value::Method(method) => methods::call(self, &method.receiver, method.name, args, kwargs),
            Value::ExceptionType(kind) => {
                if !kwargs.is_empty() {
                    return Err(ScriptError::type_error(format!(
                        "{}() takes no keyword arguments",
                        kind.python_name()
                    )));
                }
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] => to_str(single),
                    _ => repr(&Value::tuple(args)),
                };
                Ok(Value::Exception(Rc::new(ScriptError::new(*kind, message))))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ScriptResult<Value> {
        if self.depth >= self.limits.max_recursion_depth {
            return Err(ScriptError::new(
                ErrorKind::Recursion,
                "maximum recursion depth exceeded",
            ));
        }
        self.meter.tick()?;
        let local = Scope::child(&function.closure);
        bind_arguments(function, args, kwargs, &local)?;
        self.depth += 1;
        let result = self.exec_block(&function.def.body, &local);
        self.depth -= 1;
        match result {
            Ok(()) => Ok(Value::None),
            Err(Flow::Return(value)) => Ok(value),
            Err(Flow::Error(err)) => Err(err),
            Err(Flow::Break) | Err(Flow::Continue) => Err(ScriptError::new(
                ErrorKind::Syntax,
                "'break' outside loop",
            )),
        }
    }

    /// Materialise an iterable, charging the meter per element.
    pub(crate) fn collect(&mut self, value: &Value) -> ScriptResult<Vec<Value>> {
        match value {
            Value::List(items) => return Ok(items.borrow().clone()),
            Value::Tuple(items) => return Ok(items.as_ref().clone()),
            Value::Range(r) => self.meter.guard_slots(slots(r.count()))?,
            _ => {}
        }
        let mut out = Vec::new();
        self.for_each(value, &mut |interp, item| {
            out.push(item);
            interp.meter.guard_slots(out.len())?;
            Ok(true)
        })?;
        Ok(out)
    }

    /// Stable sort with an optional key function.
    pub(crate) fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<&Value>,
        reverse: bool,
    ) -> ScriptResult<Vec<Value>> {
        let keys = match key {
            Some(key) if !matches!(key, Value::None) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in &items {
                    keys.push(self.call_value(key, vec![item.clone()], Vec::new())?);
                }
                keys
            }
            _ => items.clone(),
        };
        let mut order: Vec<usize> = (0..items.len()).collect();
        merge_sort(&mut order, |a, b| {
            let ordering = compare_values(&keys[a], &keys[b])?;
            Ok(if reverse { ordering.reverse() } else { ordering })
        })?;
        Ok(order.into_iter().map(|i| items[i].clone()).collect())
    }

    pub(crate) fn get_item(&mut self, container: &Value, index: &Value) -> ScriptResult<Value> {
        match container {
            Value::List(items) => {
                let i = index.expect_index("list")?;
                let items = items.borrow();
                normalize_index(i, items.len())
                    .map(|pos| items[pos].clone())
                    .ok_or_else(|| index_error("list index out of range"))
            }
            Value::Tuple(items) => {
                let i = index.expect_index("tuple")?;
                normalize_index(i, items.len())
                    .map(|pos| items[pos].clone())
                    .ok_or_else(|| index_error("tuple index out of range"))
            }
            Value::Str(s) => {
                let i = index.expect_index("string")?;
                let count = s.chars().count();
                normalize_index(i, count)
                    .and_then(|pos| s.chars().nth(pos))
                    .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
                    .ok_or_else(|| index_error("string index out of range"))
            }
            Value::Range(r) => {
                let i = index.expect_index("range object")?;
                r.at(i)
                    .map(Value::Int)
                    .ok_or_else(|| index_error("range object index out of range"))
            }
            Value::Dict(dict) => {
                let found = dict.borrow().get(index)?;
                found.ok_or_else(|| ScriptError::new(ErrorKind::Key, repr(index)))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn get_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> ScriptResult<Value> {
        match container {
            Value::List(items) => {
                let items = items.borrow().clone();
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Tuple(items) => {
                let picked = slice_indices(items.len(), lower, upper, step)?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = slice_indices(chars.len(), lower, upper, step)?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range(r) => {
                let span = slice_span(r.count(), lower, upper, step)?;
                self.meter.guard_slots(slots(span.count))?;
                Ok(Value::list(
                    (0..span.count)
                        .map(|k| Value::Int(r.get(span.position(k) as u64)))
                        .collect(),
                ))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn set_item(&mut self, container: &Value, index: Value, value: Value) -> ScriptResult<()> {
        match container {
            Value::List(items) => {
                let i = index.expect_index("list")?;
                let len = items.borrow().len();
                let pos = normalize_index(i, len)
                    .ok_or_else(|| index_error("list assignment index out of range"))?;
                items.borrow_mut()[pos] = value;
                Ok(())
            }
            Value::Dict(dict) => dict.borrow_mut().insert(index, value),
            other => Err(ScriptError::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn set_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
        value: Value,
    ) -> ScriptResult<()> {
        let Value::List(items) = container else {
            return Err(ScriptError::type_error(format!(
                "'{}' object does not support item assignment",
                container.type_name()
            )));
        };
        let replacement = self.collect(&value)?;
        let len = items.borrow().len();
        if step.unwrap_or(1) == 1 {
            let clamp = |bound: i64| {
                let b = if bound < 0 { bound + len as i64 } else { bound };
                b.clamp(0, len as i64) as usize
            };
            let start = lower.map_or(0, clamp);
            let stop = upper.map_or(len, clamp).max(start);
            self.meter
                .guard_slots(len - (stop - start) + replacement.len())?;
            items.borrow_mut().splice(start..stop, replacement);
            return Ok(());
        }
        let picked = slice_indices(len, lower, upper, step)?;
        if picked.len() != replacement.len() {
            return Err(ScriptError::value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                picked.len()
            )));
        }
        let mut items = items.borrow_mut();
        for (pos, value) in picked.into_iter().zip(replacement) {
            items[pos] = value;
        }
        Ok(())
    }

    fn del_item(&mut self, container: &Value, index: &Value) -> ScriptResult<()> {
        match container {
            Value::List(items) => {
                let i = index.expect_index("list")?;
                let len = items.borrow().len();
                let pos = normalize_index(i, len)
                    .ok_or_else(|| index_error("list assignment index out of range"))?;
                items.borrow_mut().remove(pos);
                Ok(())
            }
            Value::Dict(dict) => {
                let removed = dict.borrow_mut().remove(index)?;
                removed
                    .map(|_| ())
                    .ok_or_else(|| ScriptError::new(ErrorKind::Key, repr(index)))
            }
            other => Err(ScriptError::type_error(format!(
                "'{}' object does not support item deletion",
                other.type_name()
            ))),
        }
    }

    fn del_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> ScriptResult<()> {
        let Value::List(items) = container else {
            return Err(ScriptError::type_error(format!(
                "'{}' object does not support item deletion",
                container.type_name()
            )));
        };
        let len = items.borrow().len();
        let mut picked = slice_indices(len, lower, upper, step)?;
        picked.sort_unstable();
        let mut items = items.borrow_mut();
        for pos in picked.into_iter().rev() {
            items.remove(pos);
        }
        Ok(())
    }
}

fn is_iterable(value: &Value) -> bool {
    matches!(
        value,
        Value::Range(_)
            | Value::List(_)
            | Value::Tuple(_)
            | Value::Str(_)
            | Value::Dict(_)
            | Value::Set(_)
            | Value::Generator(_)
    )
}

/// Slot count for a meter guard; counts past `usize` can never fit.
fn slots(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

fn index_error(message: &str) -> ScriptError {
    ScriptError::new(ErrorKind::Index, message)
}

fn attribute(receiver: Value, name: &str) -> ScriptResult<Value> {
    if name.starts_with("__") {
        return Err(ScriptError::withheld(&format!("attribute '{name}'")));
    }
    if let Some(method) = methods::lookup(&receiver, name) {
        return Ok(Value::Method(Rc::new(BoundMethod {
            receiver,
            name: method,
        })));
    }
    if let (Value::Exception(err), "args") = (&receiver, name) {
        let args = if err.message.is_empty() {
            Vec::new()
        } else {
            vec![Value::str(&err.message)]
        };
        return Ok(Value::tuple(args));
    }
    Err(ScriptError::new(
        ErrorKind::Attribute,
        format!(
            "'{}' object has no attribute '{name}'",
            receiver.type_name()
        ),
    ))
}

fn exception_from(value: &Value) -> ScriptResult<ScriptError> {
    match value {
        Value::ExceptionType(kind) => Ok(ScriptError::new(*kind, "")),
        Value::Exception(err) => Ok(ScriptError {
            line: None,
            ..err.as_ref().clone()
        }),
        _ => Err(ScriptError::type_error(
            "exceptions must derive from BaseException",
        )),
    }
}

fn exception_matches(class: &Value, raised: ErrorKind) -> ScriptResult<bool> {
    match class {
        Value::ExceptionType(kind) => Ok(kind.handles(raised)),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if exception_matches(class, raised)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(ScriptError::type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
    local: &Rc<Scope>,
) -> ScriptResult<()> {
    let params = &function.def.params;
    let name = &function.def.name;
    if args.len() > params.len() {
        return Err(ScriptError::type_error(format!(
            "{name}() takes {} positional argument{} but {} {} given",
            params.len(),
            plural(params.len()),
            args.len(),
            if args.len() == 1 { "was" } else { "were" }
        )));
    }
    let mut slots: Vec<Option<Value>> = vec![None; params.len()];
    for (slot, value) in slots.iter_mut().zip(args) {
        *slot = Some(value);
    }
    for (key, value) in kwargs {
        let Some(pos) = params.iter().position(|p| p.name == key) else {
            return Err(ScriptError::type_error(format!(
                "{name}() got an unexpected keyword argument '{key}'"
            )));
        };
        if slots[pos].is_some() {
            return Err(ScriptError::type_error(format!(
                "{name}() got multiple values for argument '{key}'"
            )));
        }
        slots[pos] = Some(value);
    }
    let first_default = params.len() - function.defaults.len();
    let mut missing = Vec::new();
    for (i, (param, slot)) in params.iter().zip(slots).enumerate() {
        let value = match slot {
            Some(value) => value,
            None if i >= first_default => function.defaults[i - first_default].clone(),
            None => {
                missing.push(format!("'{}'", param.name));
                continue;
            }
        };
        local.vars.borrow_mut().insert(param.name.clone(), value);
    }
    if missing.is_empty() {
        return Ok(());
    }
    let listed = match missing.as_slice() {
        [one] => one.clone(),
        [init @ .., last] if init.len() == 1 => format!("{} and {last}", init[0]),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
        [] => String::new(),
    };
    Err(ScriptError::type_error(format!(
        "{name}() missing {} required positional argument{}: {listed}",
        missing.len(),
        plural(missing.len())
    )))
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Bottom-up merge sort over positions with a fallible comparator.
fn merge_sort<F>(order: &mut Vec<usize>, mut cmp: F) -> ScriptResult<()>
where
    F: FnMut(usize, usize) -> ScriptResult<Ordering>,
{
    let n = order.len();
    let mut buffer = order.clone();
    let mut width = 1;
    while width < n {
        let mut start = 0;
        while start < n {
            let mid = (start + width).min(n);
            let end = (start + 2 * width).min(n);
            let (mut left, mut right, mut out) = (start, mid, start);
            while left < mid && right < end {
                if cmp(order[right], order[left])? == Ordering::Less {
                    buffer[out] = order[right];
                    right += 1;
                } else {
                    buffer[out] = order[left];
                    left += 1;
                }
                out += 1;
            }
            buffer[out..out + (mid - left)].copy_from_slice(&order[left..mid]);
            out += mid - left;
            buffer[out..out + (end - right)].copy_from_slice(&order[right..end]);
            start += 2 * width;
        }
        std::mem::swap(order, &mut buffer);
        width *= 2;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::format::repr;

    fn budget() -> ResourceBudget {
        ResourceBudget {
            cpu_time_limit_ms: 5_000,
            wall_time_limit_ms: 10_000,
            memory_limit_bytes: 256 * 1024 * 1024,
        }
    }

    /// Run on a thread with a roomy stack; debug builds use large frames.
    fn with_stack<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        std::thread::Builder::new()
            .stack_size(64 * 1024 * 1024)
            .spawn(f)
            .unwrap()
            .join()
            .unwrap()
    }

    /// Run `source`, then return `repr(expression)` and the printed output.
    fn run(source: &str, expression: &str) -> (Result<String, String>, String) {
        let (source, expression) = (source.to_string(), expression.to_string());
        with_stack(move || {
            let mut interp = Interpreter::new(CapabilitySet::standard(), Limits::default());
            if let Err(err) = interp.run_program(&source, &budget()) {
                return (Err(err.describe()), interp.take_output());
            }
            let value = interp
                .evaluate(&expression, &budget())
                .map(|v| repr(&v))
                .map_err(|e| e.describe());
            (value, interp.take_output())
        })
    }

    fn value_of(source: &str, expression: &str) -> String {
        let (value, _) = run(source, expression);
        value.unwrap()
    }

    fn error_of(source: &str) -> String {
        let (value, _) = run(source, "None");
        value.unwrap_err()
    }

    #[test]
    fn functions_and_prints() {
        let (value, out) = run(
            "def add(a, b):\n    return a + b\nprint('hi', 3)\n",
            "add(2, 3)",
        );
        assert_eq!(value.unwrap(), "5");
        assert_eq!(out, "hi 3\n");
    }

    #[test]
    fn closures_see_late_bindings() {
        let src = "def outer():\n    x = 1\n    def inner():\n        return x\n    x = 2\n    return inner\nf = outer()\n";
        assert_eq!(value_of(src, "f()"), "2");
    }

    #[test]
    fn recursion_and_defaults() {
        let src = "def fact(n, acc=1):\n    if n <= 1:\n        return acc\n    return fact(n - 1, acc * n)\n";
        assert_eq!(value_of(src, "fact(10)"), "3628800");
        assert_eq!(value_of(src, "fact(3, acc=2)"), "12");
    }

    #[test]
    fn runaway_recursion_is_a_recursion_error() {
        let err = error_of("def f(n):\n    return f(n + 1)\nf(0)\n");
        assert!(err.starts_with("RecursionError: maximum recursion depth exceeded"), "{err}");
    }

    #[test]
    fn recursion_error_is_catchable() {
        let src = "def f():\n    return f()\ntry:\n    f()\n    r = 'no'\nexcept RecursionError:\n    r = 'caught'\n";
        assert_eq!(value_of(src, "r"), "'caught'");
    }

    #[test]
    fn loops_with_break_continue_else() {
        let src = "total = 0\nfor i in range(10):\n    if i % 2:\n        continue\n    if i > 6:\n        break\n    total += i\nelse:\n    total = -1\nn = 0\nwhile n < 3:\n    n += 1\nelse:\n    n *= 10\n";
        assert_eq!(value_of(src, "(total, n)"), "(12, 30)");
    }

    #[test]
    fn comprehensions() {
        assert_eq!(
            value_of("", "[x * y for x in range(3) for y in range(3) if x != y]"),
            "[0, 0, 0, 2, 0, 2]"
        );
        assert_eq!(value_of("", "{k: len(k) for k in ['a', 'bb']}"), "{'a': 1, 'bb': 2}");
        assert_eq!(value_of("", "sum(x for x in range(5))"), "10");
    }

    #[test]
    fn comprehension_variable_does_not_leak() {
        let (value, _) = run("y = [i for i in range(3)]\n", "i");
        assert_eq!(value.unwrap_err(), "NameError: name 'i' is not defined");
    }

    #[test]
    fn unpacking_and_starred() {
        let src = "a, *rest, z = [1, 2, 3, 4]\n(p, q) = 'xy'\n";
        assert_eq!(value_of(src, "(a, rest, z, p, q)"), "(1, [2, 3], 4, 'x', 'y')");
        let err = error_of("a, b = [1, 2, 3]\n");
        assert_eq!(err, "ValueError: too many values to unpack (expected 2) (line 1)");
    }

    #[test]
    fn try_except_else_finally() {
        let src = "log = []\ntry:\n    1 / 0\nexcept ZeroDivisionError as e:\n    log.append(str(e))\nelse:\n    log.append('else')\nfinally:\n    log.append('finally')\ntry:\n    pass\nexcept Exception:\n    log.append('no')\nelse:\n    log.append('else')\n";
        assert_eq!(value_of(src, "log"), "['division by zero', 'finally', 'else']");
    }

    #[test]
    fn raise_and_reraise() {
        let src = "def check(n):\n    if n < 0:\n        raise ValueError('negative')\n    return n\ntry:\n    check(-1)\nexcept (TypeError, ValueError) as err:\n    msg = repr(err)\n";
        assert_eq!(value_of(src, "msg"), "\"ValueError('negative')\"");
        let err = error_of("try:\n    [][1]\nexcept IndexError:\n    raise\n");
        assert_eq!(err, "IndexError: list index out of range (line 2)");
    }

    #[test]
    fn errors_carry_the_innermost_line() {
        let err = error_of("x = 1\n\ndef f():\n    return 1 / 0\n\nf()\n");
        assert_eq!(err, "ZeroDivisionError: division by zero (line 4)");
    }

    #[test]
    fn withheld_names_and_imports_are_capability_errors() {
        assert_eq!(
            error_of("open('/etc/passwd')\n"),
            "CapabilityError: name 'open' is not available in the sandbox (line 1)"
        );
        assert_eq!(
            error_of("import os\n"),
            "CapabilityError: module 'os' is not available in the sandbox (line 1)"
        );
        assert_eq!(
            error_of("x = ().__class__\n"),
            "CapabilityError: attribute '__class__' is not available in the sandbox (line 1)"
        );
    }

    #[test]
    fn capability_errors_escape_handlers() {
        let err = error_of("try:\n    eval('1')\nexcept Exception:\n    pass\n");
        assert!(err.starts_with("CapabilityError"), "{err}");
    }

    #[test]
    fn minimal_set_hides_other_builtins() {
        let outcome = with_stack(|| {
            let mut interp = Interpreter::new(CapabilitySet::minimal(), Limits::default());
            interp.run_program("x = sorted([2, 1])\n", &budget())
        });
        assert_eq!(
            outcome.unwrap_err().to_string(),
            "NameError: name 'sorted' is not defined"
        );
    }

    #[test]
    fn output_limit_is_enforced() {
        let outcome = with_stack(|| {
            let limits = Limits {
                output_limit_bytes: 64,
                ..Limits::default()
            };
            let mut interp = Interpreter::new(CapabilitySet::standard(), limits);
            let result = interp.run_program("for i in range(100):\n    print(i)\n", &budget());
            (result, interp.output().len())
        });
        let (result, printed) = outcome;
        assert_eq!(result.unwrap_err().kind, ErrorKind::OutputLimit);
        assert!(printed <= 64);
    }

    #[test]
    fn infinite_loop_times_out() {
        let outcome = with_stack(|| {
            let mut interp = Interpreter::new(CapabilitySet::standard(), Limits::default());
            let tight = ResourceBudget {
                cpu_time_limit_ms: 200,
                wall_time_limit_ms: 400,
                memory_limit_bytes: 64 * 1024 * 1024,
            };
            interp.run_program("while True:\n    try:\n        pass\n    except Exception:\n        pass\n", &tight)
        });
        assert_eq!(outcome.unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn huge_allocation_is_a_memory_error() {
        let err = error_of("x = [0] * (10 ** 9)\n");
        assert!(err.starts_with("MemoryError"), "{err}");
        let err = error_of("x = list(range(10 ** 12))\n");
        assert!(err.starts_with("MemoryError"), "{err}");
    }

    #[test]
    fn list_plus_equals_mutates_in_place() {
        let src = "a = [1]\nb = a\na += [2]\nd = {'k': 1}\nd['k'] += 5\n";
        assert_eq!(value_of(src, "(b, d)"), "([1, 2], {'k': 6})");
    }

    #[test]
    fn slicing_assignment_and_deletion() {
        let src = "xs = list(range(6))\nxs[1:3] = ['a']\ndel xs[-1]\nys = [0, 1, 2, 3]\nys[::2] = [9, 9]\ndel ys[:1]\n";
        assert_eq!(value_of(src, "(xs, ys)"), "([0, 'a', 3, 4], [1, 9, 3])");
    }

    #[test]
    fn global_declaration_rebinds_module_name() {
        let src = "count = 0\ndef bump():\n    global count\n    count += 1\nbump()\nbump()\n";
        assert_eq!(value_of(src, "count"), "2");
    }

    #[test]
    fn argument_binding_errors() {
        let src = "def f(a, b):\n    return a\n";
        let (value, _) = run(src, "f(1)");
        assert_eq!(
            value.unwrap_err(),
            "TypeError: f() missing 1 required positional argument: 'b'"
        );
        let (value, _) = run(src, "f(1, 2, 3)");
        assert_eq!(
            value.unwrap_err(),
            "TypeError: f() takes 2 positional arguments but 3 were given"
        );
        let (value, _) = run(src, "f(1, c=2)");
        assert_eq!(
            value.unwrap_err(),
            "TypeError: f() got an unexpected keyword argument 'c'"
        );
    }

    #[test]
    fn sort_is_stable_with_keys() {
        let src = "words = ['bb', 'a', 'cc', 'd']\n";
        assert_eq!(
            value_of(src, "sorted(words, key=len)"),
            "['a', 'd', 'bb', 'cc']"
        );
        assert_eq!(
            value_of(src, "sorted(words, key=len, reverse=True)"),
            "['bb', 'cc', 'a', 'd']"
        );
    }

    #[test]
    fn fstrings_format_fields() {
        let src = "name = 'Ada'\nscore = 0.91234\n";
        assert_eq!(
            value_of(src, "f'{name!r} scored {score:.1%} ({score:>8.3f})'"),
            "\"'Ada' scored 91.2% (   0.912)\""
        );
    }

    #[test]
    fn evaluation_sees_program_state() {
        let (value, out) = run("xs = []\nxs.append(3)\n", "xs + [4]");
        assert_eq!(value.unwrap(), "[3, 4]");
        assert!(out.is_empty());
    }

    const NOTED: &str = "\
calls = []
def note(x):
    calls.append(x)
    return x
";

    #[test]
    fn generators_run_only_as_they_are_consumed() {
        let src = format!("{NOTED}g = (note(i) for i in range(5))\n");
        assert_eq!(value_of(&src, "calls"), "[]");
        assert_eq!(value_of(&src, "[sum(g), sum(g), calls]"), "[10, 0, [0, 1, 2, 3, 4]]");
        assert_eq!(value_of(&src, "g"), "<generator object <genexpr>>");
    }

    #[test]
    fn any_all_and_in_stop_at_the_deciding_element() {
        assert_eq!(
            value_of(NOTED, "[any(note(i) > 1 for i in range(10 ** 9)), calls]"),
            "[True, [0, 1, 2]]"
        );
        assert_eq!(
            value_of(NOTED, "[all(note(i) < 1 for i in range(10 ** 9)), calls]"),
            "[False, [0, 1]]"
        );
        assert_eq!(
            value_of("g = (i * i for i in range(10))\n", "[9 in g, list(g), 9 in g]"),
            "[True, [16, 25, 36, 49, 64, 81], False]"
        );
    }

    #[test]
    fn for_loops_break_out_of_endless_generators() {
        let src = "\
out = []
for v in (i for i in range(10 ** 12) if i % 2):
    if v > 5:
        break
    out.append(v)
";
        assert_eq!(value_of(src, "out"), "[1, 3, 5]");
    }

    #[test]
    fn generator_checks_its_first_iterable_up_front() {
        assert!(error_of("g = (x for x in 5)\n").starts_with("TypeError"));
        assert_eq!(value_of("", "sorted(x % 3 for x in range(5))"), "[0, 0, 1, 1, 2]");
        assert_eq!(value_of("", "max(len(w) for w in ['a', 'abc', 'ab'])"), "3");
    }

    #[test]
    fn range_slices_with_extreme_steps() {
        assert_eq!(value_of("", "range(10)[::-3]"), "[9, 6, 3, 0]");
        assert_eq!(
            value_of("M = 9223372036854775807\n", "range(-M - 1, M)[::M]"),
            "[-9223372036854775808, -1, 9223372036854775806]"
        );
    }

    #[test]
    fn merge_sort_orders_positions() {
        let data = [5, 3, 9, 1, 3];
        let mut order: Vec<usize> = (0..data.len()).collect();
        merge_sort(&mut order, |a, b| Ok(data[a].cmp(&data[b]))).unwrap();
        assert_eq!(order, vec![3, 1, 4, 0, 2]);
    }
}
