//! Deep copies of the module namespace.
//!
//! The worker copies the globals once after the program has run and puts a
//! fresh copy back before every test, so one test's mutations never reach
//! the next. Aliasing inside the namespace survives the copy: two names
//! bound to the same list are still bound to one list afterwards.

use crate::lang::error::ScriptResult;
use crate::lang::interp::Scope;
use crate::lang::value::{BoundMethod, Dict, Function, Generator, Set, Value, MAX_VALUE_DEPTH};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// A frozen copy of a module namespace.
#[derive(Debug)]
pub struct Snapshot {
    vars: HashMap<String, Value>,
}

impl Snapshot {
    /// Copy the variables of `module`.
    pub fn take(module: &Rc<Scope>) -> ScriptResult<Self> {
        let vars = module.vars.borrow().clone();
        Ok(Self {
            vars: Copier::new(module).vars(&vars)?,
        })
    }

    /// Replace the variables of `module` with a fresh copy of the snapshot.
    pub fn restore(&self, module: &Rc<Scope>) -> ScriptResult<()> {
        module.vars.borrow_mut().clear();
        let vars = Copier::new(module).vars(&self.vars)?;
        *module.vars.borrow_mut() = vars;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// One copy pass. Shared allocations are copied once and the copy reused.
struct Copier {
    module: Rc<Scope>,
    values: HashMap<usize, Value>,
    scopes: HashMap<usize, Rc<Scope>>,
}

impl Copier {
    fn new(module: &Rc<Scope>) -> Self {
        Self {
            module: module.clone(),
            values: HashMap::new(),
            scopes: HashMap::new(),
        }
    }

    fn vars(&mut self, vars: &HashMap<String, Value>) -> ScriptResult<HashMap<String, Value>> {
        vars.iter()
            .map(|(name, value)| Ok((name.clone(), self.value(value, 0)?)))
            .collect()
    }

    fn value(&mut self, value: &Value, depth: usize) -> ScriptResult<Value> {
        // Past the nesting bound the original is shared rather than copied.
        if depth > MAX_VALUE_DEPTH {
            return Ok(value.clone());
        }
        let Some(address) = address_of(value) else {
            return Ok(value.clone());
        };
        if let Some(copy) = self.values.get(&address) {
            return Ok(copy.clone());
        }
        let copy = match value {
            Value::List(items) => {
                let list = Rc::new(RefCell::new(Vec::new()));
                self.values.insert(address, Value::List(list.clone()));
                let items = items.borrow().clone();
                let copied = items
                    .iter()
                    .map(|item| self.value(item, depth + 1))
                    .collect::<ScriptResult<Vec<_>>>()?;
                *list.borrow_mut() = copied;
                Value::List(list)
            }
            Value::Dict(dict) => {
                let target = Rc::new(RefCell::new(Dict::new()));
                self.values.insert(address, Value::Dict(target.clone()));
                let items = dict.borrow().items();
                for (key, item) in items {
                    let key = self.value(&key, depth + 1)?;
                    let item = self.value(&item, depth + 1)?;
                    target.borrow_mut().insert(key, item)?;
                }
                Value::Dict(target)
            }
            Value::Set(set) => {
                let target = Rc::new(RefCell::new(Set::new()));
                self.values.insert(address, Value::Set(target.clone()));
                let members = set.borrow().values();
                for member in members {
                    let member = self.value(&member, depth + 1)?;
                    target.borrow_mut().insert(member)?;
                }
                Value::Set(target)
            }
            Value::Tuple(items) => Value::Tuple(Rc::new(
                items
                    .iter()
                    .map(|item| self.value(item, depth + 1))
                    .collect::<ScriptResult<Vec<_>>>()?,
            )),
            Value::Function(function) => {
                let closure = self.scope(&function.closure, depth + 1)?;
                let defaults = function
                    .defaults
                    .iter()
                    .map(|item| self.value(item, depth + 1))
                    .collect::<ScriptResult<Vec<_>>>()?;
                Value::Function(Rc::new(Function {
                    def: function.def.clone(),
                    defaults,
                    closure,
                }))
            }
            Value::Generator(generator) => Value::Generator(Rc::new(Generator {
                body: generator.body.clone(),
                first: self.value(&generator.first, depth + 1)?,
                scope: self.scope(&generator.scope, depth + 1)?,
                exhausted: Cell::new(generator.exhausted.get()),
            })),
            Value::Method(method) => Value::Method(Rc::new(BoundMethod {
                receiver: self.value(&method.receiver, depth + 1)?,
                name: method.name,
            })),
            other => other.clone(),
        };
        self.values.insert(address, copy.clone());
        Ok(copy)
    }

    /// Closures over the module keep pointing at the live module scope;
    /// enclosing function scopes are copied like any other container.
    fn scope(&mut self, scope: &Rc<Scope>, depth: usize) -> ScriptResult<Rc<Scope>> {
        if scope.parent.is_none() {
            return Ok(self.module.clone());
        }
        if depth > MAX_VALUE_DEPTH {
            return Ok(scope.clone());
        }
        let address = Rc::as_ptr(scope) as usize;
        if let Some(copy) = self.scopes.get(&address) {
            return Ok(copy.clone());
        }
        let parent = match &scope.parent {
            Some(parent) => Some(self.scope(parent, depth + 1)?),
            None => None,
        };
        let copy = Rc::new(Scope {
            vars: RefCell::default(),
            globals: RefCell::new(scope.globals.borrow().clone()),
            parent,
        });
        self.scopes.insert(address, copy.clone());
        let vars = scope.vars.borrow().clone();
        let copied = vars
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.value(value, depth + 1)?)))
            .collect::<ScriptResult<HashMap<_, _>>>()?;
        *copy.vars.borrow_mut() = copied;
        Ok(copy)
    }
}

/// Identity of the allocation behind a value that can hold other values.
fn address_of(value: &Value) -> Option<usize> {
    Some(match value {
        Value::List(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Dict(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Set(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Tuple(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Function(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Generator(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        Value::Method(rc) => Rc::as_ptr(rc) as *const u8 as usize,
        _ => return None,
    })
}
