//! Capability restriction
//!
//! The namespace a learner program sees is built from an explicit allow-list
//! of built-in operations. Anything not on the list does not exist for the
//! program; a curated set of host-reaching names is withheld outright and
//! can never be granted.

use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Every built-in the language can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Print,
    Len,
    Range,
    Enumerate,
    Sum,
    Min,
    Max,
    Abs,
    Int,
    Float,
    Str,
    Bool,
    List,
    Tuple,
    Dict,
    Set,
    Sorted,
    Reversed,
    Zip,
    Round,
    Any,
    All,
    Map,
    Filter,
    Repr,
    Divmod,
    Pow,
    Chr,
    Ord,
    Isinstance,
}

impl Capability {
    pub const ALL: [Capability; 30] = [
        Capability::Print,
        Capability::Len,
        Capability::Range,
        Capability::Enumerate,
        Capability::Sum,
        Capability::Min,
        Capability::Max,
        Capability::Abs,
        Capability::Int,
        Capability::Float,
        Capability::Str,
        Capability::Bool,
        Capability::List,
        Capability::Tuple,
        Capability::Dict,
        Capability::Set,
        Capability::Sorted,
        Capability::Reversed,
        Capability::Zip,
        Capability::Round,
        Capability::Any,
        Capability::All,
        Capability::Map,
        Capability::Filter,
        Capability::Repr,
        Capability::Divmod,
        Capability::Pow,
        Capability::Chr,
        Capability::Ord,
        Capability::Isinstance,
    ];

    /// The eight built-ins of the narrow teaching sandbox.
    pub const MINIMAL: [Capability; 8] = [
        Capability::Print,
        Capability::Len,
        Capability::Range,
        Capability::Enumerate,
        Capability::Sum,
        Capability::Min,
        Capability::Max,
        Capability::Abs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::Print => "print",
            Capability::Len => "len",
            Capability::Range => "range",
            Capability::Enumerate => "enumerate",
            Capability::Sum => "sum",
            Capability::Min => "min",
            Capability::Max => "max",
            Capability::Abs => "abs",
            Capability::Int => "int",
            Capability::Float => "float",
            Capability::Str => "str",
            Capability::Bool => "bool",
            Capability::List => "list",
            Capability::Tuple => "tuple",
            Capability::Dict => "dict",
            Capability::Set => "set",
            Capability::Sorted => "sorted",
            Capability::Reversed => "reversed",
            Capability::Zip => "zip",
            Capability::Round => "round",
            Capability::Any => "any",
            Capability::All => "all",
            Capability::Map => "map",
            Capability::Filter => "filter",
            Capability::Repr => "repr",
            Capability::Divmod => "divmod",
            Capability::Pow => "pow",
            Capability::Chr => "chr",
            Capability::Ord => "ord",
            Capability::Isinstance => "isinstance",
        }
    }

    pub fn from_name(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Built-ins that double as type objects for `isinstance`.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Capability::Int
                | Capability::Float
                | Capability::Str
                | Capability::Bool
                | Capability::List
                | Capability::Tuple
                | Capability::Dict
                | Capability::Set
                | Capability::Range
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host-reaching or reflective names that are never grantable.
pub const WITHHELD: [&str; 25] = [
    "open",
    "eval",
    "exec",
    "compile",
    "__import__",
    "input",
    "globals",
    "locals",
    "vars",
    "dir",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "breakpoint",
    "help",
    "exit",
    "quit",
    "memoryview",
    "object",
    "type",
    "super",
    "id",
    "hash",
    "__builtins__",
];

pub fn is_withheld(name: &str) -> bool {
    WITHHELD.contains(&name)
}

/// Outcome of looking a free name up against the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Granted(Capability),
    /// Known to the catalog but not granted to this set.
    NotGranted(Capability),
    Withheld,
    Unknown,
}

/// Immutable allow-list of built-ins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    granted: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// The full catalog; the engine default.
    pub fn standard() -> Self {
        Self {
            granted: Capability::ALL.iter().copied().collect(),
        }
    }

    pub fn minimal() -> Self {
        Self {
            granted: Capability::MINIMAL.iter().copied().collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            granted: BTreeSet::new(),
        }
    }

    /// Build a set from built-in names. Unknown and withheld names are
    /// rejected.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut granted = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            if is_withheld(name) {
                return Err(SandboxError::Capability(format!(
                    "'{name}' reaches outside the sandbox and cannot be granted"
                )));
            }
            let capability = Capability::from_name(name).ok_or_else(|| {
                SandboxError::Capability(format!("unknown built-in '{name}'"))
            })?;
            granted.insert(capability);
        }
        Ok(Self { granted })
    }

    /// Resolve configuration: `None` grants the standard set.
    pub fn from_config(names: Option<&[String]>) -> Result<Self> {
        match names {
            Some(names) => Self::from_names(names),
            None => Ok(Self::standard()),
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    pub fn resolve(&self, name: &str) -> Resolution {
        if is_withheld(name) {
            return Resolution::Withheld;
        }
        match Capability::from_name(name) {
            Some(c) if self.allows(c) => Resolution::Granted(c),
            Some(c) => Resolution::NotGranted(c),
            None => Resolution::Unknown,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.granted.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.granted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(Capability::name).collect()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::standard()
    }
}
