use serde::{Deserialize, Serialize};
use std::fmt;

/// Error classes a program can raise or observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Syntax,
    Name,
    /// A reference to something withheld from the namespace.
    Capability,
    Type,
    Value,
    ZeroDivision,
    Index,
    Key,
    Attribute,
    Overflow,
    Recursion,
    Assertion,
    Runtime,
    NotImplemented,
    Lookup,
    Arithmetic,
    Exception,
    Timeout,
    Memory,
    OutputLimit,
}

impl ErrorKind {
    /// Exception types a program may name, raise and catch.
    pub const RAISABLE: [ErrorKind; 15] = [
        ErrorKind::Exception,
        ErrorKind::Type,
        ErrorKind::Value,
        ErrorKind::ZeroDivision,
        ErrorKind::Index,
        ErrorKind::Key,
        ErrorKind::Attribute,
        ErrorKind::Overflow,
        ErrorKind::Recursion,
        ErrorKind::Assertion,
        ErrorKind::Runtime,
        ErrorKind::NotImplemented,
        ErrorKind::Lookup,
        ErrorKind::Arithmetic,
        ErrorKind::Name,
    ];

    pub fn python_name(self) -> &'static str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Capability => "CapabilityError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::ZeroDivision => "ZeroDivisionError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Key => "KeyError",
            ErrorKind::Attribute => "AttributeError",
            ErrorKind::Overflow => "OverflowError",
            ErrorKind::Recursion => "RecursionError",
            ErrorKind::Assertion => "AssertionError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::NotImplemented => "NotImplementedError",
            ErrorKind::Lookup => "LookupError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::Exception => "Exception",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Memory => "MemoryError",
            ErrorKind::OutputLimit => "OutputLimitExceeded",
        }
    }

    pub fn from_python_name(name: &str) -> Option<ErrorKind> {
        ErrorKind::RAISABLE
            .iter()
            .copied()
            .find(|k| k.python_name() == name)
    }

    /// Limit breaches and capability denials unwind through every handler.
    pub fn is_catchable(self) -> bool {
        !matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Memory
                | ErrorKind::OutputLimit
                | ErrorKind::Capability
                | ErrorKind::Syntax
        )
    }

    /// Whether an `except self:` clause handles an error of kind `raised`.
    pub fn handles(self, raised: ErrorKind) -> bool {
        if !raised.is_catchable() {
            return false;
        }
        match self {
            ErrorKind::Exception => true,
            ErrorKind::Lookup => {
                matches!(raised, ErrorKind::Lookup | ErrorKind::Index | ErrorKind::Key)
            }
            ErrorKind::Arithmetic => matches!(
                raised,
                ErrorKind::Arithmetic | ErrorKind::ZeroDivision | ErrorKind::Overflow
            ),
            ErrorKind::Runtime => {
                matches!(
                    raised,
                    ErrorKind::Runtime | ErrorKind::Recursion | ErrorKind::NotImplemented
                )
            }
            other => other == raised,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.python_name())
    }
}

/// An error raised while compiling or running a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn syntax(message: impl Into<String>, line: u32) -> Self {
        Self {
            kind: ErrorKind::Syntax,
            message: message.into(),
            line: Some(line),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn undefined_name(name: &str) -> Self {
        Self::new(ErrorKind::Name, format!("name '{name}' is not defined"))
    }

    pub fn withheld(what: &str) -> Self {
        Self::new(
            ErrorKind::Capability,
            format!("{what} is not available in the sandbox"),
        )
    }

    /// Attach a line number unless one is already recorded.
    pub fn at_line(mut self, line: u32) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    /// `Kind: message` followed by the line when known.
    pub fn describe(&self) -> String {
        match self.line {
            Some(line) => format!("{self} (line {line})"),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ScriptError {}

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_breaches_are_not_catchable() {
        assert!(!ErrorKind::Exception.handles(ErrorKind::Timeout));
        assert!(!ErrorKind::Exception.handles(ErrorKind::Memory));
        assert!(!ErrorKind::Exception.handles(ErrorKind::Capability));
        assert!(ErrorKind::Exception.handles(ErrorKind::ZeroDivision));
    }

    #[test]
    fn hierarchy_groups_lookup_and_arithmetic() {
        assert!(ErrorKind::Lookup.handles(ErrorKind::Key));
        assert!(ErrorKind::Arithmetic.handles(ErrorKind::ZeroDivision));
        assert!(!ErrorKind::Value.handles(ErrorKind::Type));
    }

    #[test]
    fn describe_includes_line() {
        let err = ScriptError::new(ErrorKind::ZeroDivision, "division by zero").at_line(3);
        assert_eq!(err.describe(), "ZeroDivisionError: division by zero (line 3)");
        let bare = ScriptError::new(ErrorKind::Assertion, "");
        assert_eq!(bare.to_string(), "AssertionError");
    }
}
