//! The learner language: a Python subset interpreted in-process by the
//! worker. The namespace a program sees is assembled from a
//! [`crate::capability::CapabilitySet`]; nothing outside it is reachable.

pub mod ast;
pub mod builtins;
pub mod error;
pub mod format;
pub mod interp;
pub mod lexer;
pub mod meter;
pub mod methods;
pub mod ops;
pub mod parser;
pub mod snapshot;
pub mod value;

pub use error::{ErrorKind, ScriptError, ScriptResult};
pub use interp::{Interpreter, Limits};
pub use snapshot::Snapshot;
pub use value::Value;
