//! Configuration and request/response types
//!
//! Budgets, engine settings, the wire shapes of requests and results, and
//! startup validation.

pub mod loader;
pub mod types;
pub mod validator;
