//! Observability
//!
//! Structured audit events for executions.

pub mod audit;
