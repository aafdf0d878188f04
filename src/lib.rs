//! snakebox: a sandboxed execution engine for learner-submitted snippets
//! of a restricted Python-style language.
//!
//! # Architecture
//!
//! ## Capability Restrictor ([`capability`])
//! - Allow-list of built-ins a program may reach; host-reaching names are
//!   withheld outright
//!
//! ## Language ([`lang`])
//! - [`lang::lexer`], [`lang::parser`]: source to AST
//! - [`lang::interp`]: tree-walking evaluator with cooperative metering
//! - [`lang::builtins`], [`lang::methods`]: the granted surface
//!
//! ## Resource Limiter ([`limiter`])
//! - [`limiter::hardening`]: pre-exec rlimits and descriptor hygiene
//! - [`limiter::supervisor`]: worker spawn, frame deadlines, kill and reap
//! - [`limiter::verdict`]: exit evidence to limit breach
//! - [`limiter::protocol`]: parent/worker frames
//!
//! ## Execution Engine ([`engine`])
//! - [`engine::lifecycle`]: type-state execution lifecycle
//! - [`engine::evaluator`]: test judging
//! - [`engine::reporter`]: result aggregation
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured audit events
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: budgets, requests, results, errors
//! - [`config::loader`]: JSON file and environment loading
//! - [`config::validator`]: startup validation
//!
//! # Design Principles
//!
//! 1. **Out-of-process isolation** - the allow-list is a second layer, never the only one
//! 2. **Kernel as backstop** - rlimits and the watchdog hold when metering does not
//! 3. **Failures are data** - every outcome folds into an `ExecutionResult`

// Capability restriction
pub mod capability;

// Learner language
pub mod lang;

// Resource limiting and worker supervision
pub mod limiter;

// Worker entry point
pub mod worker;

// Execution engine
pub mod engine;

// Observability
pub mod observability;

// Configuration
pub mod config;

// CLI entrypoint wiring for the snakebox binary.
pub mod cli;

pub use config::types::*;
pub use engine::Engine;
