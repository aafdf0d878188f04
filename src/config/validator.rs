// Startup validation for engine configuration.
// Errors are fatal when the engine is built; warnings are logged.

use crate::capability::CapabilitySet;
use crate::config::types::{ResourceBudget, Result, SandboxConfig, SandboxError};

/// Smallest address-space ceiling the worker binary can start under.
pub const WORKER_MEMORY_FLOOR: u64 = 32 * 1024 * 1024;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Turns collected errors into a single configuration error.
    pub fn into_result(self) -> Result<Self> {
        if self.valid {
            return Ok(self);
        }
        Err(SandboxError::Config(format!(
            "config validation failed:\n{}",
            self.errors.join("\n")
        )))
    }
}

/// Check a configuration without touching the host.
pub fn validate_config(config: &SandboxConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_budget("budget", &config.budget, WORKER_MEMORY_FLOOR, &mut result);
    validate_budget("test_budget", &config.test_budget, 1024 * 1024, &mut result);
    validate_budget_relation(config, &mut result);
    validate_interpreter_limits(config, &mut result);

    if let Some(names) = &config.capabilities {
        if let Err(e) = CapabilitySet::from_names(names) {
            result.add_error(e.to_string());
        }
    }

    result
}

/// Validate and fail fast; warnings are logged.
pub fn ensure_valid(config: &SandboxConfig) -> Result<()> {
    let result = validate_config(config);
    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }
    result.into_result().map(|_| ())
}

fn validate_budget(
    name: &str,
    budget: &ResourceBudget,
    memory_floor: u64,
    result: &mut ValidationResult,
) {
    if budget.cpu_time_limit_ms == 0 {
        result.add_error(format!("{name}.cpu_time_limit_ms cannot be zero"));
    }
    if budget.wall_time_limit_ms == 0 {
        result.add_error(format!("{name}.wall_time_limit_ms cannot be zero"));
    }
    if budget.memory_limit_bytes < memory_floor {
        result.add_error(format!(
            "{name}.memory_limit_bytes {} is below the minimum of {} bytes",
            budget.memory_limit_bytes, memory_floor
        ));
    }
    if budget.wall_time_limit_ms < budget.cpu_time_limit_ms {
        result.add_warning(format!(
            "{name}.wall_time_limit_ms ({}) is lower than cpu_time_limit_ms ({}); the wall limit will always fire first",
            budget.wall_time_limit_ms, budget.cpu_time_limit_ms
        ));
    }
    if budget.wall_time_limit_ms > 60_000 {
        result.add_warning(format!(
            "{name}.wall_time_limit_ms {} is over a minute",
            budget.wall_time_limit_ms
        ));
    }
}

fn validate_budget_relation(config: &SandboxConfig, result: &mut ValidationResult) {
    let source = &config.budget;
    let test = &config.test_budget;
    if test.cpu_time_limit_ms > source.cpu_time_limit_ms
        || test.wall_time_limit_ms > source.wall_time_limit_ms
    {
        result.add_warning("test_budget is larger than the source budget".to_string());
    }
}

fn validate_interpreter_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.max_recursion_depth == 0 {
        result.add_error("max_recursion_depth cannot be zero".to_string());
    }
    if config.max_nesting_depth < 8 {
        result.add_error(format!(
            "max_nesting_depth {} is too small to parse ordinary programs",
            config.max_nesting_depth
        ));
    }
    if config.output_limit_bytes == 0 {
        result.add_error("output_limit_bytes cannot be zero".to_string());
    }
    if config.stack_limit_bytes < 8 * 1024 * 1024 {
        result.add_error(format!(
            "stack_limit_bytes {} is below 8 MiB",
            config.stack_limit_bytes
        ));
    }
    if config.max_recursion_depth > 2_000 {
        result.add_warning(format!(
            "max_recursion_depth {} may exhaust the worker stack before the limit is hit",
            config.max_recursion_depth
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate_config(&SandboxConfig::default());
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn zero_limits_are_errors() {
        let mut config = SandboxConfig::default();
        config.budget.cpu_time_limit_ms = 0;
        config.budget.memory_limit_bytes = 1024;
        let result = validate_config(&config);
        assert!(!result.is_valid());
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn unknown_capability_is_an_error() {
        let config = SandboxConfig {
            capabilities: Some(vec!["print".into(), "open".into()]),
            ..SandboxConfig::default()
        };
        let result = validate_config(&config);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("open"));
    }

    #[test]
    fn oversized_test_budget_is_a_warning() {
        let mut config = SandboxConfig::default();
        config.test_budget.wall_time_limit_ms = config.budget.wall_time_limit_ms + 1;
        let result = validate_config(&config);
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn into_result_joins_errors() {
        let mut result = ValidationResult::new();
        result.add_error("a".into());
        result.add_error("b".into());
        let err = result.into_result().unwrap_err();
        assert!(err.to_string().contains("a\nb"));
    }
}
