use crate::config::types::{Result, SandboxConfig, SandboxError};
use std::path::{Path, PathBuf};

pub const ENV_WORKER: &str = "SNAKEBOX_WORKER";
pub const ENV_CPU_MS: &str = "SNAKEBOX_CPU_MS";
pub const ENV_WALL_MS: &str = "SNAKEBOX_WALL_MS";
pub const ENV_MEMORY_MB: &str = "SNAKEBOX_MEMORY_MB";

impl SandboxConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| SandboxError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// File (when given) then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SNAKEBOX_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(worker) = lookup(ENV_WORKER).filter(|v| !v.is_empty()) {
            self.worker_program = Some(PathBuf::from(worker));
        }
        if let Some(ms) = parse_env_u64(&lookup, ENV_CPU_MS)? {
            self.budget.cpu_time_limit_ms = ms;
        }
        if let Some(ms) = parse_env_u64(&lookup, ENV_WALL_MS)? {
            self.budget.wall_time_limit_ms = ms;
        }
        if let Some(mb) = parse_env_u64(&lookup, ENV_MEMORY_MB)? {
            self.budget.memory_limit_bytes = mb.saturating_mul(1024 * 1024);
        }
        Ok(())
    }

    /// Binary to re-execute as the worker.
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_program {
            return Ok(path.clone());
        }
        if let Some(path) = std::env::var_os(ENV_WORKER).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        std::env::current_exe().map_err(|e| {
            SandboxError::Config(format!("cannot determine worker program: {}", e))
        })
    }
}

fn parse_env_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| SandboxError::Config(format!("{key}={raw:?} is not a number: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_replace_budget_values() {
        let mut config = SandboxConfig::default();
        config
            .apply_env_overrides(env(&[
                (ENV_CPU_MS, "150"),
                (ENV_WALL_MS, "300"),
                (ENV_MEMORY_MB, "64"),
                (ENV_WORKER, "/opt/snakebox"),
            ]))
            .unwrap();
        assert_eq!(config.budget.cpu_time_limit_ms, 150);
        assert_eq!(config.budget.wall_time_limit_ms, 300);
        assert_eq!(config.budget.memory_limit_bytes, 64 * 1024 * 1024);
        assert_eq!(config.worker_program, Some(PathBuf::from("/opt/snakebox")));
    }

    #[test]
    fn malformed_env_value_is_a_config_error() {
        let mut config = SandboxConfig::default();
        let err = config
            .apply_env_overrides(env(&[(ENV_CPU_MS, "fast")]))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[test]
    fn load_from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_recursion_depth": 50, "capabilities": ["print", "len"]}}"#).unwrap();
        let config = SandboxConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_recursion_depth, 50);
        assert_eq!(config.capabilities.unwrap(), vec!["print", "len"]);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = SandboxConfig::load_from_file("/nonexistent/snakebox.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
