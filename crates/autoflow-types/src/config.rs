//! Engine configuration.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. It
//! controls task timeouts, the resume retry budget, materializer caching,
//! lease timing for the distributed lock, and call-chain limits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine.
///
/// Loaded from `~/.autoflow/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution timeout for actions without a registry or config override.
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,

    /// Per action-name execution timeouts, in seconds.
    #[serde(default)]
    pub task_timeouts: HashMap<String, u64>,

    /// Added on top of every execution timeout for the supervising watchdog.
    #[serde(default = "default_watchdog_margin_secs")]
    pub watchdog_margin_secs: u64,

    #[serde(default)]
    pub resume: ResumeConfig,

    #[serde(default)]
    pub materializer: MaterializerConfig,

    #[serde(default)]
    pub lock: LockConfig,

    /// Longest allowed chain of nested composable-workflow invocations.
    #[serde(default = "default_max_call_chain_depth")]
    pub max_call_chain_depth: usize,

    /// Overrides the default `sqlite://{data_dir}/autoflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_watchdog_margin_secs() -> u64 {
    60
}

fn default_max_call_chain_depth() -> usize {
    10
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_secs: default_task_timeout_secs(),
            task_timeouts: HashMap::new(),
            watchdog_margin_secs: default_watchdog_margin_secs(),
            resume: ResumeConfig::default(),
            materializer: MaterializerConfig::default(),
            lock: LockConfig::default(),
            max_call_chain_depth: default_max_call_chain_depth(),
            database_url: None,
        }
    }
}

/// Bounded retry for the resume protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    #[serde(default = "default_resume_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_resume_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_resume_attempts() -> u32 {
    5
}

fn default_resume_backoff_ms() -> u64 {
    3000
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_resume_attempts(),
            backoff_ms: default_resume_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterializerConfig {
    /// How long a materialized task list stays cached.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Lease timing for the distributed lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    /// Must be shorter than `ttl_secs`.
    #[serde(default = "default_renew_interval_secs")]
    pub renew_interval_secs: u64,
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_renew_interval_secs() -> u64 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            renew_interval_secs: default_renew_interval_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_task_timeout_secs, 3600);
        assert_eq!(config.watchdog_margin_secs, 60);
        assert_eq!(config.resume.max_attempts, 5);
        assert_eq!(config.resume.backoff_ms, 3000);
        assert_eq!(config.materializer.cache_ttl_secs, 300);
        assert_eq!(config.lock.ttl_secs, 30);
        assert_eq!(config.max_call_chain_depth, 10);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_task_timeout_secs, 3600);
        assert!(config.task_timeouts.is_empty());
        assert_eq!(config.lock.renew_interval_secs, 10);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_task_timeout_secs = 120
max_call_chain_depth = 3

[task_timeouts]
"@workflow/approval" = 86400

[resume]
max_attempts = 2

[lock]
ttl_secs = 60
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_task_timeout_secs, 120);
        assert_eq!(config.max_call_chain_depth, 3);
        assert_eq!(config.task_timeouts.get("@workflow/approval"), Some(&86400));
        assert_eq!(config.resume.max_attempts, 2);
        assert_eq!(config.resume.backoff_ms, 3000);
        assert_eq!(config.lock.ttl_secs, 60);
        assert_eq!(config.lock.renew_interval_secs, 10);
    }
}
