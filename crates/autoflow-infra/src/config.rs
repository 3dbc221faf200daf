//! Data directory and engine configuration loading.
//!
//! Reads `config.toml` from the data directory (`~/.autoflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use autoflow_types::config::EngineConfig;

/// Resolve the data directory.
///
/// `AUTOFLOW_DATA_DIR` wins, then `~/.autoflow`, then `./.autoflow`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AUTOFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".autoflow");
    }

    PathBuf::from(".autoflow")
}

/// Load engine configuration from `{data_dir}/config.toml`.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            if config.lock.renew_interval_secs >= config.lock.ttl_secs {
                tracing::warn!(
                    ttl = config.lock.ttl_secs,
                    renew = config.lock.renew_interval_secs,
                    "lock renewal interval is not shorter than the lease ttl"
                );
            }
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// The SQLite URL for this data directory, unless the config overrides it.
pub fn database_url(config: &EngineConfig, data_dir: &Path) -> String {
    match &config.database_url {
        Some(url) => url.clone(),
        None => format!("sqlite://{}?mode=rwc", data_dir.join("autoflow.db").display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_config(tmp.path()).await;
        assert_eq!(config.default_task_timeout_secs, 3600);
        assert!(config.task_timeouts.is_empty());
    }

    #[tokio::test]
    async fn load_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_call_chain_depth = 4

[resume]
max_attempts = 1
backoff_ms = 10
"#,
        )
        .await
        .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_call_chain_depth, 4);
        assert_eq!(config.resume.max_attempts, 1);
        assert_eq!(config.resume.backoff_ms, 10);
    }

    #[tokio::test]
    async fn load_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_call_chain_depth = [")
            .await
            .unwrap();

        let config = load_config(tmp.path()).await;
        assert_eq!(config.max_call_chain_depth, 10);
    }

    #[test]
    fn database_url_defaults_to_data_dir() {
        let config = EngineConfig::default();
        let url = database_url(&config, Path::new("/tmp/af"));
        assert_eq!(url, "sqlite:///tmp/af/autoflow.db?mode=rwc");

        let config = EngineConfig {
            database_url: Some("sqlite::memory:".into()),
            ..EngineConfig::default()
        };
        assert_eq!(database_url(&config, Path::new("/tmp/af")), "sqlite::memory:");
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("AUTOFLOW_DATA_DIR", "/tmp/test-autoflow");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-autoflow"));
        unsafe {
            std::env::remove_var("AUTOFLOW_DATA_DIR");
        }
    }
}
