//! Configuration loader for Recall.
//!
//! Reads `config.toml` from the data directory (`~/.recall/` in production)
//! and deserializes it into [`RecallConfig`]. Falls back to defaults when the
//! file is missing or malformed; values that parse but make no sense are
//! rejected by [`load_config`].

use std::path::Path;

use recall_types::config::RecallConfig;
use recall_types::error::ConfigError;

pub const CONFIG_FILE: &str = "config.toml";

/// Read `{data_dir}/config.toml` leniently.
///
/// - Missing file: [`RecallConfig::default()`].
/// - Unreadable or unparsable file: a warning, then the default.
pub async fn read_config(data_dir: &Path) -> RecallConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return RecallConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return RecallConfig::default();
        }
    };

    match toml::from_str::<RecallConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            RecallConfig::default()
        }
    }
}

/// Read and validate the configuration. Fails only on invalid values.
pub async fn load_config(data_dir: &Path) -> Result<RecallConfig, ConfigError> {
    let config = read_config(data_dir).await;
    config.validate()?;
    Ok(config)
}
