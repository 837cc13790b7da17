//! Data directory layout.

use std::path::{Path, PathBuf};

use recall_types::config::RecallConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "RECALL_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `RECALL_DATA_DIR` environment variable
/// 2. `~/.recall`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".recall");
    }

    // Last resort: current directory
    PathBuf::from(".recall")
}

/// Directory holding `outbox.jsonl` and `dead_letter.jsonl`.
pub fn outbox_dir(data_dir: &Path, config: &RecallConfig) -> PathBuf {
    data_dir.join(&config.outbox.dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_is_not_empty() {
        assert!(!resolve_data_dir().as_os_str().is_empty());
    }

    #[test]
    fn test_outbox_dir_uses_config() {
        let mut config = RecallConfig::default();
        assert_eq!(outbox_dir(Path::new("/data"), &config), PathBuf::from("/data/outbox"));
        config.outbox.dir = "queue".to_string();
        assert_eq!(outbox_dir(Path::new("/data"), &config), PathBuf::from("/data/queue"));
    }
}
