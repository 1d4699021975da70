//! Engine configuration loader.
//!
//! Reads an optional `weft.toml` and deserializes it into [`EngineConfig`].
//! Falls back to defaults when the file is missing or malformed.

use std::path::Path;

use weft_types::config::EngineConfig;

/// File name looked up by [`load_engine_config_from_dir`].
pub const CONFIG_FILE_NAME: &str = "weft.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Load `{dir}/weft.toml`.
pub async fn load_engine_config_from_dir(dir: &Path) -> EngineConfig {
    load_engine_config(&dir.join(CONFIG_FILE_NAME)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config_from_dir(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn test_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
max_loop_iterations = 10
max_step_output_bytes = 2048

[telemetry]
otel = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config_from_dir(tmp.path()).await;
        assert_eq!(config.max_loop_iterations, 10);
        assert_eq!(config.max_step_output_bytes, 2048);
        assert!(config.telemetry.otel);
        assert!(!config.telemetry.json);
    }

    #[tokio::test]
    async fn test_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.toml");
        tokio::fs::write(&path, "max_loop_iterations = \"lots\"")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.max_loop_iterations, 100);
    }
}
