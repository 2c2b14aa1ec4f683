//! Configuration loader for Stepwise.
//!
//! Reads `stepwise.toml` and deserializes it into [`StepwiseConfig`]. Falls
//! back to defaults when the file is missing or malformed.

use std::path::Path;

use stepwise_types::config::StepwiseConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "stepwise.toml";

/// Load configuration from `path`.
///
/// - Missing file: defaults.
/// - Unreadable or unparseable file: logs a warning, defaults.
/// - Otherwise the parsed config, with engine limits clamped to usable values.
pub async fn load_config(path: &Path) -> StepwiseConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return StepwiseConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return StepwiseConfig::default();
        }
    };

    match toml::from_str::<StepwiseConfig>(&content) {
        Ok(mut config) => {
            config.engine = config.engine.validated();
            config
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            StepwiseConfig::default()
        }
    }
}
