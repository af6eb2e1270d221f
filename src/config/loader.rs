use crate::config::Config;
use crate::utils::get_taskmate_home;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_taskmate_home()?.join("config.json"))
}

/// Load configuration from `config_path` (or the default location).
///
/// Missing file is not an error — defaults apply, with the `TASKMATE_API_KEY`
/// environment variable overriding the provider key either way.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    let mut config = if path.exists() {
        // Shared (read) lock — allows concurrent readers, blocks during writes
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open config at {}", path.display()))?;
        file.lock_shared()
            .with_context(|| "Failed to acquire shared lock on config file")?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        // Lock released when `file` drops at end of scope

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var("TASKMATE_API_KEY")
        && !key.is_empty()
    {
        config.provider.api_key = key;
    }
    if let Ok(model) = std::env::var("TASKMATE_MODEL")
        && !model.is_empty()
    {
        config.provider.model = model;
    }
}
