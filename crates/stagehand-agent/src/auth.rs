//! API key lookup

use stagehand_core::{Result, StagehandError};
use std::env;

/// Read the API key from the environment variable named `var`
pub fn resolve_api_key(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::debug!("Using API key from {}", var);
            Ok(key)
        }
        Ok(_) => Err(StagehandError::Auth(format!("{} is set but empty", var))),
        Err(_) => Err(StagehandError::Auth(format!(
            "No API key found. Set {}=sk-ant-... or change critic.api_key_env in .stagehand/config.toml",
            var
        ))),
    }
}
