/// Session configuration
///
/// Settings that shape how a session drives its backend. Every key has a
/// default, so an empty JSON object is a valid config file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::parser::DEFAULT_BLOCK_TERMINATOR;
use crate::types::SessionParameters;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfig {
    pub backend_command: String,
    pub backend_args: Vec<String>,
    pub block_terminator: String,
    /// Start the inferior as soon as inferior setup succeeded.
    pub run_after_setup: bool,
    pub max_stack_depth: usize,
    pub operate_by_instruction: bool,
    pub intel_flavor: bool,
    pub auto_deref_pointers: bool,
    pub use_debugging_helpers: bool,
    pub use_dynamic_type: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend_command: "python3".to_string(),
            backend_args: Vec::new(),
            block_terminator: DEFAULT_BLOCK_TERMINATOR.to_string(),
            run_after_setup: true,
            max_stack_depth: 20,
            operate_by_instruction: false,
            intel_flavor: false,
            auto_deref_pointers: true,
            use_debugging_helpers: true,
            use_dynamic_type: true,
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading session config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn disassembly_flavor(&self) -> &'static str {
        if self.intel_flavor {
            "intel"
        } else {
            "att"
        }
    }
}

pub fn load_parameters(path: impl AsRef<Path>) -> Result<SessionParameters> {
    let path = path.as_ref();
    log::debug!("Loading session parameters from {}", path.display());
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
