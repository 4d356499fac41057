use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{DEFAULT_REFERRAL_CODE_LEN, MAX_REFERRAL_CODE_LEN, MIN_REFERRAL_CODE_LEN};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("referral_code_len must be between 6 and 16, got {0}")]
    CodeLength(usize),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub state_file: PathBuf,
    pub log_level: String,
    pub referral_code_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("stakenet-state.json"),
            log_level: "info".to_string(),
            referral_code_len: DEFAULT_REFERRAL_CODE_LEN,
        }
    }
}

impl Config {
    /// Reads a JSON config; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_REFERRAL_CODE_LEN..=MAX_REFERRAL_CODE_LEN).contains(&self.referral_code_len) {
            return Err(ConfigError::CodeLength(self.referral_code_len));
        }
        Ok(())
    }
}
