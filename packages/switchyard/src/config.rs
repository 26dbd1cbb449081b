//! Engine settings loaded from the environment.

use std::env;

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::unit_of_work::{UnitOfWorkError, UnitOfWorkMode};

/// Environment variable selecting the unit-of-work flush policy.
pub const UNIT_OF_WORK_MODE_VAR: &str = "SWITCHYARD_UNIT_OF_WORK_MODE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is invalid: {source}")]
    InvalidValue {
        key: &'static str,
        #[source]
        source: UnitOfWorkError,
    },
}

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub unit_of_work_mode: UnitOfWorkMode,
}

impl EngineSettings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let unit_of_work_mode = match lookup(UNIT_OF_WORK_MODE_VAR) {
            Some(value) => value.parse().map_err(|source| ConfigError::InvalidValue {
                key: UNIT_OF_WORK_MODE_VAR,
                source,
            })?,
            None => UnitOfWorkMode::default(),
        };

        Ok(Self { unit_of_work_mode })
    }

    pub fn with_unit_of_work_mode(mut self, mode: UnitOfWorkMode) -> Self {
        self.unit_of_work_mode = mode;
        self
    }
}
