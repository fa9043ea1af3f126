// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with reconciler configuration

use crate::types::Timeouts;
use dropshot::ConfigLogging;
use serde::Deserialize;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;

/// Configuration for a reconciler
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the reconciler's logger
    pub log: ConfigLogging,
    /// Budgets applied to entities that carry no override of their own
    #[serde(default)]
    pub timeouts: Timeouts,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {err}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {}: {err}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to set up logging")]
    Logging(#[source] std::io::Error),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    /// Build the root logger described by the `[log]` table.
    pub fn to_logger(&self, name: &str) -> Result<Logger, ConfigError> {
        self.log.to_logger(name).map_err(ConfigError::Logging)
    }
}
