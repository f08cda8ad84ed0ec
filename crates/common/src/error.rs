// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// Error types for netstack

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Config not found for profile '{profile}': {}", path.display())]
    ConfigNotFound { profile: String, path: PathBuf },

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Engine launch failed: {0}")]
    EngineLaunch(String),

    #[error("Engine is already running with PID {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("Shell error: {0}")]
    Shell(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Parse-time and selection errors the operator can fix by retrying input
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_)
                | Error::InvalidParameter(_)
                | Error::ConfigNotFound { .. }
                | Error::InsufficientPrivilege(_)
                | Error::AlreadyRunning { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
