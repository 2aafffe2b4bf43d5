// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Startup configuration failures. Always fatal; the offending key is part
/// of the message.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key '{0}'")]
    MissingKey(String),

    #[error("config key '{key}' must be of type {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("invalid value for {var}: {value}")]
    BadEnvValue { var: &'static str, value: String },

    #[error("owner entry missing required 'nick' string")]
    OwnerMissingNick,

    #[error("owner '{0}' must define a password when no hosts are configured")]
    OwnerUnreachable(String),

    #[error("duplicate owner nick '{0}' detected in config")]
    DuplicateOwner(String),
}

/// Handler-registry failures callers branch on.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("handler '{0}' is not loaded")]
    NotLoaded(String),

    #[error("unknown handler '{0}'")]
    Unknown(String),

    #[error("command name '{0}' is already registered")]
    DuplicateCommand(String),
}
