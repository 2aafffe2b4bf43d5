// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// Resolves a config path to an absolute one. Existing paths are
/// canonicalized; a not-yet-existing path is returned absolute so the
/// loader can report the miss itself.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    if !abs.exists() {
        return Ok(abs);
    }

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}

/// Config path from `CONFIG_PATH`, defaulting to `config.yaml` in the
/// working directory.
pub fn config_path_from_env() -> Result<PathBuf> {
    let rel = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    resolve_config_path(&rel)
}
