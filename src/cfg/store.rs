// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Durable configuration store.
//!
//! All writes follow one protocol: take the cross-process advisory lock at
//! `<config>.lock`, read the current document, mutate it in memory, and
//! atomically replace the file (write to a temporary sibling, rename over).
//! Unchanged documents are never rewritten, so every persist is idempotent.
//! Reads outside the write path skip the lock and may observe a prior
//! consistent version.

use std::{
    fs,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde_yaml::{Mapping, Value};
use tempfile::NamedTempFile;

use crate::cfg::config::parse_document;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    /// Lock-free read. A missing file is an empty mapping.
    pub fn read(&self) -> Result<Mapping> {
        match fs::read_to_string(&self.path) {
            Ok(s) => parse_document(&s),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Mapping::new())
            },
            Err(e) => Err(e).with_context(|| {
                format!("failed to read {}", self.path.display())
            }),
        }
    }

    /// Read-merge-write under the advisory lock. `mutate` returns whether it
    /// intended a change; a result document equal to what was read is
    /// skipped either way. Returns whether the file was rewritten.
    pub fn update_blocking<F>(&self, mutate: F) -> Result<bool>
    where F: FnOnce(&mut Mapping) -> Result<bool> {
        let lock_path = self.lock_path();
        if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty())
        {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to create lock dir {}", dir.display())
            })?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| {
                format!("failed to open lock file {}", lock_path.display())
            })?;
        lock.lock_exclusive().context("failed to take config lock")?;

        let result = self.replace_locked(mutate);
        let _ = FileExt::unlock(&lock);
        result
    }

    fn replace_locked<F>(&self, mutate: F) -> Result<bool>
    where F: FnOnce(&mut Mapping) -> Result<bool> {
        let before = self.read()?;
        let mut doc = before.clone();
        if !mutate(&mut doc)? || doc == before {
            return Ok(false);
        }

        let serialized =
            serde_yaml::to_string(&doc).context("failed to serialize config")?;
        let dir = self
            .path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)
            .context("failed to create temporary config file")?;
        tmp.write_all(serialized.as_bytes())
            .context("failed to write temporary config file")?;
        tmp.persist(&self.path).with_context(|| {
            format!("failed to replace {}", self.path.display())
        })?;
        Ok(true)
    }

    /// Lock-free read on the blocking pool.
    pub async fn read_async(&self) -> Result<Mapping> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read())
            .await
            .context("config store task failed")?
    }

    /// Async write path; the lock and file I/O run on the blocking pool.
    pub async fn update<F>(&self, mutate: F) -> Result<bool>
    where F: FnOnce(&mut Mapping) -> Result<bool> + Send + 'static {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.update_blocking(mutate))
            .await
            .context("config store task failed")?
    }

    /// Persists the channel list, normalised: trimmed, case-insensitively
    /// deduplicated, original case and insertion order preserved.
    pub async fn persist_channels(&self, channels: Vec<String>) -> Result<bool> {
        self.update(move |doc| {
            let normalized = normalize_channels(&channels);
            doc.insert(
                "channels".into(),
                Value::Sequence(normalized.into_iter().map(Value::from).collect()),
            );
            Ok(true)
        })
        .await
    }

    /// Persists owner records re-serialised from the in-memory map.
    pub async fn persist_owner_records(&self, entries: Vec<Value>) -> Result<bool> {
        self.update(move |doc| {
            doc.insert("owner_nicks".into(), Value::Sequence(entries));
            Ok(true)
        })
        .await
    }

    /// Persists `plugins.<name>.enabled`.
    pub async fn set_handler_enabled(
        &self,
        name: String,
        enabled: bool,
    ) -> Result<bool> {
        self.update(move |doc| {
            let entry = handler_section_mut(doc, &name)?;
            entry.insert("enabled".into(), enabled.into());
            Ok(true)
        })
        .await
    }

    /// Merges handler-declared defaults into the document: missing keys are
    /// added, existing keys preserved, list values unioned by value. A
    /// pre-existing non-mapping is never coerced into a mapping.
    pub async fn merge_handler_defaults(&self, defaults: Mapping) -> Result<bool> {
        self.update(move |doc| Ok(merge_defaults(doc, &defaults))).await
    }

    /// Stores an arbitrary value under `plugins.<handler>.<key>`; the persist
    /// surface handlers use instead of touching the file themselves.
    pub async fn persist_handler_value(
        &self,
        handler: String,
        key: String,
        value: Value,
    ) -> Result<bool> {
        self.update(move |doc| {
            let entry = handler_section_mut(doc, &handler)?;
            entry.insert(key.into(), value);
            Ok(true)
        })
        .await
    }
}

/// `plugins.<name>` as a mutable mapping, created when absent. Pre-existing
/// non-mapping values are an error, never coerced.
fn handler_section_mut<'a>(
    doc: &'a mut Mapping,
    name: &str,
) -> Result<&'a mut Mapping> {
    let plugins = doc
        .entry("plugins".into())
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Some(plugins) = plugins.as_mapping_mut() else {
        bail!("config key 'plugins' is not a mapping");
    };
    plugins
        .entry(name.into())
        .or_insert_with(|| Value::Mapping(Mapping::new()))
        .as_mapping_mut()
        .ok_or_else(|| anyhow::anyhow!("config key 'plugins.{name}' is not a mapping"))
}

/// Trim, drop empties, dedupe case-insensitively keeping the first spelling.
pub fn normalize_channels(channels: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for channel in channels {
        let name = channel.trim();
        if name.is_empty() {
            continue;
        }
        let lowered = name.to_lowercase();
        if seen.contains(&lowered) {
            continue;
        }
        seen.push(lowered);
        out.push(name.to_string());
    }
    out
}

/// Recursive default merge. Returns whether anything changed.
pub fn merge_defaults(target: &mut Mapping, defaults: &Mapping) -> bool {
    let mut changed = false;
    for (key, default) in defaults {
        match target.get_mut(key) {
            None => {
                target.insert(key.clone(), default.clone());
                changed = true;
            },
            Some(Value::Mapping(existing)) => {
                if let Value::Mapping(default_map) = default {
                    changed |= merge_defaults(existing, default_map);
                }
            },
            Some(Value::Sequence(existing)) => {
                if let Value::Sequence(default_seq) = default {
                    for item in default_seq {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                            changed = true;
                        }
                    }
                }
            },
            // Scalars (and type mismatches) keep the existing value.
            Some(_) => {},
        }
    }
    changed
}
