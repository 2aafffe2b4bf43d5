// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::models::{errors::ConfigError, identity::OwnerStore};

/// Sliding-window admission parameters: at most `count` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateParams {
    pub count: usize,
    pub window: Duration,
}

/// Validated runtime view of the config document.
///
/// The raw document (after env overrides) is kept alongside the typed
/// fields: handlers observe it through read snapshots, and handler-specific
/// sections live under its `plugins` key.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub nickname: String,
    pub username: String,
    pub realname: String,
    pub channels: Vec<String>,
    /// Command sigil distinguishing commands from chat text.
    pub prefix: String,
    pub owners: OwnerStore,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub request_timeout: Duration,
    /// Pause between consecutive initial JOINs.
    pub join_delay: Duration,
    /// Global PRIVMSG window.
    pub privmsg_rate: RateParams,
    /// Per-target PRIVMSG window.
    pub per_target_rate: RateParams,
    /// Full document after env overrides.
    pub doc: Mapping,
}

impl BotConfig {
    /// Loads the configuration from YAML, applies environment overrides,
    /// validates it, and returns the ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        ensure!(path.exists(), "config file not found: {}", path.display());
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut doc = parse_document(&s)?;
        apply_env_overrides(&mut doc)?;
        Self::from_document(doc)
    }

    /// Validates a document and extracts the typed view. Overrides must
    /// already be applied; they are never written back to disk.
    pub fn from_document(doc: Mapping) -> Result<Self> {
        let server = require_str(&doc, "server")?;
        let port = require_int(&doc, "port")?;
        ensure!(
            (1..=u64::from(u16::MAX)).contains(&port),
            "config key 'port' is out of range: {port}"
        );
        let use_tls = require_bool(&doc, "use_tls")?;
        let nickname = require_str(&doc, "nickname")?;
        let username = require_str(&doc, "username")?;
        let realname = require_str(&doc, "realname")?;
        let channels = require_str_list(&doc, "channels")?;
        let prefix = require_str(&doc, "prefix")?;
        ensure!(!prefix.is_empty(), "config key 'prefix' must not be empty");
        ensure!(!nickname.is_empty(), "config key 'nickname' must not be empty");

        let owners_section = require_value(&doc, "owner_nicks")?;
        ensure!(owners_section.is_sequence(), ConfigError::WrongType {
            key: "owner_nicks".to_string(),
            expected: "list",
        });
        let owners = OwnerStore::from_config(owners_section)
            .context("invalid 'owner_nicks' section")?;

        let reconnect_delay =
            Duration::from_secs(require_int(&doc, "reconnect_delay_secs")?);
        let request_timeout =
            Duration::from_secs(require_int(&doc, "request_timeout_secs")?);
        let max_reconnect_delay = Duration::from_secs(optional_u64(
            &doc,
            "max_reconnect_delay_secs",
            60,
        )?);
        let join_delay = Duration::from_secs_f64(optional_f64(
            &doc,
            "join_delay_secs",
            0.4,
        )?);

        let privmsg_rate = RateParams {
            count: optional_u64(&doc, "privmsg_rate_count", 4)? as usize,
            window: Duration::from_secs_f64(optional_f64(
                &doc,
                "privmsg_rate_window_secs",
                2.0,
            )?),
        };
        let per_target_rate = RateParams {
            count: optional_u64(&doc, "per_target_rate_count", 2)? as usize,
            window: Duration::from_secs_f64(optional_f64(
                &doc,
                "per_target_rate_window_secs",
                5.0,
            )?),
        };

        if let Some(plugins) = doc.get("plugins") {
            ensure!(plugins.is_mapping(), ConfigError::WrongType {
                key: "plugins".to_string(),
                expected: "mapping",
            });
        }

        Ok(Self {
            server,
            port: port as u16,
            use_tls,
            nickname,
            username,
            realname,
            channels,
            prefix,
            owners,
            reconnect_delay,
            max_reconnect_delay,
            request_timeout,
            join_delay,
            privmsg_rate,
            per_target_rate,
            doc,
        })
    }
}

/// Parses the raw text into a mapping. An empty document is an empty
/// mapping; a non-mapping root is rejected.
pub fn parse_document(s: &str) -> Result<Mapping> {
    let value: Value =
        serde_yaml::from_str(s).context("failed to parse config YAML")?;
    match value {
        Value::Null => Ok(Mapping::new()),
        Value::Mapping(map) => Ok(map),
        _ => bail!("configuration root must be a mapping"),
    }
}

/// Applies environment overrides to the loaded document, before validation.
/// Overridden values live only in memory.
pub fn apply_env_overrides(doc: &mut Mapping) -> Result<()> {
    for var in ["SERVER", "NICKNAME", "USERNAME", "REALNAME", "PREFIX"] {
        if let Ok(value) = env::var(var) {
            doc.insert(var.to_ascii_lowercase().into(), value.into());
        }
    }

    if let Ok(value) = env::var("PORT") {
        let port: u64 = value.parse().map_err(|_| ConfigError::BadEnvValue {
            var: "PORT",
            value: value.clone(),
        })?;
        doc.insert("port".into(), port.into());
    }

    if let Ok(value) = env::var("USE_TLS") {
        let on = matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        );
        doc.insert("use_tls".into(), on.into());
    }

    if let Ok(value) = env::var("CHANNELS") {
        let channels: Vec<Value> = value
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Value::from)
            .collect();
        doc.insert("channels".into(), Value::Sequence(channels));
    }

    // Informational only: logged, never turned into owner records (a bare
    // nickname has neither password nor bindable host).
    if let Ok(value) = env::var("OWNER_NICKS") {
        info!("OWNER_NICKS override noted: {value}");
    }

    for (var, key) in [
        ("RECONNECT_DELAY_SECS", "reconnect_delay_secs"),
        ("REQUEST_TIMEOUT_SECS", "request_timeout_secs"),
    ] {
        if let Ok(value) = env::var(var) {
            let secs: u64 = value.parse().map_err(|_| ConfigError::BadEnvValue {
                var,
                value: value.clone(),
            })?;
            doc.insert(key.into(), secs.into());
        }
    }

    Ok(())
}

fn require_value<'a>(doc: &'a Mapping, key: &str) -> Result<&'a Value> {
    doc.get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()).into())
}

fn require_str(doc: &Mapping, key: &str) -> Result<String> {
    require_value(doc, key)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            ConfigError::WrongType {
                key: key.to_string(),
                expected: "string",
            }
            .into()
        })
}

fn require_int(doc: &Mapping, key: &str) -> Result<u64> {
    require_value(doc, key)?.as_u64().ok_or_else(|| {
        ConfigError::WrongType {
            key: key.to_string(),
            expected: "integer",
        }
        .into()
    })
}

fn require_bool(doc: &Mapping, key: &str) -> Result<bool> {
    require_value(doc, key)?.as_bool().ok_or_else(|| {
        ConfigError::WrongType {
            key: key.to_string(),
            expected: "boolean",
        }
        .into()
    })
}

fn require_str_list(doc: &Mapping, key: &str) -> Result<Vec<String>> {
    let wrong = || -> anyhow::Error {
        ConfigError::WrongType {
            key: key.to_string(),
            expected: "list of strings",
        }
        .into()
    };
    let seq = require_value(doc, key)?.as_sequence().ok_or_else(wrong)?;
    seq.iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(wrong))
        .collect()
}

fn optional_u64(doc: &Mapping, key: &str, default: u64) -> Result<u64> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            ConfigError::WrongType {
                key: key.to_string(),
                expected: "integer",
            }
            .into()
        }),
    }
}

fn optional_f64(doc: &Mapping, key: &str, default: f64) -> Result<f64> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_f64().ok_or_else(|| {
            ConfigError::WrongType {
                key: key.to_string(),
                expected: "number",
            }
            .into()
        }),
    }
}
