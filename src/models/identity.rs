// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Owner identities and source-prefix parsing.
//!
//! An owner is recognised by nickname and authenticated either by password
//! (`auth`) or by a previously bound `ident@host`. Host comparison is
//! case-insensitive and treats a leading `~` on the ident portion as
//! equivalent to its absence.

use anyhow::{Result, bail};
use serde_yaml::{Mapping, Value};

use crate::models::errors::ConfigError;

/// Splits a source prefix into `(nick, ident@host)`.
///
/// The second element is `None` when the prefix carries no usable
/// `ident@host` part (server prefixes, truncated user prefixes).
pub fn parse_identity(prefix: &str) -> (Option<String>, Option<String>) {
    let Some((nick, rest)) = prefix.split_once('!') else {
        let nick = (!prefix.is_empty()).then(|| prefix.to_string());
        return (nick, None);
    };
    let Some((ident, host)) = rest.split_once('@') else {
        return (Some(nick.to_string()), None);
    };
    let ident = ident.trim();
    let host = host.trim();
    let ident_host =
        (!ident.is_empty() && !host.is_empty()).then(|| format!("{ident}@{host}"));
    (Some(nick.to_string()), ident_host)
}

/// Compares two `ident@host` strings under the owner-host equivalence:
/// case-insensitive on both portions, `~`-prefix on the ident ignored.
pub fn hosts_equivalent(a: &str, b: &str) -> bool {
    fn split(s: &str) -> (&str, &str) {
        s.split_once('@').unwrap_or((s, ""))
    }
    let (ident_a, host_a) = split(a);
    let (ident_b, host_b) = split(b);
    let ident_a = ident_a.strip_prefix('~').unwrap_or(ident_a);
    let ident_b = ident_b.strip_prefix('~').unwrap_or(ident_b);
    ident_a.eq_ignore_ascii_case(ident_b) && host_a.eq_ignore_ascii_case(host_b)
}

/// One privileged identity. Created at config load; hosts grow through
/// first-use binding only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRecord {
    /// Display nickname as written in the config.
    pub nick: String,
    /// Password accepted by `auth`, if any.
    pub password: Option<String>,
    /// Trusted `ident@host` strings.
    pub hosts: Vec<String>,
}

impl OwnerRecord {
    /// True when `ident_host` is already trusted under the equivalence rules.
    pub fn has_host(&self, ident_host: &str) -> bool {
        self.hosts.iter().any(|h| hosts_equivalent(h, ident_host))
    }

    /// Adds a trusted host. Returns false when empty or already present.
    pub fn add_host(&mut self, ident_host: &str) -> bool {
        let ident_host = ident_host.trim();
        if ident_host.is_empty() || self.has_host(ident_host) {
            return false;
        }
        self.hosts.push(ident_host.to_string());
        true
    }
}

/// In-memory owner set, keyed by lowercased nickname. Config order is
/// preserved for round-tripping.
#[derive(Debug, Clone, Default)]
pub struct OwnerStore {
    records: Vec<OwnerRecord>,
}

impl OwnerStore {
    /// Builds the store from the `owner_nicks` config section.
    ///
    /// Each entry must be a mapping with a non-empty `nick`, an optional
    /// `password` string and an optional `hosts` list; entries with neither
    /// password nor hosts can never be authorised and are rejected.
    pub fn from_config(section: &Value) -> Result<Self> {
        let empty = Vec::new();
        let entries = match section {
            Value::Null => &empty,
            Value::Sequence(seq) => seq,
            _ => bail!(ConfigError::WrongType {
                key: "owner_nicks".to_string(),
                expected: "list",
            }),
        };

        let mut records: Vec<OwnerRecord> = Vec::with_capacity(entries.len());
        for entry in entries {
            let map = match entry {
                Value::Mapping(map) => map,
                Value::String(nick) => bail!(
                    "owner entries must include at least a password or hosts; \
                     convert '{nick}' to a mapping with 'nick', 'password' \
                     and/or 'hosts'"
                ),
                _ => continue,
            };

            let nick = map
                .get("nick")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .ok_or(ConfigError::OwnerMissingNick)?
                .to_string();

            let password = match map.get("password") {
                None | Some(Value::Null) => None,
                Some(Value::String(p)) => Some(p.clone()),
                Some(_) => bail!(ConfigError::WrongType {
                    key: format!("owner_nicks.{nick}.password"),
                    expected: "string",
                }),
            };

            let mut hosts: Vec<String> = Vec::new();
            match map.get("hosts") {
                None | Some(Value::Null) => {},
                Some(Value::Sequence(seq)) => {
                    for host in seq {
                        if let Some(h) = host.as_str() {
                            let h = h.trim();
                            if !h.is_empty()
                                && !hosts.iter().any(|e| hosts_equivalent(e, h))
                            {
                                hosts.push(h.to_string());
                            }
                        }
                    }
                },
                Some(_) => bail!(ConfigError::WrongType {
                    key: format!("owner_nicks.{nick}.hosts"),
                    expected: "list",
                }),
            }

            if hosts.is_empty() && password.is_none() {
                bail!(ConfigError::OwnerUnreachable(nick));
            }
            if records
                .iter()
                .any(|r| r.nick.eq_ignore_ascii_case(&nick))
            {
                bail!(ConfigError::DuplicateOwner(nick));
            }

            records.push(OwnerRecord {
                nick,
                password,
                hosts,
            });
        }

        Ok(Self { records })
    }

    pub fn get(&self, nick: &str) -> Option<&OwnerRecord> {
        self.records
            .iter()
            .find(|r| r.nick.eq_ignore_ascii_case(nick))
    }

    pub fn get_mut(&mut self, nick: &str) -> Option<&mut OwnerRecord> {
        self.records
            .iter_mut()
            .find(|r| r.nick.eq_ignore_ascii_case(nick))
    }

    /// Display nicknames in config order.
    pub fn nicks(&self) -> Vec<String> {
        self.records.iter().map(|r| r.nick.clone()).collect()
    }

    pub fn records(&self) -> &[OwnerRecord] {
        &self.records
    }

    /// Password check only; binding is a separate, persisted step.
    pub fn password_matches(&self, nick: &str, password: &str) -> bool {
        self.get(nick)
            .and_then(|r| r.password.as_deref())
            .is_some_and(|p| p == password)
    }

    /// Owner-access check for a raw source prefix: the prefix must parse into
    /// both a nick and an `ident@host`, the nick must have a record, and the
    /// host must already be trusted.
    pub fn has_access(&self, prefix: &str) -> bool {
        let (Some(nick), Some(ident_host)) = parse_identity(prefix) else {
            return false;
        };
        self.get(&nick).is_some_and(|r| r.has_host(&ident_host))
    }

    /// Serialises the records back into `owner_nicks` entries. Hosts are
    /// emitted sorted so repeated persists are byte-stable.
    pub fn to_config_entries(&self) -> Vec<Value> {
        self.records
            .iter()
            .map(|record| {
                let mut entry = Mapping::new();
                entry.insert("nick".into(), record.nick.clone().into());
                if let Some(password) = &record.password {
                    entry.insert("password".into(), password.clone().into());
                }
                if !record.hosts.is_empty() {
                    let mut hosts = record.hosts.clone();
                    hosts.sort();
                    entry.insert(
                        "hosts".into(),
                        Value::Sequence(
                            hosts.into_iter().map(Value::from).collect(),
                        ),
                    );
                }
                Value::Mapping(entry)
            })
            .collect()
    }
}
