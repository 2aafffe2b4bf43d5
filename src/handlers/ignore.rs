// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Owner-only commands to ignore noisy users.
//!
//! The active set lives in the handler, is mirrored into the client's
//! runtime ignore set, and is persisted under `plugins.ignore.ignored_nicks`.

use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::Result;
use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::handlers::{
    ClientHandle, CommandFn, CommandFuture, CommandInvocation, CommandSpec,
    Handler,
};

pub struct IgnoreHandler {
    ignored: Arc<StdMutex<BTreeSet<String>>>,
}

impl IgnoreHandler {
    pub fn new() -> Self {
        Self {
            ignored: Arc::new(StdMutex::new(BTreeSet::new())),
        }
    }
}

impl Default for IgnoreHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn ignored_from_doc(doc: &Mapping) -> BTreeSet<String> {
    doc.get("plugins")
        .and_then(Value::as_mapping)
        .and_then(|plugins| plugins.get("ignore"))
        .and_then(Value::as_mapping)
        .and_then(|section| section.get("ignored_nicks"))
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Mirrors the set into the client and persists it. Persistence failures
/// only warn; the runtime set stays authoritative until the next write.
async fn sync_ignored(bot: &Arc<dyn ClientHandle>, ignored: BTreeSet<String>) {
    bot.set_ignored_nicks(ignored.iter().cloned().collect::<HashSet<_>>());
    let serialized: Vec<Value> =
        ignored.into_iter().map(Value::from).collect();
    if let Err(e) = bot
        .store()
        .persist_handler_value(
            "ignore".to_string(),
            "ignored_nicks".to_string(),
            Value::Sequence(serialized),
        )
        .await
    {
        warn!("failed to persist ignore list: {e:#}");
    }
}

fn ignore_command(state: Arc<StdMutex<BTreeSet<String>>>) -> CommandFn {
    Arc::new(move |bot, inv: CommandInvocation| -> CommandFuture {
        let state = state.clone();
        Box::pin(async move {
            if !bot.has_owner_access(&inv.user) {
                bot.privmsg(
                    &inv.channel,
                    "You do not have permission for that command.",
                )
                .await?;
                return Ok(());
            }
            let Some(nick) = inv.args.first() else {
                let sigil = bot.command_prefix();
                bot.privmsg(&inv.channel, &format!("Usage: {sigil}ignore <nick>"))
                    .await?;
                return Ok(());
            };
            let normalized = nick.trim().to_lowercase();
            if normalized.is_empty() {
                bot.privmsg(&inv.channel, "Please provide a valid nickname.")
                    .await?;
                return Ok(());
            }

            let (added, snapshot) = {
                let mut ignored =
                    state.lock().expect("ignore state lock poisoned");
                let added = ignored.insert(normalized);
                (added, ignored.clone())
            };
            if !added {
                bot.privmsg(&inv.channel, &format!("Already ignoring {nick}."))
                    .await?;
                return Ok(());
            }
            sync_ignored(&bot, snapshot).await;
            bot.privmsg(&inv.channel, &format!("Now ignoring {nick}."))
                .await?;
            Ok(())
        })
    })
}

fn unignore_command(state: Arc<StdMutex<BTreeSet<String>>>) -> CommandFn {
    Arc::new(move |bot, inv: CommandInvocation| -> CommandFuture {
        let state = state.clone();
        Box::pin(async move {
            if !bot.has_owner_access(&inv.user) {
                bot.privmsg(
                    &inv.channel,
                    "You do not have permission for that command.",
                )
                .await?;
                return Ok(());
            }
            let Some(nick) = inv.args.first() else {
                let sigil = bot.command_prefix();
                bot.privmsg(
                    &inv.channel,
                    &format!("Usage: {sigil}unignore <nick>"),
                )
                .await?;
                return Ok(());
            };
            let normalized = nick.trim().to_lowercase();

            let (removed, snapshot) = {
                let mut ignored =
                    state.lock().expect("ignore state lock poisoned");
                let removed = ignored.remove(&normalized);
                (removed, ignored.clone())
            };
            if !removed {
                bot.privmsg(
                    &inv.channel,
                    &format!("{nick} was not being ignored."),
                )
                .await?;
                return Ok(());
            }
            sync_ignored(&bot, snapshot).await;
            bot.privmsg(&inv.channel, &format!("No longer ignoring {nick}."))
                .await?;
            Ok(())
        })
    })
}

fn ignored_command(state: Arc<StdMutex<BTreeSet<String>>>) -> CommandFn {
    Arc::new(move |bot, inv: CommandInvocation| -> CommandFuture {
        let state = state.clone();
        Box::pin(async move {
            if !bot.has_owner_access(&inv.user) {
                bot.privmsg(
                    &inv.channel,
                    "You do not have permission for that command.",
                )
                .await?;
                return Ok(());
            }
            let ignored: Vec<String> = {
                let guard = state.lock().expect("ignore state lock poisoned");
                guard.iter().cloned().collect()
            };
            let reply = if ignored.is_empty() {
                "No nicknames are currently ignored.".to_string()
            } else {
                format!("Ignored nicknames: {}", ignored.join(", "))
            };
            bot.privmsg(&inv.channel, &reply).await?;
            Ok(())
        })
    })
}

#[async_trait]
impl Handler for IgnoreHandler {
    fn name(&self) -> &'static str {
        "ignore"
    }

    fn defaults(&self) -> Mapping {
        let mut section = Mapping::new();
        section.insert("enabled".into(), true.into());
        section.insert("ignored_nicks".into(), Value::Sequence(Vec::new()));
        let mut plugins = Mapping::new();
        plugins.insert("ignore".into(), Value::Mapping(section));
        let mut root = Mapping::new();
        root.insert("plugins".into(), Value::Mapping(plugins));
        root
    }

    async fn on_load(&self, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        let doc = bot.config_snapshot().await;
        let ignored = ignored_from_doc(&doc);
        *self.ignored.lock().expect("ignore state lock poisoned") =
            ignored.clone();
        bot.set_ignored_nicks(ignored.iter().cloned().collect::<HashSet<_>>());

        let manager = bot.manager();
        manager.register_command(CommandSpec {
            name: "ignore".to_string(),
            aliases: Vec::new(),
            help: "ignore <nick> - drop messages from a nick (owner only)"
                .to_string(),
            handler: "ignore".to_string(),
            func: ignore_command(self.ignored.clone()),
        })?;
        manager.register_command(CommandSpec {
            name: "unignore".to_string(),
            aliases: Vec::new(),
            help: "unignore <nick> - stop ignoring a nick (owner only)"
                .to_string(),
            handler: "ignore".to_string(),
            func: unignore_command(self.ignored.clone()),
        })?;
        manager.register_command(CommandSpec {
            name: "ignored".to_string(),
            aliases: Vec::new(),
            help: "list ignored nicks (owner only)".to_string(),
            handler: "ignore".to_string(),
            func: ignored_command(self.ignored.clone()),
        })?;

        info!("ignore plugin loaded with {} ignored nick(s)", ignored.len());
        Ok(())
    }

    async fn on_unload(&self, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        self.ignored
            .lock()
            .expect("ignore state lock poisoned")
            .clear();
        bot.set_ignored_nicks(HashSet::new());
        info!("ignore plugin unloaded");
        Ok(())
    }
}
