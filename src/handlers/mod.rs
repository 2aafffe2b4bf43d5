// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handler plug-points.
//!
//! A handler is a value implementing [`Handler`]; the set of available
//! handlers is fixed at link time through [`BUILTIN_HANDLERS`]. Loading
//! instantiates and wires a handler, unloading tears it down and cancels its
//! in-flight tasks. Handlers talk back to the client exclusively through the
//! [`ClientHandle`] contract.

use std::{
    collections::{BTreeMap, HashSet},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_yaml::Mapping;

use crate::cfg::store::ConfigStore;

/// Owner-only ignore list maintenance.
pub mod ignore;
/// Handler lifecycle, command registry and task accounting.
pub mod manager;

/// A PRIVMSG seen by `on_message` handlers.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Full source prefix (`nick!ident@host`).
    pub user: String,
    /// Where replies should go: the channel, or the sender's nick for
    /// private messages.
    pub channel: String,
    /// Message text; may be empty.
    pub text: String,
}

/// One invocation of a registered named command.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    /// Full source prefix of the caller.
    pub user: String,
    /// Reply target, same convention as [`MessageEvent::channel`].
    pub channel: String,
    /// Whitespace-split arguments after the command name.
    pub args: Vec<String>,
}

pub type CommandFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type CommandFn =
    Arc<dyn Fn(Arc<dyn ClientHandle>, CommandInvocation) -> CommandFuture + Send + Sync>;

/// A registered named command. Names are immutable after registration; the
/// primary name and every alias resolve to the same spec.
#[derive(Clone)]
pub struct CommandSpec {
    /// Primary name, lowercase.
    pub name: String,
    pub aliases: Vec<String>,
    pub help: String,
    /// Owning handler; its unload removes the spec.
    pub handler: String,
    pub func: CommandFn,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

/// The only contract handlers may rely on; the concrete client implements it.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Current server-assigned nickname.
    fn nickname(&self) -> String;
    /// Command sigil.
    fn command_prefix(&self) -> String;
    fn request_timeout(&self) -> Duration;
    fn owner_nicks(&self) -> Vec<String>;
    fn has_owner_access(&self, prefix: &str) -> bool;
    /// Splits a source prefix into `(nick, ident@host)`.
    fn owner_identity(&self, prefix: &str) -> (Option<String>, Option<String>);
    fn ignored_nicks(&self) -> HashSet<String>;
    fn set_ignored_nicks(&self, nicks: HashSet<String>);
    /// Registry access, primarily for command registration during `on_load`.
    fn manager(&self) -> Arc<manager::HandlerManager>;
    /// Persistence surface; handlers never touch the config file directly.
    fn store(&self) -> ConfigStore;
    /// Read snapshot of the persisted config document.
    async fn config_snapshot(&self) -> Mapping;

    async fn privmsg(&self, target: &str, text: &str) -> Result<()>;
    async fn send_raw(&self, line: &str) -> Result<()>;
    async fn join(&self, channel: &str) -> Result<()>;
    async fn part(&self, channel: &str, reason: &str) -> Result<()>;
}

/// A pluggable unit subscribing to events and/or registering named commands.
///
/// All callbacks default to no-ops; a handler implements what it needs.
/// Callbacks run as cancellable tasks: cancellation (unload, stop, timeout)
/// is a termination signal.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Config defaults merged into the persisted document on first load.
    fn defaults(&self) -> Mapping {
        Mapping::new()
    }

    async fn on_load(&self, _bot: &Arc<dyn ClientHandle>) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _bot: &Arc<dyn ClientHandle>) -> Result<()> {
        Ok(())
    }

    async fn on_message(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _event: MessageEvent,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_join(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _user: String,
        _channel: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_part(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _user: String,
        _channel: String,
        _reason: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_nick(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _user: String,
        _new_nick: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_kick(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _channel: String,
        _target: String,
        _kicker: String,
        _reason: String,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_quit(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _user: String,
        _reason: String,
    ) -> Result<()> {
        Ok(())
    }
}

pub type HandlerCtor = fn() -> Arc<dyn Handler>;

/// Handler units compiled into this binary. Names beginning with `_` are
/// reserved and skipped at discovery.
pub static BUILTIN_HANDLERS: Lazy<BTreeMap<&'static str, HandlerCtor>> =
    Lazy::new(|| {
        let mut map: BTreeMap<&'static str, HandlerCtor> = BTreeMap::new();
        map.insert("ignore", || Arc::new(ignore::IgnoreHandler::new()));
        map
    });
