// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handler lifecycle and dispatch.
//!
//! Every callback invocation runs as its own task, tagged with the owning
//! handler: the task set is tracked per handler so unloading cancels and
//! drains exactly that handler's in-flight work. A global semaphore caps
//! concurrency across all handlers and each task is wrapped in a timeout.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde_yaml::Value;
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    cfg::store::ConfigStore,
    handlers::{
        ClientHandle, CommandInvocation, CommandSpec, Handler, HandlerCtor,
        MessageEvent,
    },
    models::errors::RegistryError,
};

/// Cap on concurrently running handler tasks, across all handlers.
pub const MAX_CONCURRENT_HANDLERS: usize = 100;
/// Per-invocation timeout for handler callbacks.
pub const HANDLER_TIMEOUT_SECS: u64 = 10;

/// A live handler and its task accounting.
struct LoadedUnit {
    handler: Arc<dyn Handler>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

pub struct HandlerManager {
    ctors: BTreeMap<String, HandlerCtor>,
    store: ConfigStore,
    /// Loaded handlers in load order; broadcast order is deterministic.
    loaded: StdMutex<Vec<(String, Arc<LoadedUnit>)>>,
    commands: StdMutex<HashMap<String, Arc<CommandSpec>>>,
    semaphore: Arc<Semaphore>,
    task_timeout: Duration,
}

impl HandlerManager {
    pub fn new<I, S>(ctors: I, store: ConfigStore) -> Self
    where
        I: IntoIterator<Item = (S, HandlerCtor)>,
        S: Into<String>,
    {
        Self::with_limits(
            ctors,
            store,
            Duration::from_secs(HANDLER_TIMEOUT_SECS),
            MAX_CONCURRENT_HANDLERS,
        )
    }

    pub fn with_limits<I, S>(
        ctors: I,
        store: ConfigStore,
        task_timeout: Duration,
        max_concurrent: usize,
    ) -> Self
    where
        I: IntoIterator<Item = (S, HandlerCtor)>,
        S: Into<String>,
    {
        Self {
            ctors: ctors.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            store,
            loaded: StdMutex::new(Vec::new()),
            commands: StdMutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            task_timeout,
        }
    }

    fn loaded_guard(&self) -> MutexGuard<'_, Vec<(String, Arc<LoadedUnit>)>> {
        self.loaded.lock().expect("handler list lock poisoned")
    }

    fn commands_guard(
        &self,
    ) -> MutexGuard<'_, HashMap<String, Arc<CommandSpec>>> {
        self.commands.lock().expect("command map lock poisoned")
    }

    fn find(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        self.loaded_guard()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, unit)| unit.clone())
    }

    fn loaded_snapshot(&self) -> Vec<(String, Arc<LoadedUnit>)> {
        self.loaded_guard().clone()
    }

    /// Removes the handler entry and every command spec it owns.
    fn remove_entry(&self, name: &str) -> Option<Arc<LoadedUnit>> {
        let unit = {
            let mut loaded = self.loaded_guard();
            let idx = loaded.iter().position(|(n, _)| n == name)?;
            loaded.remove(idx).1
        };
        self.commands_guard().retain(|_, spec| spec.handler != name);
        Some(unit)
    }

    /// Discovers and loads handlers at startup, honouring the persisted
    /// `plugins.<name>.enabled` flags. Absent flags mean enabled and get
    /// recorded on load. Failures are logged, never fatal.
    pub async fn load_all(&self, bot: &Arc<dyn ClientHandle>) {
        let doc = match self.store.read_async().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("failed to read config for handler discovery: {e:#}");
                return;
            },
        };
        let names: Vec<String> = self.ctors.keys().cloned().collect();
        for name in names {
            if name.starts_with('_') {
                continue;
            }
            let enabled = doc
                .get("plugins")
                .and_then(Value::as_mapping)
                .and_then(|plugins| plugins.get(name.as_str()))
                .and_then(Value::as_mapping)
                .and_then(|entry| entry.get("enabled"))
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if !enabled {
                info!("handler '{name}' disabled in config");
                continue;
            }
            if let Err(e) = self.load(&name, bot).await {
                warn!("failed to load handler '{name}': {e:#}");
            }
        }
    }

    /// Loads a handler: merge its declared defaults into the persisted
    /// config, run `on_load`, then mark it enabled.
    pub async fn load(&self, name: &str, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        if self.find(name).is_some() {
            bail!(RegistryError::AlreadyLoaded(name.to_string()));
        }
        let Some(ctor) = self.ctors.get(name) else {
            bail!(RegistryError::Unknown(name.to_string()));
        };
        let handler = ctor();

        let defaults = handler.defaults();
        if !defaults.is_empty() {
            self.store
                .merge_handler_defaults(defaults)
                .await
                .with_context(|| {
                    format!("failed to merge defaults for handler '{name}'")
                })?;
        }

        // The entry must exist before on_load so the handler can register
        // commands against itself.
        let unit = Arc::new(LoadedUnit {
            handler: handler.clone(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        });
        self.loaded_guard().push((name.to_string(), unit));

        if let Err(e) = handler.on_load(bot).await {
            self.remove_entry(name);
            return Err(e.context(format!("on_load failed for handler '{name}'")));
        }

        if let Err(e) = self
            .store
            .set_handler_enabled(name.to_string(), true)
            .await
        {
            warn!("failed to persist enabled flag for '{name}': {e:#}");
        }
        info!("loaded handler '{name}'");
        Ok(())
    }

    /// Unloads a handler: drop its command specs, run `on_unload`, cancel
    /// and drain its task set, then mark it disabled.
    pub async fn unload(&self, name: &str, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        let Some(unit) = self.remove_entry(name) else {
            bail!(RegistryError::NotLoaded(name.to_string()));
        };

        if let Err(e) = unit.handler.on_unload(bot).await {
            warn!("error in on_unload for handler '{name}': {e:#}");
        }

        unit.cancel.cancel();
        unit.tasks.close();
        unit.tasks.wait().await;

        if let Err(e) = self
            .store
            .set_handler_enabled(name.to_string(), false)
            .await
        {
            warn!("failed to persist disabled flag for '{name}': {e:#}");
        }
        info!("unloaded handler '{name}'");
        Ok(())
    }

    /// Destroy + construct. A load failure after the unload leaves the
    /// handler disabled and surfaces the error.
    pub async fn reload(&self, name: &str, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        self.unload(name, bot).await?;
        self.load(name, bot).await
    }

    /// Cancels and drains every handler's tasks without touching persisted
    /// enabled flags; used on process stop.
    pub async fn shutdown(&self, bot: &Arc<dyn ClientHandle>) {
        let units = {
            let mut loaded = self.loaded_guard();
            std::mem::take(&mut *loaded)
        };
        self.commands_guard().clear();
        for (name, unit) in units {
            if let Err(e) = unit.handler.on_unload(bot).await {
                warn!("error in on_unload for handler '{name}': {e:#}");
            }
            unit.cancel.cancel();
            unit.tasks.close();
            unit.tasks.wait().await;
        }
    }

    /// `(enabled, disabled)` handler names. Disabled covers every known unit
    /// that is not currently loaded.
    pub fn list_status(&self) -> (Vec<String>, Vec<String>) {
        let enabled: Vec<String> =
            self.loaded_guard().iter().map(|(n, _)| n.clone()).collect();
        let disabled: Vec<String> = self
            .ctors
            .keys()
            .filter(|n| !n.starts_with('_') && !enabled.contains(n))
            .cloned()
            .collect();
        (enabled, disabled)
    }

    /// Number of in-flight tasks owned by a loaded handler.
    pub fn task_count(&self, name: &str) -> usize {
        self.find(name).map_or(0, |unit| unit.tasks.len())
    }

    /// Registers a named command. Fails when any provided name collides with
    /// an existing one (primary or alias, symmetrically), or when the owning
    /// handler is not loaded.
    pub fn register_command(&self, spec: CommandSpec) -> Result<()> {
        if self.find(&spec.handler).is_none() {
            bail!(RegistryError::NotLoaded(spec.handler.clone()));
        }
        let spec = CommandSpec {
            name: spec.name.to_lowercase(),
            aliases: spec
                .aliases
                .iter()
                .map(|a| a.to_lowercase())
                .collect(),
            ..spec
        };
        if spec.name.is_empty() {
            bail!("command primary name must not be empty");
        }

        let mut names = vec![spec.name.clone()];
        for alias in &spec.aliases {
            if !names.contains(alias) {
                names.push(alias.clone());
            }
        }

        let mut commands = self.commands_guard();
        for name in &names {
            if commands.contains_key(name) {
                bail!(RegistryError::DuplicateCommand(name.clone()));
            }
        }
        let spec = Arc::new(spec);
        for name in names {
            commands.insert(name, spec.clone());
        }
        Ok(())
    }

    /// Resolves a (lowercased) command name or alias.
    pub fn lookup_command(&self, name: &str) -> Option<Arc<CommandSpec>> {
        self.commands_guard().get(&name.to_lowercase()).cloned()
    }

    /// Primary names, sorted, for `help`.
    pub fn command_names(&self) -> Vec<String> {
        let commands = self.commands_guard();
        let mut names: Vec<String> = commands
            .iter()
            .filter(|(name, spec)| **name == spec.name)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Runs a registered command as a task owned by its handler.
    pub fn dispatch_command(
        &self,
        bot: &Arc<dyn ClientHandle>,
        spec: &Arc<CommandSpec>,
        invocation: CommandInvocation,
    ) {
        let Some(unit) = self.find(&spec.handler) else {
            debug!(
                "command '{}' owner '{}' no longer loaded",
                spec.name, spec.handler
            );
            return;
        };
        let bot = bot.clone();
        let func = spec.func.clone();
        self.spawn_handler_task(&spec.handler, &unit, "command", async move {
            func(bot, invocation).await
        });
    }

    pub fn dispatch_message(
        &self,
        bot: &Arc<dyn ClientHandle>,
        user: &str,
        channel: &str,
        text: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let bot = bot.clone();
            let event = MessageEvent {
                user: user.to_string(),
                channel: channel.to_string(),
                text: text.to_string(),
            };
            self.spawn_handler_task(&name, &unit, "on_message", async move {
                handler.on_message(bot, event).await
            });
        }
    }

    pub fn dispatch_join(
        &self,
        bot: &Arc<dyn ClientHandle>,
        user: &str,
        channel: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let (bot, user, channel) =
                (bot.clone(), user.to_string(), channel.to_string());
            self.spawn_handler_task(&name, &unit, "on_join", async move {
                handler.on_join(bot, user, channel).await
            });
        }
    }

    pub fn dispatch_part(
        &self,
        bot: &Arc<dyn ClientHandle>,
        user: &str,
        channel: &str,
        reason: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let (bot, user, channel, reason) = (
                bot.clone(),
                user.to_string(),
                channel.to_string(),
                reason.to_string(),
            );
            self.spawn_handler_task(&name, &unit, "on_part", async move {
                handler.on_part(bot, user, channel, reason).await
            });
        }
    }

    pub fn dispatch_nick(
        &self,
        bot: &Arc<dyn ClientHandle>,
        user: &str,
        new_nick: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let (bot, user, new_nick) =
                (bot.clone(), user.to_string(), new_nick.to_string());
            self.spawn_handler_task(&name, &unit, "on_nick", async move {
                handler.on_nick(bot, user, new_nick).await
            });
        }
    }

    pub fn dispatch_kick(
        &self,
        bot: &Arc<dyn ClientHandle>,
        channel: &str,
        target: &str,
        kicker: &str,
        reason: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let (bot, channel, target, kicker, reason) = (
                bot.clone(),
                channel.to_string(),
                target.to_string(),
                kicker.to_string(),
                reason.to_string(),
            );
            self.spawn_handler_task(&name, &unit, "on_kick", async move {
                handler.on_kick(bot, channel, target, kicker, reason).await
            });
        }
    }

    pub fn dispatch_quit(
        &self,
        bot: &Arc<dyn ClientHandle>,
        user: &str,
        reason: &str,
    ) {
        for (name, unit) in self.loaded_snapshot() {
            let handler = unit.handler.clone();
            let (bot, user, reason) =
                (bot.clone(), user.to_string(), reason.to_string());
            self.spawn_handler_task(&name, &unit, "on_quit", async move {
                handler.on_quit(bot, user, reason).await
            });
        }
    }

    /// Spawns one callback invocation into the owning handler's task set,
    /// gated by the global semaphore and wrapped in the per-task timeout.
    fn spawn_handler_task<F>(
        &self,
        handler_name: &str,
        unit: &Arc<LoadedUnit>,
        event: &'static str,
        fut: F,
    ) where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if unit.tasks.is_closed() {
            return;
        }
        let semaphore = self.semaphore.clone();
        let cancel = unit.cancel.clone();
        let task_timeout = self.task_timeout;
        let name = handler_name.to_string();

        let _ = unit.tasks.spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = semaphore.acquire_owned() => permit,
            };
            let Ok(_permit) = permit else {
                return;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(handler = %name, event, "handler task cancelled");
                },
                res = tokio::time::timeout(task_timeout, fut) => match res {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => {
                        warn!(handler = %name, event, "handler error: {e:#}");
                    },
                    Err(_) => {
                        warn!(
                            handler = %name,
                            event,
                            "handler timed out after {}s",
                            task_timeout.as_secs()
                        );
                    },
                },
            }
        });
    }
}
