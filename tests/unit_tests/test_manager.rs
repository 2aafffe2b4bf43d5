// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use irc_bot_rs::{
    cfg::{config::BotConfig, store::ConfigStore},
    client::client::IrcClient,
    handlers::{
        ClientHandle, CommandSpec, Handler, HandlerCtor, MessageEvent,
        manager::HandlerManager,
    },
    models::errors::RegistryError,
};
use serde_yaml::Value;
use serial_test::serial;
use tempfile::TempDir;
use tokio::time::Instant;

use super::base_doc;

/// A handler whose `on_message` sleeps long enough to observe task
/// accounting. Concurrency is tracked through process-wide counters.
struct SleepyHandler;

static SLEEPY_RUNNING: AtomicUsize = AtomicUsize::new(0);
static SLEEPY_PEAK: AtomicUsize = AtomicUsize::new(0);
static SLEEPY_DONE: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
impl Handler for SleepyHandler {
    fn name(&self) -> &'static str {
        "sleepy"
    }

    async fn on_message(
        &self,
        _bot: Arc<dyn ClientHandle>,
        _event: MessageEvent,
    ) -> Result<()> {
        let running = SLEEPY_RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
        SLEEPY_PEAK.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        SLEEPY_RUNNING.fetch_sub(1, Ordering::SeqCst);
        SLEEPY_DONE.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FlakyHandler;

static FLAKY_LOADS: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
impl Handler for FlakyHandler {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn on_load(&self, _bot: &Arc<dyn ClientHandle>) -> Result<()> {
        if FLAKY_LOADS.fetch_add(1, Ordering::SeqCst) > 0 {
            bail!("flaky load refused");
        }
        Ok(())
    }
}

struct QuietHandler;

#[async_trait]
impl Handler for QuietHandler {
    fn name(&self) -> &'static str {
        "quiet"
    }
}

fn sleepy_ctor() -> Arc<dyn Handler> {
    Arc::new(SleepyHandler)
}

fn flaky_ctor() -> Arc<dyn Handler> {
    Arc::new(FlakyHandler)
}

fn quiet_ctor() -> Arc<dyn Handler> {
    Arc::new(QuietHandler)
}

fn setup(
    ctors: Vec<(&'static str, HandlerCtor)>,
    timeout: Duration,
    max_concurrent: usize,
) -> (TempDir, Arc<HandlerManager>, Arc<dyn ClientHandle>) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, super::BASE_CONFIG).expect("write config");

    let cfg = BotConfig::from_document(base_doc()).expect("valid config");
    let store = ConfigStore::new(&path);
    let manager = Arc::new(HandlerManager::with_limits(
        ctors,
        store.clone(),
        timeout,
        max_concurrent,
    ));
    let client = IrcClient::new(cfg, store, manager.clone());
    let handle: Arc<dyn ClientHandle> = client;
    (dir, manager, handle)
}

fn noop_spec(handler: &str, name: &str, aliases: &[&str]) -> CommandSpec {
    CommandSpec {
        name: name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        help: "does nothing".to_string(),
        handler: handler.to_string(),
        func: Arc::new(|_bot, _inv| -> irc_bot_rs::handlers::CommandFuture {
            Box::pin(async { Ok(()) })
        }),
    }
}

async fn wait_for_tasks(manager: &HandlerManager, name: &str, want: usize) {
    for _ in 0..2000 {
        if manager.task_count(name) == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "handler '{name}' never reached {want} tasks (now {})",
        manager.task_count(name)
    );
}

#[tokio::test]
async fn double_load_fails_with_already_loaded() {
    let (_dir, manager, bot) = setup(
        vec![("quiet", quiet_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("quiet", &bot).await.expect("first load");

    let err = manager.load("quiet", &bot).await.unwrap_err();
    let registry_err = err
        .downcast_ref::<RegistryError>()
        .expect("typed registry error");
    assert!(matches!(registry_err, RegistryError::AlreadyLoaded(n) if n == "quiet"));
}

#[tokio::test]
async fn unknown_handler_is_reported() {
    let (_dir, manager, bot) = setup(Vec::new(), Duration::from_secs(10), 100);
    let err = manager.load("ghost", &bot).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));

    let err = manager.unload("ghost", &bot).await.unwrap_err();
    let registry_err = err
        .downcast_ref::<RegistryError>()
        .expect("typed registry error");
    assert!(matches!(registry_err, RegistryError::NotLoaded(_)));
}

#[tokio::test]
async fn load_persists_the_enabled_flag() {
    let (_dir, manager, bot) = setup(
        vec![("quiet", quiet_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("quiet", &bot).await.expect("load");

    let doc = bot.store().read().expect("read");
    let enabled = doc
        .get("plugins")
        .and_then(Value::as_mapping)
        .and_then(|p| p.get("quiet"))
        .and_then(Value::as_mapping)
        .and_then(|e| e.get("enabled"))
        .and_then(Value::as_bool);
    assert_eq!(enabled, Some(true));

    manager.unload("quiet", &bot).await.expect("unload");
    let doc = bot.store().read().expect("read");
    let enabled = doc
        .get("plugins")
        .and_then(Value::as_mapping)
        .and_then(|p| p.get("quiet"))
        .and_then(Value::as_mapping)
        .and_then(|e| e.get("enabled"))
        .and_then(Value::as_bool);
    assert_eq!(enabled, Some(false));
}

#[tokio::test]
async fn load_all_honours_disabled_flags() {
    let (_dir, manager, bot) = setup(
        vec![
            ("quiet", quiet_ctor as HandlerCtor),
            ("sleepy", sleepy_ctor as HandlerCtor),
        ],
        Duration::from_secs(10),
        100,
    );
    bot.store()
        .set_handler_enabled("sleepy".to_string(), false)
        .await
        .expect("persist");

    manager.load_all(&bot).await;

    let (enabled, disabled) = manager.list_status();
    assert_eq!(enabled, vec!["quiet"]);
    assert_eq!(disabled, vec!["sleepy"]);
}

#[tokio::test]
async fn command_collisions_are_symmetric() {
    let (_dir, manager, bot) = setup(
        vec![("quiet", quiet_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("quiet", &bot).await.expect("load");

    manager
        .register_command(noop_spec("quiet", "first", &["one"]))
        .expect("register");

    // Primary colliding with an existing alias.
    let err = manager
        .register_command(noop_spec("quiet", "one", &[]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::DuplicateCommand(n)) if n == "one"
    ));

    // Alias colliding with an existing primary.
    let err = manager
        .register_command(noop_spec("quiet", "second", &["first"]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::DuplicateCommand(n)) if n == "first"
    ));
}

#[tokio::test]
async fn aliases_resolve_to_the_primary_spec() {
    let (_dir, manager, bot) = setup(
        vec![("quiet", quiet_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("quiet", &bot).await.expect("load");
    manager
        .register_command(noop_spec("quiet", "Seen", &["LastSeen"]))
        .expect("register");

    let spec = manager.lookup_command("lastseen").expect("alias resolves");
    assert_eq!(spec.name, "seen");
    // Primary names are exactly the keys that map to themselves.
    assert_eq!(manager.command_names(), vec!["seen"]);
}

#[tokio::test]
async fn registration_requires_a_loaded_owner() {
    let (_dir, manager, _bot) = setup(Vec::new(), Duration::from_secs(10), 100);
    let err = manager
        .register_command(noop_spec("ghost", "cmd", &[]))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegistryError>(),
        Some(RegistryError::NotLoaded(_))
    ));
}

#[tokio::test(start_paused = true)]
#[serial]
async fn unload_cancels_in_flight_tasks() {
    SLEEPY_RUNNING.store(0, Ordering::SeqCst);
    let (_dir, manager, bot) = setup(
        vec![("sleepy", sleepy_ctor as HandlerCtor)],
        Duration::from_secs(60),
        100,
    );
    manager.load("sleepy", &bot).await.expect("load");

    for _ in 0..3 {
        manager.dispatch_message(&bot, "n!u@h", "#a", "hello");
    }
    wait_for_tasks(&manager, "sleepy", 3).await;

    manager.unload("sleepy", &bot).await.expect("unload");
    assert_eq!(manager.task_count("sleepy"), 0);

    // Unloaded handlers see no further dispatches.
    manager.dispatch_message(&bot, "n!u@h", "#a", "hello");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.task_count("sleepy"), 0);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn slow_handlers_are_timed_out() {
    SLEEPY_DONE.store(0, Ordering::SeqCst);
    let (_dir, manager, bot) = setup(
        vec![("sleepy", sleepy_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("sleepy", &bot).await.expect("load");

    let start = Instant::now();
    manager.dispatch_message(&bot, "n!u@h", "#a", "hello");
    wait_for_tasks(&manager, "sleepy", 1).await;
    wait_for_tasks(&manager, "sleepy", 0).await;

    // Cancelled by the 10s timeout, well before the 30s sleep finishes.
    assert!(start.elapsed() < Duration::from_secs(30));
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(SLEEPY_DONE.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
#[serial]
async fn global_semaphore_caps_concurrency() {
    SLEEPY_RUNNING.store(0, Ordering::SeqCst);
    SLEEPY_PEAK.store(0, Ordering::SeqCst);
    let (_dir, manager, bot) = setup(
        vec![("sleepy", sleepy_ctor as HandlerCtor)],
        Duration::from_secs(60),
        2,
    );
    manager.load("sleepy", &bot).await.expect("load");

    for _ in 0..5 {
        manager.dispatch_message(&bot, "n!u@h", "#a", "hello");
    }
    wait_for_tasks(&manager, "sleepy", 5).await;
    wait_for_tasks(&manager, "sleepy", 0).await;

    assert!(SLEEPY_PEAK.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn reload_failure_leaves_the_handler_disabled() {
    FLAKY_LOADS.store(0, Ordering::SeqCst);
    let (_dir, manager, bot) = setup(
        vec![("flaky", flaky_ctor as HandlerCtor)],
        Duration::from_secs(10),
        100,
    );
    manager.load("flaky", &bot).await.expect("first load");

    let err = manager.reload("flaky", &bot).await.unwrap_err();
    assert!(err.to_string().contains("flaky"));

    let (enabled, disabled) = manager.list_status();
    assert!(enabled.is_empty());
    assert_eq!(disabled, vec!["flaky"]);
}

#[tokio::test]
async fn underscored_names_are_skipped_at_discovery() {
    let (_dir, manager, bot) = setup(
        vec![
            ("_reserved", quiet_ctor as HandlerCtor),
            ("quiet", quiet_ctor as HandlerCtor),
        ],
        Duration::from_secs(10),
        100,
    );
    manager.load_all(&bot).await;

    let (enabled, disabled) = manager.list_status();
    assert_eq!(enabled, vec!["quiet"]);
    assert!(disabled.is_empty());
}
