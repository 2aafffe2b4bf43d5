// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use irc_bot_rs::{
    cfg::{config::BotConfig, store::ConfigStore},
    client::client::{IrcClient, next_backoff},
    handlers::{
        ClientHandle, CommandSpec, Handler, HandlerCtor, MessageEvent,
        manager::HandlerManager,
    },
    models::message::Message,
};
use serde_yaml::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    time::{Instant, timeout},
};

use super::{base_doc, handle_of, make_client, make_client_with, next_line};

async fn feed(client: &Arc<IrcClient>, line: &str) {
    client.handle_message(Message::parse(line)).await;
}

fn disk_channels(store: &ConfigStore) -> Vec<String> {
    store
        .read()
        .expect("read config")
        .get("channels")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn ping_is_answered_before_later_traffic() {
    let (_dir, client, _manager) = make_client();

    feed(&client, "PING :abc").await;
    client.send_raw("PRIVMSG #a :later").await.expect("send");

    assert_eq!(next_line(&client).await, "PONG :abc");
    assert_eq!(next_line(&client).await, "PRIVMSG #a :later");
}

#[tokio::test]
async fn ping_without_token_answers_with_placeholder() {
    let (_dir, client, _manager) = make_client();
    feed(&client, "PING").await;
    assert_eq!(next_line(&client).await, "PONG :server");
}

#[tokio::test(start_paused = true)]
async fn welcome_walks_channels_with_pacing() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, super::BASE_CONFIG).expect("write config");

    let mut doc = base_doc();
    doc.insert(
        "channels".into(),
        serde_yaml::from_str("[\"#a\", \"#b\"]").expect("yaml"),
    );
    let cfg = BotConfig::from_document(doc).expect("valid config");
    let store = ConfigStore::new(&path);
    let manager = Arc::new(HandlerManager::new(
        Vec::<(&str, HandlerCtor)>::new(),
        store.clone(),
    ));
    let client = IrcClient::new(cfg, store, manager);

    let start = Instant::now();
    feed(&client, ":irc.example.net 001 ebba :Welcome").await;

    assert_eq!(next_line(&client).await, "JOIN #a");
    assert_eq!(next_line(&client).await, "JOIN #b");
    // The second join waits out join_delay_secs; the first does not.
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn nick_collision_appends_underscores_until_accepted() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":irc.example.net 433 * ebba :Nickname is already in use").await;
    assert_eq!(next_line(&client).await, "NICK ebba_");

    feed(&client, ":irc.example.net 433 * ebba_ :Nickname is already in use").await;
    assert_eq!(next_line(&client).await, "NICK ebba__");

    assert_eq!(client.current_nickname(), "ebba__");
}

#[tokio::test]
async fn self_join_is_remembered_in_memory_and_on_disk() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":ebba!e@h JOIN :#b").await;

    assert_eq!(client.snapshot().channels, vec!["#a", "#b"]);
    assert_eq!(disk_channels(client.config_store()), vec!["#a", "#b"]);
}

#[tokio::test]
async fn foreign_join_leaves_channels_alone() {
    let (_dir, client, _manager) = make_client();
    feed(&client, ":guest!g@h JOIN :#b").await;
    assert_eq!(client.snapshot().channels, vec!["#a"]);
}

#[tokio::test]
async fn self_part_and_kick_forget_the_channel() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":ebba!e@h PART #a").await;
    assert!(client.snapshot().channels.is_empty());
    assert!(disk_channels(client.config_store()).is_empty());

    feed(&client, ":ebba!e@h JOIN :#b").await;
    feed(&client, ":op!o@h KICK #b ebba :begone").await;
    assert!(client.snapshot().channels.is_empty());
}

#[tokio::test]
async fn self_nick_change_updates_runtime_nickname() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":guest!g@h NICK :guest2").await;
    assert_eq!(client.current_nickname(), "ebba");

    feed(&client, ":ebba!e@h NICK :ebba2").await;
    assert_eq!(client.current_nickname(), "ebba2");
}

#[tokio::test]
async fn ignored_nicks_are_dropped_entirely() {
    let (_dir, client, _manager) = make_client();
    let handle = handle_of(&client);
    handle.set_ignored_nicks(["troll".to_string()].into_iter().collect());

    feed(&client, ":Troll!t@h PRIVMSG #a :.health").await;
    assert!(client.outbound.is_empty());
}

#[tokio::test]
async fn privileged_commands_require_owner_access() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":stranger!s@h PRIVMSG #a :.say #b hi").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG #a :You do not have permission for that command."
    );
}

#[tokio::test]
async fn auth_binds_host_then_privileged_commands_work() {
    let (_dir, client, _manager) = make_client();

    // Scenario: private auth from op!o@h1 persists the host before replying.
    feed(&client, ":op!o@h1 PRIVMSG ebba :.auth s3cr3t").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG op :Authentication successful."
    );
    let doc = client.config_store().read().expect("read config");
    let hosts: Vec<&str> = doc
        .get("owner_nicks")
        .and_then(Value::as_sequence)
        .and_then(|seq| seq.first())
        .and_then(Value::as_mapping)
        .and_then(|entry| entry.get("hosts"))
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    assert_eq!(hosts, vec!["o@h1"]);

    // Same ident@host is now trusted without re-auth.
    feed(&client, ":op!o@h1 PRIVMSG #a :.say #target hello there").await;
    assert_eq!(next_line(&client).await, "PRIVMSG #target :hello there");
    assert_eq!(next_line(&client).await, "PRIVMSG #a :Message sent.");
}

#[tokio::test]
async fn auth_outside_private_message_is_rejected() {
    let (_dir, client, _manager) = make_client();
    feed(&client, ":op!o@h1 PRIVMSG #a :.auth s3cr3t").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG #a :Authentication must be sent in a private message."
    );
}

#[tokio::test]
async fn wrong_password_does_not_bind_and_does_not_leak() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":op!o@h1 PRIVMSG ebba :.auth wrong").await;
    assert_eq!(next_line(&client).await, "PRIVMSG op :Authentication failed.");

    // Unknown nick reads exactly the same.
    feed(&client, ":nobody!n@h PRIVMSG ebba :.auth s3cr3t").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG nobody :Authentication failed."
    );

    let doc = client.config_store().read().expect("read config");
    let bound = doc
        .get("owner_nicks")
        .and_then(Value::as_sequence)
        .and_then(|seq| seq.first())
        .and_then(Value::as_mapping)
        .and_then(|entry| entry.get("hosts"))
        .is_some();
    assert!(!bound);
}

#[tokio::test]
async fn whoami_reports_identity_and_access() {
    let (_dir, client, _manager) = make_client();
    feed(&client, ":op!o@h1 PRIVMSG #a :.whoami").await;
    let reply = next_line(&client).await;
    assert!(reply.contains("You are op (o@h1)"), "got: {reply}");
    assert!(reply.contains("Owner access: no"), "got: {reply}");
}

#[tokio::test]
async fn plugins_and_help_with_empty_registry() {
    let (_dir, client, _manager) = make_client();

    feed(&client, ":n!u@h PRIVMSG #a :.plugins").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG #a :Enabled plugins: none | Disabled plugins: none"
    );

    feed(&client, ":n!u@h PRIVMSG #a :.help").await;
    assert_eq!(next_line(&client).await, "PRIVMSG #a :No commands registered.");
}

#[tokio::test]
async fn health_reports_a_compact_snapshot() {
    let (_dir, client, _manager) = make_client();
    feed(&client, ":n!u@h PRIVMSG #a :.status").await;
    let reply = next_line(&client).await;
    assert!(reply.contains("Channels: 1"), "got: {reply}");
    assert!(reply.contains("Send queue:"), "got: {reply}");
    assert!(reply.contains("Handlers: 0 enabled"), "got: {reply}");
}

// A handler that records every event it sees.
struct CaptureHandler;

static CAPTURED: StdMutex<Vec<(String, String, String)>> =
    StdMutex::new(Vec::new());

#[async_trait]
impl Handler for CaptureHandler {
    fn name(&self) -> &'static str {
        "capture"
    }

    async fn on_message(
        &self,
        _bot: Arc<dyn ClientHandle>,
        event: MessageEvent,
    ) -> Result<()> {
        CAPTURED.lock().expect("captured lock").push((
            "message".to_string(),
            event.user,
            event.text,
        ));
        Ok(())
    }

    async fn on_part(
        &self,
        _bot: Arc<dyn ClientHandle>,
        user: String,
        channel: String,
        _reason: String,
    ) -> Result<()> {
        CAPTURED
            .lock()
            .expect("captured lock")
            .push(("part".to_string(), user, channel));
        Ok(())
    }
}

fn capture_ctor() -> Arc<dyn Handler> {
    Arc::new(CaptureHandler)
}

async fn wait_for_captures(want: usize) -> Vec<(String, String, String)> {
    for _ in 0..100 {
        {
            let captured = CAPTURED.lock().expect("captured lock");
            if captured.len() >= want {
                return captured.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("captured events never reached {want}");
}

#[tokio::test]
async fn broadcasts_reach_handlers_including_empty_text_and_part() {
    CAPTURED.lock().expect("captured lock").clear();
    let (_dir, client, manager) =
        make_client_with(vec![("capture", capture_ctor as HandlerCtor)]);
    let handle = handle_of(&client);
    manager.load("capture", &handle).await.expect("load");

    // Empty trailing is delivered as an empty-text event.
    feed(&client, ":n!u@h PRIVMSG #a :").await;
    let events = wait_for_captures(1).await;
    assert_eq!(events[0], ("message".into(), "n!u@h".into(), String::new()));

    // PART dispatches to handlers even for foreign users.
    feed(&client, ":guest!g@h PART #a :bye").await;
    let events = wait_for_captures(2).await;
    assert_eq!(events[1], ("part".into(), "guest!g@h".into(), "#a".into()));
}

// A handler that registers a greeting command with an alias.
struct GreeterHandler;

#[async_trait]
impl Handler for GreeterHandler {
    fn name(&self) -> &'static str {
        "greeter"
    }

    async fn on_load(&self, bot: &Arc<dyn ClientHandle>) -> Result<()> {
        bot.manager().register_command(CommandSpec {
            name: "hello".to_string(),
            aliases: vec!["hi".to_string()],
            help: "say hello".to_string(),
            handler: "greeter".to_string(),
            func: Arc::new(|bot, inv| -> irc_bot_rs::handlers::CommandFuture {
                Box::pin(async move {
                    bot.privmsg(&inv.channel, "hello!").await
                })
            }),
        })
    }
}

fn greeter_ctor() -> Arc<dyn Handler> {
    Arc::new(GreeterHandler)
}

#[tokio::test]
async fn registered_commands_dispatch_through_the_router() {
    let (_dir, client, manager) =
        make_client_with(vec![("greeter", greeter_ctor as HandlerCtor)]);
    let handle = handle_of(&client);
    manager.load("greeter", &handle).await.expect("load");

    feed(&client, ":n!u@h PRIVMSG #a :.hi").await;
    assert_eq!(next_line(&client).await, "PRIVMSG #a :hello!");

    feed(&client, ":n!u@h PRIVMSG #a :.help hello").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG #a :hello (aliases: hi): say hello"
    );
}

#[tokio::test]
async fn ignore_handler_end_to_end() {
    let (_dir, client, manager) = make_client_with(vec![(
        "ignore",
        irc_bot_rs::handlers::BUILTIN_HANDLERS["ignore"],
    )]);
    let handle = handle_of(&client);
    manager.load("ignore", &handle).await.expect("load");

    // Bind the owner, then ignore a nick.
    feed(&client, ":op!o@h1 PRIVMSG ebba :.auth s3cr3t").await;
    assert_eq!(
        next_line(&client).await,
        "PRIVMSG op :Authentication successful."
    );
    feed(&client, ":op!o@h1 PRIVMSG #a :.ignore Troll").await;
    assert_eq!(next_line(&client).await, "PRIVMSG #a :Now ignoring Troll.");

    let doc = client.config_store().read().expect("read config");
    let persisted: Vec<&str> = doc
        .get("plugins")
        .and_then(Value::as_mapping)
        .and_then(|p| p.get("ignore"))
        .and_then(Value::as_mapping)
        .and_then(|s| s.get("ignored_nicks"))
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    assert_eq!(persisted, vec!["troll"]);

    // The ignored nick is now dropped by the router.
    feed(&client, ":troll!t@h PRIVMSG #a :.health").await;
    assert!(client.outbound.is_empty());
}

#[test]
fn backoff_schedule_doubles_to_the_cap() {
    let max = Duration::from_secs(8);
    let mut backoff = Duration::from_secs(1);
    let mut waits = Vec::new();
    for _ in 0..5 {
        waits.push(backoff.as_secs());
        backoff = next_backoff(backoff, max);
    }
    assert_eq!(waits, vec![1, 2, 4, 8, 8]);
}

#[tokio::test]
async fn end_to_end_session_with_a_fake_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");

    let dir = tempfile::TempDir::new().expect("tempdir");
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, super::BASE_CONFIG).expect("write config");

    let mut doc = base_doc();
    doc.insert("server".into(), "127.0.0.1".into());
    doc.insert("port".into(), u64::from(addr.port()).into());
    let cfg = BotConfig::from_document(doc).expect("valid config");
    let store = ConfigStore::new(&path);
    let manager = Arc::new(HandlerManager::new(
        Vec::<(&str, HandlerCtor)>::new(),
        store.clone(),
    ));
    let client = IrcClient::new(cfg, store, manager);

    let run_task = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let (socket, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept in time")
        .expect("accept");
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    async fn read_line(
        lines: &mut tokio::io::Lines<
            BufReader<tokio::net::tcp::OwnedReadHalf>,
        >,
    ) -> String {
        timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("line in time")
            .expect("read line")
            .expect("stream open")
    }

    assert_eq!(read_line(&mut lines).await, "NICK ebba");
    assert_eq!(read_line(&mut lines).await, "USER ebba 0 * :Ebba Bot");

    write_half
        .write_all(b"PING :tok\r\n")
        .await
        .expect("server write");
    assert_eq!(read_line(&mut lines).await, "PONG :tok");

    write_half
        .write_all(b":irc.example.net 001 ebba :Welcome\r\n")
        .await
        .expect("server write");
    assert_eq!(read_line(&mut lines).await, "JOIN #a");

    client.stop();
    timeout(Duration::from_secs(5), run_task)
        .await
        .expect("run returns")
        .expect("join")
        .expect("clean shutdown");
}
