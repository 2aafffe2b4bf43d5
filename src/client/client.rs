// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection engine and send path.
//!
//! One connection at a time: a reader loop that hands wire-ordered messages
//! to the router, a writer loop draining the bounded outbound queue, and a
//! supervising `run` loop that redials with exponential backoff until asked
//! to stop.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::BytesMut;
use serde_yaml::Mapping;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    time::{Instant, sleep},
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig as TlsConfig, RootCertStore, pki_types::ServerName},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::{
        config::{BotConfig, RateParams},
        store::ConfigStore,
    },
    client::{
        common::{BoxedStream, io_with_timeout},
        queue::{QUEUE_MAX, SendQueue},
        rate::{RateGate, TargetGates},
        state::{ClientState, StateSnapshot},
    },
    handlers::{ClientHandle, manager::HandlerManager},
    models::{
        identity::{OwnerStore, parse_identity},
        message::Message,
    },
};

/// Next reconnect delay after a failed attempt: double, capped.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// A single-server IRC client with handler dispatch.
pub struct IrcClient {
    pub(crate) cfg: BotConfig,
    store: ConfigStore,
    pub(crate) manager: Arc<HandlerManager>,
    /// Runtime state; never held across an await.
    pub state: StdMutex<ClientState>,
    owners: StdMutex<OwnerStore>,
    /// Lowercased nicks whose messages are dropped by the router.
    ignored: StdMutex<HashSet<String>>,
    /// Outbound line queue feeding the writer.
    pub outbound: SendQueue,
    global_gate: RateGate,
    target_gates: TargetGates,
    /// Process-stop token.
    cancel: CancellationToken,
    /// Token of the current connection; replaced on every dial.
    session_cancel: StdMutex<CancellationToken>,
}

impl IrcClient {
    pub fn new(
        cfg: BotConfig,
        store: ConfigStore,
        manager: Arc<HandlerManager>,
    ) -> Arc<Self> {
        let state = ClientState {
            nickname: cfg.nickname.clone(),
            channels: cfg.channels.clone(),
            ..ClientState::default()
        };
        Arc::new(Self {
            global_gate: RateGate::new(cfg.privmsg_rate),
            target_gates: TargetGates::new(cfg.per_target_rate),
            owners: StdMutex::new(cfg.owners.clone()),
            state: StdMutex::new(state),
            ignored: StdMutex::new(HashSet::new()),
            outbound: SendQueue::new(QUEUE_MAX),
            cancel: CancellationToken::new(),
            session_cancel: StdMutex::new(CancellationToken::new()),
            cfg,
            store,
            manager,
        })
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    pub fn handler_manager(&self) -> &Arc<HandlerManager> {
        &self.manager
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.store
    }

    /// Requests a single orderly stop: cancels the engine, the current
    /// connection and every pending backoff sleep.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.session_cancel().cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn session_cancel(&self) -> CancellationToken {
        self.session_cancel
            .lock()
            .expect("session token lock poisoned")
            .clone()
    }

    fn state_guard(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("client state lock poisoned")
    }

    fn owners_guard(&self) -> MutexGuard<'_, OwnerStore> {
        self.owners.lock().expect("owner store lock poisoned")
    }

    fn ignored_guard(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ignored.lock().expect("ignore set lock poisoned")
    }

    pub fn owners_snapshot(&self) -> OwnerStore {
        self.owners_guard().clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state_guard().snapshot(self.outbound.len())
    }

    /// True when the router should drop messages from this nick.
    pub fn is_ignored(&self, nick: &str) -> bool {
        self.ignored_guard().contains(&nick.to_lowercase())
    }

    /// Connect and stay connected, backing off exponentially on failures,
    /// until [`stop`](Self::stop) is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let base = self.cfg.reconnect_delay.max(Duration::from_secs(1));
        let mut backoff = base;

        while !self.cancel.is_cancelled() {
            let wait = match self.dial().await {
                Ok(stream) => {
                    // A successful connection resets the backoff.
                    backoff = base;
                    if let Err(e) = self.run_session(stream).await {
                        warn!("connection error: {e:#}");
                    }
                    self.state_guard().last_disconnect = Some(Instant::now());
                    backoff
                },
                Err(e) => {
                    warn!("connection attempt failed: {e:#}");
                    let wait = backoff;
                    backoff = next_backoff(backoff, self.cfg.max_reconnect_delay);
                    wait
                },
            };

            if self.cancel.is_cancelled() {
                break;
            }
            info!("reconnecting in {} seconds", wait.as_secs());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(wait) => {},
            }
        }
        Ok(())
    }

    /// Opens the TCP socket and, when configured, wraps it in TLS with the
    /// platform trust store and `server_hostname = server`.
    async fn dial(&self) -> Result<BoxedStream> {
        let addr = format!("{}:{}", self.cfg.server, self.cfg.port);
        info!("connecting to {addr} (tls={})", self.cfg.use_tls);

        let stream = io_with_timeout(
            "dial",
            TcpStream::connect(addr),
            self.cfg.request_timeout,
            &self.cancel,
        )
        .await?;
        stream.set_nodelay(true)?;

        if !self.cfg.use_tls {
            return Ok(Box::new(stream));
        }

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            warn!("trust store entry skipped: {e}");
        }
        roots.add_parsable_certificates(native.certs);
        let tls_config = TlsConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.cfg.server.clone())
            .context("server name is not usable for TLS verification")?;

        let tls = io_with_timeout(
            "tls handshake",
            connector.connect(server_name, stream),
            self.cfg.request_timeout,
            &self.cancel,
        )
        .await?;
        Ok(Box::new(tls))
    }

    /// Runs one established connection to completion: registers, spawns the
    /// writer, and reads lines until EOF, error or stop.
    async fn run_session(self: &Arc<Self>, stream: BoxedStream) -> Result<()> {
        self.outbound.clear();
        let conn_cancel = self.cancel.child_token();
        *self
            .session_cancel
            .lock()
            .expect("session token lock poisoned") = conn_cancel.clone();
        self.state_guard().last_connect = Some(Instant::now());

        self.register().await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let writer = {
            let me = Arc::clone(self);
            let token = conn_cancel.clone();
            tokio::spawn(async move { me.writer_loop(write_half, token).await })
        };

        let res = self.reader_loop(read_half, conn_cancel.clone()).await;
        conn_cancel.cancel();
        let _ = writer.await;
        res
    }

    /// `NICK` then `USER`, queued ahead of any other traffic.
    async fn register(&self) -> Result<()> {
        let nickname = self.state_guard().nickname.clone();
        self.send_raw(&format!("NICK {nickname}")).await?;
        self.send_raw(&format!(
            "USER {} 0 * :{}",
            self.cfg.username, self.cfg.realname
        ))
        .await
    }

    async fn writer_loop(
        &self,
        mut write_half: WriteHalf<BoxedStream>,
        cancel: CancellationToken,
    ) {
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = self.outbound.pop() => line,
            };
            debug!("> {line}");

            let mut wire = line.into_bytes();
            wire.extend_from_slice(b"\r\n");
            let res = async {
                write_half.write_all(&wire).await?;
                write_half.flush().await
            }
            .await;
            if let Err(e) = res {
                warn!("connection lost during write: {e}");
                // Tear the whole connection down.
                cancel.cancel();
                return;
            }
        }
    }

    /// Reads and routes lines in wire order; one message is processed to
    /// completion (through dispatch/spawn) before the next is read.
    async fn reader_loop(
        self: &Arc<Self>,
        mut read_half: ReadHalf<BoxedStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut scratch = BytesMut::with_capacity(8 * 1024);
        loop {
            while let Some(pos) = scratch.iter().position(|&b| b == b'\n') {
                let raw = scratch.split_to(pos + 1);
                let message = Message::decode(&raw);
                if message.is_empty() {
                    continue;
                }
                debug!("< {}", String::from_utf8_lossy(&raw).trim_end());
                self.handle_message(message).await;
            }

            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = read_half.read_buf(&mut scratch) => {
                    res.context("socket read failed")?
                },
            };
            if n == 0 {
                warn!("server closed the connection");
                return Ok(());
            }
        }
    }

    /// Queues a raw line (no CRLF). Never blocks: a full queue drops the
    /// line with a warning.
    pub async fn send_raw(&self, line: &str) -> Result<()> {
        if !self.outbound.push(line.to_string()) {
            warn!("send queue full, dropping line: {line}");
        }
        Ok(())
    }

    /// Rate-limited message send: the per-target gate first, then the
    /// global gate, then the queue.
    pub async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        self.target_gates.gate_for(target).acquire().await;
        self.global_gate.acquire().await;
        self.send_raw(&format!("PRIVMSG {target} :{text}")).await
    }

    pub async fn join_channel(&self, channel: &str) -> Result<()> {
        self.send_raw(&format!("JOIN {channel}")).await?;
        self.remember_channel(channel).await;
        Ok(())
    }

    pub async fn part_channel(&self, channel: &str, reason: &str) -> Result<()> {
        if reason.is_empty() {
            self.send_raw(&format!("PART {channel}")).await?;
        } else {
            self.send_raw(&format!("PART {channel} :{reason}")).await?;
        }
        self.forget_channel(channel).await;
        Ok(())
    }

    /// Replaces the per-target window parameters and resets the gate map.
    pub fn set_per_target_rate(&self, params: RateParams) {
        self.target_gates.reconfigure(params);
    }

    /// Adds a channel to the runtime list and persists the list. A failed
    /// persist is logged; the next successful write reconciles.
    pub(crate) async fn remember_channel(&self, channel: &str) {
        let channels = {
            let mut state = self.state_guard();
            if !state.remember_channel(channel) {
                return;
            }
            state.channels.clone()
        };
        if let Err(e) = self.store.persist_channels(channels).await {
            warn!("failed to persist channels: {e:#}");
        }
    }

    pub(crate) async fn forget_channel(&self, channel: &str) {
        let channels = {
            let mut state = self.state_guard();
            if !state.forget_channel(channel) {
                return;
            }
            state.channels.clone()
        };
        if let Err(e) = self.store.persist_channels(channels).await {
            warn!("failed to persist channels: {e:#}");
        }
    }

    pub fn has_owner_access(&self, prefix: &str) -> bool {
        self.owners_guard().has_access(prefix)
    }

    /// Password authentication with first-use host binding.
    ///
    /// The bind is transactional: the new record set is persisted before the
    /// caller is considered trusted, so a crash before the write leaves no
    /// phantom bind. Unknown nick and wrong password are indistinguishable
    /// to the caller.
    pub async fn authenticate_owner(&self, prefix: &str, password: &str) -> bool {
        let (Some(nick), Some(ident_host)) = parse_identity(prefix) else {
            return false;
        };

        let entries = {
            let owners = self.owners_guard();
            let Some(record) = owners.get(&nick) else {
                return false;
            };
            if !record
                .password
                .as_deref()
                .is_some_and(|p| p == password)
            {
                return false;
            }
            if record.has_host(&ident_host) {
                return true;
            }
            let mut next = owners.clone();
            if let Some(record) = next.get_mut(&nick) {
                record.add_host(&ident_host);
            }
            next.to_config_entries()
        };

        match self.store.persist_owner_records(entries).await {
            Ok(_) => {
                if let Some(record) = self.owners_guard().get_mut(&nick) {
                    record.add_host(&ident_host);
                }
                true
            },
            Err(e) => {
                warn!("failed to persist owner records: {e:#}");
                false
            },
        }
    }
}

#[async_trait::async_trait]
impl ClientHandle for IrcClient {
    fn nickname(&self) -> String {
        self.state_guard().nickname.clone()
    }

    fn command_prefix(&self) -> String {
        self.cfg.prefix.clone()
    }

    fn request_timeout(&self) -> Duration {
        self.cfg.request_timeout
    }

    fn owner_nicks(&self) -> Vec<String> {
        self.owners_guard().nicks()
    }

    fn has_owner_access(&self, prefix: &str) -> bool {
        IrcClient::has_owner_access(self, prefix)
    }

    fn owner_identity(&self, prefix: &str) -> (Option<String>, Option<String>) {
        parse_identity(prefix)
    }

    fn ignored_nicks(&self) -> HashSet<String> {
        self.ignored_guard().clone()
    }

    fn set_ignored_nicks(&self, nicks: HashSet<String>) {
        *self.ignored_guard() = nicks;
    }

    fn manager(&self) -> Arc<HandlerManager> {
        self.manager.clone()
    }

    fn store(&self) -> ConfigStore {
        self.store.clone()
    }

    async fn config_snapshot(&self) -> Mapping {
        match self.store.read_async().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("failed to read config snapshot: {e:#}");
                self.cfg.doc.clone()
            },
        }
    }

    async fn privmsg(&self, target: &str, text: &str) -> Result<()> {
        IrcClient::privmsg(self, target, text).await
    }

    async fn send_raw(&self, line: &str) -> Result<()> {
        IrcClient::send_raw(self, line).await
    }

    async fn join(&self, channel: &str) -> Result<()> {
        self.join_channel(channel).await
    }

    async fn part(&self, channel: &str, reason: &str) -> Result<()> {
        self.part_channel(channel, reason).await
    }
}
