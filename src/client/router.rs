// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbound event routing.
//!
//! The reader hands every parsed message here, one at a time and in wire
//! order. `PING` is answered before anything else can be queued; state
//! upkeep happens inline; handler work is spawned and never awaited, so one
//! slow handler cannot delay the next message.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::{
    client::client::IrcClient,
    handlers::{ClientHandle, CommandInvocation},
    models::{identity::parse_identity, message::Message},
};

/// Splits `.command arg arg` into a lowercased command and its arguments.
fn split_command(text: &str, sigil: &str) -> Option<(String, Vec<String>)> {
    let rest = text.strip_prefix(sigil)?;
    let mut parts = rest.split_whitespace();
    let command = parts.next()?.to_lowercase();
    let args = parts.map(str::to_string).collect();
    Some((command, args))
}

impl IrcClient {
    pub fn current_nickname(&self) -> String {
        self.snapshot().nickname
    }

    pub(crate) fn as_handle(self: &Arc<Self>) -> Arc<dyn ClientHandle> {
        Arc::clone(self) as Arc<dyn ClientHandle>
    }

    /// Routes one inbound message.
    pub async fn handle_message(self: &Arc<Self>, message: Message) {
        match message.command.as_str() {
            "" => {},
            "PING" => {
                // Answered inline, ahead of any traffic queued later; never
                // rate gated.
                let token = message.trailing.as_deref().unwrap_or("server");
                let _ = self.send_raw(&format!("PONG :{token}")).await;
            },
            "001" => self.join_initial_channels(),
            "433" => self.handle_nick_collision().await,
            "JOIN" => self.handle_join(message).await,
            "PART" => self.handle_part(message).await,
            "NICK" => self.handle_nick(message).await,
            "KICK" => self.handle_kick(message).await,
            "QUIT" => self.handle_quit(message).await,
            "PRIVMSG" => self.handle_privmsg(message).await,
            other => debug!("unhandled command {other}"),
        }
    }

    /// Walks the configured channels with `join_delay` pacing between JOINs
    /// (none before the first). Spawned so a long walk cannot delay PING
    /// replies; join failures never cancel subsequent joins.
    fn join_initial_channels(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let cancel = self.session_cancel();
        let delay = self.cfg.join_delay;
        tokio::spawn(async move {
            let channels = me.snapshot().channels;
            let mut first = true;
            for channel in channels {
                if !first && delay > Duration::ZERO {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(delay) => {},
                    }
                }
                if let Err(e) = me.join_channel(&channel).await {
                    warn!("failed to join {channel}: {e:#}");
                }
                first = false;
            }
        });
    }

    /// 433: append `_` and try again, as often as the server objects.
    async fn handle_nick_collision(&self) {
        let new_nick = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            error!("nickname {} already in use", state.nickname);
            state.nickname.push('_');
            state.nickname.clone()
        };
        let _ = self.send_raw(&format!("NICK {new_nick}")).await;
    }

    async fn handle_join(self: &Arc<Self>, message: Message) {
        let Message {
            prefix,
            params,
            trailing,
            ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        let channel = trailing
            .or_else(|| params.into_iter().next())
            .unwrap_or_default();
        if channel.is_empty() {
            return;
        }

        let nick = prefix.split('!').next().unwrap_or(&prefix);
        if nick.eq_ignore_ascii_case(&self.current_nickname()) {
            self.remember_channel(&channel).await;
        }

        let handle = self.as_handle();
        self.manager.dispatch_join(&handle, &prefix, &channel);
    }

    async fn handle_part(self: &Arc<Self>, message: Message) {
        let Message {
            prefix,
            params,
            trailing,
            ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        let Some(channel) = params.first().map(|c| c.trim().to_string()) else {
            return;
        };
        if channel.is_empty() {
            return;
        }
        let reason = trailing.unwrap_or_default();

        let nick = prefix.split('!').next().unwrap_or(&prefix);
        if nick.eq_ignore_ascii_case(&self.current_nickname()) {
            self.forget_channel(&channel).await;
        }

        let handle = self.as_handle();
        self.manager
            .dispatch_part(&handle, &prefix, &channel, &reason);
    }

    async fn handle_nick(self: &Arc<Self>, message: Message) {
        let Message {
            prefix,
            params,
            trailing,
            ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        let new_nick = trailing
            .or_else(|| params.into_iter().next())
            .unwrap_or_default();
        if new_nick.is_empty() {
            return;
        }

        let nick = prefix.split('!').next().unwrap_or(&prefix);
        if nick.eq_ignore_ascii_case(&self.current_nickname()) {
            self.state
                .lock()
                .expect("client state lock poisoned")
                .nickname = new_nick.clone();
        }

        let handle = self.as_handle();
        self.manager.dispatch_nick(&handle, &prefix, &new_nick);
    }

    async fn handle_kick(self: &Arc<Self>, message: Message) {
        let Message {
            prefix,
            mut params,
            trailing,
            ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        if params.len() < 2 {
            return;
        }
        let target = params.swap_remove(1);
        let channel = params.swap_remove(0);
        let reason = trailing.unwrap_or_default();

        if target.eq_ignore_ascii_case(&self.current_nickname()) {
            self.forget_channel(&channel).await;
        }

        let handle = self.as_handle();
        self.manager
            .dispatch_kick(&handle, &channel, &target, &prefix, &reason);
    }

    async fn handle_quit(self: &Arc<Self>, message: Message) {
        let Message {
            prefix, trailing, ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        let reason = trailing.unwrap_or_default();

        let handle = self.as_handle();
        self.manager.dispatch_quit(&handle, &prefix, &reason);
    }

    async fn handle_privmsg(self: &Arc<Self>, message: Message) {
        let Message {
            prefix,
            params,
            trailing,
            ..
        } = message;
        let Some(prefix) = prefix else {
            return;
        };
        let Some(text) = trailing else {
            return;
        };
        let target = params.into_iter().next().unwrap_or_default();

        let nick = prefix
            .split('!')
            .next()
            .unwrap_or(&prefix)
            .to_string();
        if self.is_ignored(&nick) {
            return;
        }

        let is_private = target.eq_ignore_ascii_case(&self.current_nickname());
        let channel = if is_private { nick.clone() } else { target };

        if let Some((command, args)) = split_command(&text, &self.cfg.prefix) {
            match self
                .handle_builtin_command(&nick, &prefix, &channel, is_private, &command, &args)
                .await
            {
                Ok(true) => {},
                Ok(false) => {
                    if let Some(spec) = self.manager.lookup_command(&command) {
                        let handle = self.as_handle();
                        self.manager.dispatch_command(&handle, &spec, CommandInvocation {
                            user: prefix.clone(),
                            channel: channel.clone(),
                            args,
                        });
                    }
                },
                Err(e) => warn!("builtin command '{command}' failed: {e:#}"),
            }
        }

        let handle = self.as_handle();
        self.manager
            .dispatch_message(&handle, &prefix, &channel, &text);
    }

    /// Built-in commands, checked before the registry. Returns whether the
    /// command was consumed.
    async fn handle_builtin_command(
        self: &Arc<Self>,
        nick: &str,
        prefix: &str,
        channel: &str,
        is_private: bool,
        command: &str,
        args: &[String],
    ) -> Result<bool> {
        let sigil = &self.cfg.prefix;
        match command {
            "auth" => {
                if !is_private {
                    self.privmsg(
                        channel,
                        "Authentication must be sent in a private message.",
                    )
                    .await?;
                    return Ok(true);
                }
                if args.is_empty() {
                    self.privmsg(nick, &format!("Usage: {sigil}auth <password>"))
                        .await?;
                    return Ok(true);
                }
                let password = args.join(" ");
                if self.authenticate_owner(prefix, &password).await {
                    self.privmsg(nick, "Authentication successful.").await?;
                } else {
                    self.privmsg(nick, "Authentication failed.").await?;
                }
                Ok(true)
            },

            "whoami" => {
                let (parsed_nick, ident_host) = parse_identity(prefix);
                let Some(parsed_nick) = parsed_nick else {
                    self.privmsg(channel, "Could not parse your prefix.").await?;
                    return Ok(true);
                };
                let shown_host =
                    ident_host.unwrap_or_else(|| "unknown".to_string());
                let known = self
                    .owners_snapshot()
                    .get(&parsed_nick)
                    .map(|r| r.hosts.clone())
                    .unwrap_or_default();
                let known = if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                };
                let access = if self.has_owner_access(prefix) { "yes" } else { "no" };
                self.privmsg(
                    channel,
                    &format!(
                        "You are {parsed_nick} ({shown_host}). Known hosts: \
                         {known}. Owner access: {access}."
                    ),
                )
                .await?;
                Ok(true)
            },

            "plugins" => {
                let (enabled, disabled) = self.manager.list_status();
                let enabled = if enabled.is_empty() {
                    "none".to_string()
                } else {
                    enabled.join(", ")
                };
                let disabled = if disabled.is_empty() {
                    "none".to_string()
                } else {
                    disabled.join(", ")
                };
                self.privmsg(
                    channel,
                    &format!(
                        "Enabled plugins: {enabled} | Disabled plugins: {disabled}"
                    ),
                )
                .await?;
                Ok(true)
            },

            "load" | "unload" | "reload" => {
                let title = match command {
                    "load" => "Load",
                    "unload" => "Unload",
                    _ => "Reload",
                };
                let Some(name) = args.first() else {
                    self.privmsg(
                        channel,
                        &format!("Usage: {sigil}{command} <plugin>"),
                    )
                    .await?;
                    return Ok(true);
                };
                let handle = self.as_handle();
                let result = match command {
                    "load" => self.manager.load(name, &handle).await,
                    "unload" => self.manager.unload(name, &handle).await,
                    _ => self.manager.reload(name, &handle).await,
                };
                match result {
                    Ok(()) => {
                        let status = match command {
                            "load" => "enabled",
                            "unload" => "disabled",
                            _ => "reloaded",
                        };
                        self.privmsg(
                            channel,
                            &format!("{title}ed plugin '{name}' ({status})."),
                        )
                        .await?;
                    },
                    Err(e) => {
                        warn!("error handling {command} command: {e:#}");
                        self.privmsg(channel, &format!("{title} failed: {e:#}"))
                            .await?;
                    },
                }
                Ok(true)
            },

            "say" | "join" | "part" => {
                if !self.has_owner_access(prefix) {
                    self.privmsg(
                        channel,
                        "You do not have permission for that command.",
                    )
                    .await?;
                    return Ok(true);
                }
                match command {
                    "say" => {
                        if args.len() < 2 {
                            self.privmsg(
                                channel,
                                &format!("Usage: {sigil}say <target> <text>"),
                            )
                            .await?;
                            return Ok(true);
                        }
                        self.privmsg(&args[0], &args[1..].join(" ")).await?;
                        self.privmsg(channel, "Message sent.").await?;
                    },
                    "join" => {
                        let Some(target) = args.first() else {
                            self.privmsg(
                                channel,
                                &format!("Usage: {sigil}join <#channel>"),
                            )
                            .await?;
                            return Ok(true);
                        };
                        self.join_channel(target).await?;
                        self.privmsg(channel, &format!("Joining {target}")).await?;
                    },
                    _ => {
                        let Some(target) = args.first() else {
                            self.privmsg(
                                channel,
                                &format!("Usage: {sigil}part <#channel>"),
                            )
                            .await?;
                            return Ok(true);
                        };
                        let reason = args[1..].join(" ");
                        self.part_channel(target, &reason).await?;
                        self.privmsg(channel, &format!("Parting {target}")).await?;
                    },
                }
                Ok(true)
            },

            "health" | "status" => {
                let snapshot = self.snapshot();
                let (enabled, disabled) = self.manager.list_status();
                let since = |secs: Option<u64>| {
                    secs.map_or_else(
                        || "never".to_string(),
                        |s| format!("{s}s ago"),
                    )
                };
                self.privmsg(
                    channel,
                    &format!(
                        "Channels: {} | Connected: {} | Disconnected: {} | \
                         Send queue: {}/{} | Handlers: {} enabled, {} disabled",
                        snapshot.channels.len(),
                        since(snapshot.secs_since_connect),
                        since(snapshot.secs_since_disconnect),
                        snapshot.queue_depth,
                        self.outbound.capacity(),
                        enabled.len(),
                        disabled.len(),
                    ),
                )
                .await?;
                Ok(true)
            },

            "help" => {
                match args.first() {
                    None => {
                        let names = self.manager.command_names();
                        if names.is_empty() {
                            self.privmsg(channel, "No commands registered.")
                                .await?;
                        } else {
                            self.privmsg(
                                channel,
                                &format!("Commands: {}", names.join(", ")),
                            )
                            .await?;
                        }
                    },
                    Some(name) => match self.manager.lookup_command(name) {
                        Some(spec) => {
                            let line = if spec.aliases.is_empty() {
                                format!("{}: {}", spec.name, spec.help)
                            } else {
                                format!(
                                    "{} (aliases: {}): {}",
                                    spec.name,
                                    spec.aliases.join(", "),
                                    spec.help
                                )
                            };
                            self.privmsg(channel, &line).await?;
                        },
                        None => {
                            self.privmsg(
                                channel,
                                &format!("Unknown command '{name}'"),
                            )
                            .await?;
                        },
                    },
                }
                Ok(true)
            },

            _ => Ok(false),
        }
    }
}
