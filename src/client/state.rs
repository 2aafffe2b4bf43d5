// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio::time::Instant;

/// Runtime-only connection state, mutated by the event router and the
/// outbound helpers.
#[derive(Debug, Default)]
pub struct ClientState {
    /// Current server-assigned nickname.
    pub nickname: String,
    /// Joined channels, case preserved, deduped case-insensitively.
    pub channels: Vec<String>,
    pub last_connect: Option<Instant>,
    pub last_disconnect: Option<Instant>,
}

impl ClientState {
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel))
    }

    /// Adds a channel to the joined list. Returns whether the list changed.
    pub fn remember_channel(&mut self, channel: &str) -> bool {
        let channel = channel.trim();
        if channel.is_empty() || self.has_channel(channel) {
            return false;
        }
        self.channels.push(channel.to_string());
        true
    }

    /// Removes a channel from the joined list. Returns whether it was there.
    pub fn forget_channel(&mut self, channel: &str) -> bool {
        let channel = channel.trim();
        let before = self.channels.len();
        self.channels.retain(|c| !c.eq_ignore_ascii_case(channel));
        self.channels.len() != before
    }

    pub fn snapshot(&self, queue_depth: usize) -> StateSnapshot {
        let now = Instant::now();
        StateSnapshot {
            nickname: self.nickname.clone(),
            channels: self.channels.clone(),
            secs_since_connect: self
                .last_connect
                .map(|t| now.duration_since(t).as_secs()),
            secs_since_disconnect: self
                .last_disconnect
                .map(|t| now.duration_since(t).as_secs()),
            queue_depth,
        }
    }
}

/// Read-only view handed to `health` and interested handlers.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub nickname: String,
    pub channels: Vec<String>,
    pub secs_since_connect: Option<u64>,
    pub secs_since_disconnect: Option<u64>,
    pub queue_depth: usize,
}
