// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::Notify;

/// Maximum number of outstanding outbound lines per connection.
pub const QUEUE_MAX: usize = 100;

/// Bounded FIFO of outbound lines feeding the writer task.
///
/// `push` never blocks: a full queue drops the line so a slow server cannot
/// stall event processing. The single consumer is the writer loop.
#[derive(Debug)]
pub struct SendQueue {
    inner: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().expect("send queue lock poisoned")
    }

    /// Enqueues a line. Returns false when the queue is full and the line
    /// was dropped.
    pub fn push(&self, line: String) -> bool {
        {
            let mut queue = self.queue();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(line);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for and removes the oldest line.
    pub async fn pop(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(line) = self.queue().pop_front() {
                return line;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops everything queued; used when a connection is torn down.
    pub fn clear(&self) {
        self.queue().clear();
    }
}
