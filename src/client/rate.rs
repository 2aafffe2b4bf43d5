// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Sliding-window admission control for the send path.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::Mutex,
    time::{Instant, sleep},
};

use crate::cfg::config::RateParams;

/// Admits at most `count` acquisitions in any window of length `window`.
///
/// Waiters sleep outside the lock, so cancelling a suspended `acquire` never
/// leaves a reserved slot behind; under contention the tokio mutex hands the
/// lock out in FIFO order.
#[derive(Debug)]
pub struct RateGate {
    count: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateGate {
    pub fn new(params: RateParams) -> Self {
        Self {
            count: params.count.max(1),
            window: params.window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspends until sending would respect the limit, then records the
    /// admission.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut events = self.events.lock().await;
                let now = Instant::now();
                while events
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > self.window)
                {
                    events.pop_front();
                }

                if events.len() < self.count {
                    events.push_back(now);
                    return;
                }

                let oldest = events.front().copied().unwrap_or(now);
                self.window
                    .saturating_sub(now.duration_since(oldest))
                    .max(Duration::from_millis(1))
            };
            sleep(wait).await;
        }
    }
}

/// Per-target gates keyed by lowercased target. Reconfiguring the parameters
/// resets the map.
#[derive(Debug)]
pub struct TargetGates {
    params: StdMutex<RateParams>,
    gates: DashMap<String, Arc<RateGate>>,
}

impl TargetGates {
    pub fn new(params: RateParams) -> Self {
        Self {
            params: StdMutex::new(params),
            gates: DashMap::new(),
        }
    }

    pub fn gate_for(&self, target: &str) -> Arc<RateGate> {
        let params = *self.params.lock().expect("rate params lock poisoned");
        self.gates
            .entry(target.to_lowercase())
            .or_insert_with(|| Arc::new(RateGate::new(params)))
            .clone()
    }

    pub fn reconfigure(&self, params: RateParams) {
        *self.params.lock().expect("rate params lock poisoned") = params;
        self.gates.clear();
    }
}
