// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Connection engine and send path.
pub mod client;
/// Cancellable I/O plumbing shared by the engine.
pub mod common;
/// Bounded outbound queue.
pub mod queue;
/// Sliding-window rate gates.
pub mod rate;
/// Inbound event routing and builtin commands.
pub mod router;
/// Runtime state and snapshots.
pub mod state;
