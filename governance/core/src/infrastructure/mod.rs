// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod inventory;
pub mod notifications;
pub mod policy_loader;
pub mod repositories;
pub mod stream_socket;

pub use event_bus::{EventBus, EventBusError, EventReceiver};
pub use notifications::NotificationDispatcher;
