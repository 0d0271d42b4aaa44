// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Event feeds for the real-time monitor.
//!
//! A feed yields newly appended events from "now" onwards. There is no
//! replay: a late subscriber starts at the current tip, and a lagging
//! subscriber is told how many events it missed via [`FeedItem::Lagged`].
//!
//! | Feed | Source |
//! |------|--------|
//! | [`BusFeed`] | In-process [`EventBus`] |
//! | `StreamSocketFeed` | Line-delimited JSON over a Unix socket (`crate::infrastructure::stream_socket`) |
//! | [`PollingFeed`] | Periodic `Query` against a [`PollSource`] (HTTP fallback) |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::domain::audit::{AuditEvent, EventId};
use crate::infrastructure::event_bus::{EventBus, EventBusError, EventReceiver};

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(Box<AuditEvent>),
    /// The feed dropped this many events.
    Lagged(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed closed")]
    Closed,

    #[error("Feed transport error: {0}")]
    Transport(String),

    #[error("Malformed feed line: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait EventFeed: Send {
    fn name(&self) -> &'static str;

    /// Next item; waits until one is available.
    async fn next(&mut self) -> Result<FeedItem, FeedError>;
}

/// Feed backed by the in-process event bus.
pub struct BusFeed {
    receiver: EventReceiver,
}

impl BusFeed {
    pub fn new(bus: &EventBus) -> Self {
        Self { receiver: bus.subscribe() }
    }
}

#[async_trait]
impl EventFeed for BusFeed {
    fn name(&self) -> &'static str {
        "event-bus"
    }

    async fn next(&mut self) -> Result<FeedItem, FeedError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(FeedItem::Event(Box::new(event))),
            Err(EventBusError::Lagged(n)) => Ok(FeedItem::Lagged(n)),
            Err(EventBusError::Closed) | Err(EventBusError::Empty) => Err(FeedError::Closed),
        }
    }
}

/// Source of events for the polling fallback.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Events with `timestamp >= since`, inserted after `after` when given,
    /// in insertion order, at most `limit`.
    async fn events_after(
        &self,
        since: DateTime<Utc>,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, FeedError>;
}

/// Polls a [`PollSource`] on an interval. The first poll starts at creation
/// time; later polls page by the id of the last delivered event, so any
/// number of events sharing one timestamp are drained in full.
pub struct PollingFeed<S: PollSource> {
    source: S,
    interval: Duration,
    batch_limit: usize,
    since: DateTime<Utc>,
    last_seen: Option<EventId>,
    buffer: VecDeque<AuditEvent>,
    first_poll: bool,
    more_pending: bool,
}

impl<S: PollSource> PollingFeed<S> {
    pub fn new(source: S, interval: Duration) -> Self {
        Self::starting_at(source, interval, Utc::now())
    }

    pub fn starting_at(source: S, interval: Duration, since: DateTime<Utc>) -> Self {
        Self {
            source,
            interval,
            batch_limit: 500,
            since,
            last_seen: None,
            buffer: VecDeque::new(),
            first_poll: true,
            more_pending: false,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    async fn poll_once(&mut self) -> Result<(), FeedError> {
        let events = self
            .source
            .events_after(self.since, self.last_seen.as_ref(), self.batch_limit)
            .await?;
        self.more_pending = events.len() >= self.batch_limit;
        if let Some(last) = events.last() {
            self.last_seen = Some(last.event_id.clone());
        }
        self.buffer.extend(events);
        Ok(())
    }
}

#[async_trait]
impl<S: PollSource> EventFeed for PollingFeed<S> {
    fn name(&self) -> &'static str {
        "http-poll"
    }

    async fn next(&mut self) -> Result<FeedItem, FeedError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(FeedItem::Event(Box::new(event)));
            }
            // A full page means the source has more right now.
            if !self.first_poll && !self.more_pending {
                tokio::time::sleep(self.interval).await;
            }
            self.first_poll = false;
            self.poll_once().await?;
        }
    }
}
