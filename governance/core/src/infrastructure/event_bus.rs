// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Live feed of appended audit events
//
// Fan-out of every successfully appended audit event using a tokio broadcast
// channel. Consumers are the stream socket and in-process observers.
//
// Delivery is best-effort: publishing never blocks the append path, and a
// slow subscriber lags and loses the oldest events instead of applying
// backpressure.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::audit::{AuditEvent, EventType};

/// Event bus for publishing and subscribing to appended audit events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<AuditEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an appended event to all subscribers. Fire-and-forget.
    pub fn publish(&self, event: AuditEvent) {
        debug!(event_id = %event.event_id, "Publishing audit event");

        // send() only fails when nobody is listening
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to audit stream");
        }
    }

    /// Subscribe to all appended events from now on
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            event_type: None,
        }
    }

    /// Subscribe and filter for a single event type
    pub fn subscribe_type(&self, event_type: EventType) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
            event_type: Some(event_type),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver for appended audit events
pub struct EventReceiver {
    receiver: broadcast::Receiver<AuditEvent>,
    event_type: Option<EventType>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<AuditEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            match self.event_type {
                Some(wanted) if event.event_type() != wanted => continue,
                _ => return Ok(event),
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<AuditEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            match self.event_type {
                Some(wanted) if event.event_type() != wanted => continue,
                _ => return Ok(event),
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
