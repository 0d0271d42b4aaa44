// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stream Socket - live, line-delimited feed of appended audit events over a
//! Unix domain socket.
//!
//! Every connected client gets its own event-bus subscription and receives
//! one JSON document per line. When a client falls behind the bus capacity
//! the server writes a `{"lagged": N}` line instead of the dropped events and
//! carries on. The HTTP API remains the source of truth; this channel is a
//! low-latency supplement for the real-time monitor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::monitor::feed::{EventFeed, FeedError, FeedItem};
use crate::domain::audit::AuditEvent;
use crate::infrastructure::event_bus::{EventBus, EventBusError};

/// One line on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamLine {
    Lagged { lagged: u64 },
    Event(Box<AuditEvent>),
}

pub struct StreamSocketServer {
    path: PathBuf,
    listener: UnixListener,
    bus: EventBus,
}

impl StreamSocketServer {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl AsRef<Path>, bus: EventBus) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Audit stream socket listening");
        Ok(Self { path, listener, bus })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let bus = self.bus.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            serve_client(stream, bus, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Stream socket accept failed"),
                },
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, closing audit stream socket");
                    break;
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "Stream socket file already gone");
        }
    }
}

async fn serve_client(mut stream: UnixStream, bus: EventBus, shutdown: CancellationToken) {
    let mut receiver = bus.subscribe();
    debug!("Stream client connected");
    loop {
        let line = tokio::select! {
            received = receiver.recv() => match received {
                Ok(event) => StreamLine::Event(Box::new(event)),
                Err(EventBusError::Lagged(n)) => StreamLine::Lagged { lagged: n },
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let mut bytes = match serde_json::to_vec(&line) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode stream line");
                continue;
            }
        };
        bytes.push(b'\n');
        if stream.write_all(&bytes).await.is_err() {
            break;
        }
    }
    debug!("Stream client disconnected");
}

/// Client side of the stream socket, used by the monitor.
pub struct StreamSocketFeed {
    lines: LinesStream<BufReader<UnixStream>>,
}

impl StreamSocketFeed {
    pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            lines: LinesStream::new(BufReader::new(stream).lines()),
        })
    }
}

#[async_trait]
impl EventFeed for StreamSocketFeed {
    fn name(&self) -> &'static str {
        "stream-socket"
    }

    async fn next(&mut self) -> Result<FeedItem, FeedError> {
        loop {
            let line = match self.lines.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(FeedError::Transport(e.to_string())),
                None => return Err(FeedError::Closed),
            };
            if line.trim().is_empty() {
                continue;
            }
            return match serde_json::from_str::<StreamLine>(&line) {
                Ok(StreamLine::Event(event)) => Ok(FeedItem::Event(event)),
                Ok(StreamLine::Lagged { lagged }) => Ok(FeedItem::Lagged(lagged)),
                Err(e) => Err(FeedError::Malformed(e.to_string())),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::{EventPayload, NewAuditEvent, GENESIS_HASH};
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_socket_delivers_events_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.sock");
        let bus = EventBus::new(16);
        let shutdown = CancellationToken::new();

        let server = StreamSocketServer::bind(&path, bus.clone()).unwrap();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let mut feed = StreamSocketFeed::connect(&path).await.unwrap();
        // wait for the server side to subscribe
        for _ in 0..50 {
            if bus.subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut event = AuditEvent::from_new(
            NewAuditEvent::new("s-1", "k8s-agent", EventPayload::Reasoning { content: "drain node".into() }),
            Utc::now(),
        );
        event.seal(GENESIS_HASH).unwrap();
        bus.publish(event.clone());

        match feed.next().await.unwrap() {
            FeedItem::Event(received) => {
                assert_eq!(received.event_id, event.event_id);
                assert!(received.hash_is_valid());
            }
            other => panic!("unexpected {:?}", other),
        }

        shutdown.cancel();
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_lagged_line_parses() {
        let line: StreamLine = serde_json::from_str(r#"{"lagged":7}"#).unwrap();
        assert!(matches!(line, StreamLine::Lagged { lagged: 7 }));
    }
}
