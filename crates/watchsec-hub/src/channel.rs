//! Outbound side of a websocket connection
//!
//! Every connection owns one bounded FIFO queue drained by a writer task.
//! Handlers never write to the socket directly; they enqueue through a
//! [`ChannelHandle`], which never blocks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use watchsec_core::RelayError;
use watchsec_protocol::{message, ConnectionId};

/// A message queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// JSON control message
    Text(String),
    /// Encoded stream frame
    Binary(Bytes),
}

/// Cloneable handle for sending to one connection and closing it
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    failures: Arc<AtomicU32>,
    max_failures: u32,
}

impl ChannelHandle {
    /// Create a handle and the receiving end of its queue
    pub fn new(
        id: ConnectionId,
        capacity: usize,
        max_failures: u32,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            tx,
            cancel: CancellationToken::new(),
            failures: Arc::new(AtomicU32::new(0)),
            max_failures: max_failures.max(1),
        };
        (handle, rx)
    }

    /// Connection this handle belongs to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a control message.
    ///
    /// A failed enqueue counts toward the connection's consecutive failure
    /// limit; reaching it closes the connection.
    pub fn send_message<T: Serialize>(&self, msg: &T) -> Result<(), RelayError> {
        let text = message::encode(msg)
            .map_err(|e| RelayError::TransportWriteFailure(e.to_string()))?;
        self.send_text(text)
    }

    /// Queue already-encoded control text
    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(write_failure(self.id, e))
            }
        }
    }

    /// Queue a stream frame.
    ///
    /// Frames are best effort: a full queue means the consumer is slow and
    /// the caller decides what to do with it. Frame drops do not count as
    /// control failures.
    pub fn try_send_frame(&self, frame: Bytes) -> Result<(), RelayError> {
        self.tx
            .try_send(Outbound::Binary(frame))
            .map_err(|e| write_failure(self.id, e))
    }

    /// Note a successful write, resetting the failure streak
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Note a failed write. Returns true if the connection was closed.
    pub fn record_failure(&self) -> bool {
        let streak = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= self.max_failures {
            tracing::warn!(
                "Connection {} reached {} consecutive write failures, closing",
                self.id,
                streak
            );
            self.close();
            return true;
        }
        false
    }

    /// Force the connection closed
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the connection is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

fn write_failure<T>(id: ConnectionId, err: TrySendError<T>) -> RelayError {
    match err {
        TrySendError::Full(_) => RelayError::TransportWriteFailure(format!("{} queue full", id)),
        TrySendError::Closed(_) => RelayError::TransportWriteFailure(format!("{} closed", id)),
    }
}
