//! Outbound websocket connection to the relay hub
//!
//! Establishes and maintains the agent's control connection. Control
//! messages go through a bounded FIFO queue; relayed stream frames go
//! through a single slot where a newer frame replaces one not yet written.
//! A writer task drains both, control first, and a reader task decodes hub
//! messages into [`HubEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use watchsec_core::config::AgentConfig;
use watchsec_protocol::{message, AgentId, AgentMessage, HubToAgent};

use super::reconnect::ExponentialBackoff;

/// Channel capacity for events from the hub.
const HUB_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the control message queue.
///
/// Overflowing it means the socket has stalled; the connection is dropped.
const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Consecutive socket write failures treated as a disconnect
const MAX_WRITE_FAILURES: u32 = 3;

/// How long `close` waits for the writer to flush
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection errors that may require special handling
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The hub URL in the configuration cannot be used
    #[error("Invalid hub URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The hub rejected the agent's API key
    #[error("Authentication rejected by hub")]
    AuthRejected,

    /// Other connection error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Establishes and maintains the control connection to the hub
pub struct HubConnector {
    /// Agent configuration
    config: AgentConfig,
    /// Identity presented in the connection path
    agent_id: AgentId,
}

impl HubConnector {
    /// Create a new connector
    pub fn new(config: AgentConfig, agent_id: AgentId) -> Self {
        Self { config, agent_id }
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Websocket URL of the agent endpoint, including the API key
    pub fn endpoint(&self) -> Result<Url, ConnectionError> {
        let invalid = |reason: String| ConnectionError::InvalidUrl {
            url: self.config.hub_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.config.hub_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "ws", "agent", self.agent_id.as_str()]);
        url.query_pairs_mut()
            .clear()
            .append_pair("api_key", &self.config.api_key);
        Ok(url)
    }

    /// Connect to the hub with automatic retry
    ///
    /// Returns `ConnectionError::AuthRejected` without retrying if the hub
    /// refuses the API key, and `ConnectionError::InvalidUrl` if the
    /// configured URL is unusable.
    pub async fn connect_with_retry(
        &self,
        mut backoff: ExponentialBackoff,
    ) -> Result<HubLink, ConnectionError> {
        loop {
            match self.try_connect().await {
                Ok(link) => {
                    tracing::info!("Connected to hub at {}", self.config.hub_url);
                    return Ok(link);
                }
                Err(ConnectionError::AuthRejected) => {
                    tracing::warn!("Hub rejected the API key for agent {}", self.agent_id);
                    return Err(ConnectionError::AuthRejected);
                }
                Err(e @ ConnectionError::InvalidUrl { .. }) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Attempt a single connection to the hub
    async fn try_connect(&self) -> Result<HubLink, ConnectionError> {
        let url = self.endpoint()?;

        tracing::debug!("Connecting to {} as {}", self.config.hub_url, self.agent_id);
        let (socket, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Connection timed out"))?
        .map_err(|e| match e {
            tungstenite::Error::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                ConnectionError::AuthRejected
            }
            e => ConnectionError::Other(anyhow::anyhow!(
                "Failed to connect to {}: {}",
                self.config.hub_url,
                e
            )),
        })?;

        Ok(HubLink::start(socket))
    }
}

/// Events received from the hub
#[derive(Debug)]
pub enum HubEvent {
    /// A control message
    Message(HubToAgent),
    /// The connection ended
    Disconnected(String),
}

/// Cloneable sending side of the hub connection.
///
/// Never waits: the event loop and the frame pump must not stall behind a
/// slow socket.
#[derive(Debug, Clone)]
pub struct HubSender {
    control: mpsc::Sender<Message>,
    frame: Arc<watch::Sender<Option<Bytes>>>,
    cancel: CancellationToken,
}

impl HubSender {
    /// Create a sender and the queues the socket writer drains
    pub(crate) fn channel(capacity: usize) -> (Self, Outbound) {
        let (control_tx, control_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = watch::channel(None);
        let sender = Self {
            control: control_tx,
            frame: Arc::new(frame_tx),
            cancel: CancellationToken::new(),
        };
        let outbound = Outbound {
            control: control_rx,
            frame: frame_rx,
        };
        (sender, outbound)
    }

    /// Queue a control message.
    ///
    /// A full queue closes the connection so the agent reconnects with a
    /// consistent state instead of silently losing signaling.
    pub fn send(&self, msg: &AgentMessage) -> Result<()> {
        let text = message::encode(msg)?;
        match self.control.try_send(Message::Text(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Hub control queue full, dropping the connection");
                self.cancel.cancel();
                Err(anyhow::anyhow!("Hub control queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow::anyhow!("Hub connection closed"))
            }
        }
    }

    /// Offer an encoded stream frame for relay.
    ///
    /// Replaces a previous frame the writer has not picked up yet.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow::anyhow!("Hub connection closed"));
        }
        self.frame.send_replace(Some(frame));
        Ok(())
    }

    /// Whether the connection's writer is gone
    pub fn is_closed(&self) -> bool {
        self.control.is_closed() || self.cancel.is_cancelled()
    }
}

/// Queues drained by the socket writer
#[derive(Debug)]
pub(crate) struct Outbound {
    control: mpsc::Receiver<Message>,
    frame: watch::Receiver<Option<Bytes>>,
}

impl Outbound {
    /// Next message to write: queued control messages first, then the
    /// latest frame. `None` once every sender is gone.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            tokio::select! {
                biased;
                msg = self.control.recv() => return msg,
                changed = self.frame.changed() => match changed {
                    Ok(()) => {
                        if let Some(msg) = self.take_frame() {
                            return Some(msg);
                        }
                    }
                    Err(_) => return self.control.recv().await,
                },
            }
        }
    }

    fn take_frame(&mut self) -> Option<Message> {
        self.frame
            .borrow_and_update()
            .as_ref()
            .map(|frame| Message::Binary(frame.to_vec()))
    }

    /// Next message without waiting
    #[cfg(test)]
    pub fn try_next(&mut self) -> Option<Message> {
        if let Ok(msg) = self.control.try_recv() {
            return Some(msg);
        }
        match self.frame.has_changed() {
            Ok(true) => self.take_frame(),
            _ => None,
        }
    }
}

/// An active control connection to the hub
pub struct HubLink {
    sender: HubSender,
    event_rx: mpsc::Receiver<HubEvent>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl HubLink {
    fn start(socket: HubSocket) -> Self {
        let (sink, stream) = socket.split();
        let (sender, outbound) = HubSender::channel(CONTROL_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(HUB_EVENT_CHANNEL_CAPACITY);
        let cancel = sender.cancel.clone();

        let writer = tokio::spawn(write_loop(sink, outbound, cancel.clone()));
        let reader = tokio::spawn(read_loop(stream, event_tx, cancel.clone()));

        Self {
            sender,
            event_rx,
            cancel,
            writer,
            reader,
        }
    }

    /// Handle for queueing messages and frames
    pub fn sender(&self) -> HubSender {
        self.sender.clone()
    }

    /// Receive the next event from the hub
    pub async fn recv_event(&mut self) -> Option<HubEvent> {
        self.event_rx.recv().await
    }

    /// Close the connection
    pub async fn close(self) {
        self.cancel.cancel();
        drop(self.sender);
        if tokio::time::timeout(CLOSE_GRACE, self.writer).await.is_err() {
            tracing::debug!("Hub writer did not stop in time");
        }
        self.reader.abort();
    }
}

/// Drain the outbound queues into the socket
async fn write_loop(
    mut sink: SplitSink<HubSocket, Message>,
    mut outbound: Outbound,
    cancel: CancellationToken,
) {
    let mut failures = 0u32;
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.next() => match next {
                Some(msg) => msg,
                None => break,
            },
        };

        match sink.send(msg).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::debug!("Write to hub failed: {}", e);
                if failures >= MAX_WRITE_FAILURES {
                    tracing::warn!(
                        "{} consecutive write failures, dropping hub connection",
                        failures
                    );
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Decode hub messages into events until the connection ends
async fn read_loop(
    mut stream: SplitStream<HubSocket>,
    event_tx: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break "connection closed locally".to_string(),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => match message::decode::<HubToAgent>(&text) {
                Ok(msg) => {
                    if event_tx.send(HubEvent::Message(msg)).await.is_err() {
                        break "event loop gone".to_string();
                    }
                }
                Err(e) => tracing::warn!("Unexpected message from hub: {}", e),
            },
            Some(Ok(Message::Binary(data))) => {
                tracing::trace!("Ignoring {} byte binary message from hub", data.len());
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("closed by hub: {}", frame.reason),
                    None => "closed by hub".to_string(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection ended".to_string(),
        }
    };

    cancel.cancel();
    let _ = event_tx.send(HubEvent::Disconnected(reason)).await;
}
