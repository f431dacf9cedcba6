//! Per-connection socket writer

use std::fmt::Display;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;

use crate::channel::{ChannelHandle, Outbound};

/// Drain a connection's outbound queue into its socket.
///
/// Runs until the queue closes or the handle is closed. A write that fails
/// counts toward the connection's failure streak; once the streak reaches
/// its limit the handle closes and the writer stops.
pub async fn pump_outbound<S>(mut sink: S, mut rx: mpsc::Receiver<Outbound>, handle: ChannelHandle)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        let outbound = tokio::select! {
            biased;
            _ = handle.closed() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let msg = match outbound {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
        };

        let result = tokio::select! {
            result = sink.send(msg) => result,
            _ = handle.closed() => break,
        };

        match result {
            Ok(()) => handle.record_success(),
            Err(e) => {
                tracing::debug!("Write to {} failed: {}", handle.id(), e);
                if handle.record_failure() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    tracing::debug!("Writer for {} stopped", handle.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use watchsec_protocol::ConnectionId;

    #[tokio::test]
    async fn test_pump_preserves_order() {
        let (handle, rx) = ChannelHandle::new(ConnectionId::new(900), 8, 3);
        let (sink, mut written) = futures::channel::mpsc::channel::<Message>(16);

        handle.send_text("first".to_string()).unwrap();
        handle.try_send_frame(Bytes::from_static(b"frame")).unwrap();
        handle.send_text("last".to_string()).unwrap();

        let writer = tokio::spawn(pump_outbound(sink, rx, handle.clone()));

        assert_eq!(written.next().await, Some(Message::Text("first".to_string())));
        assert_eq!(written.next().await, Some(Message::Binary(b"frame".to_vec())));
        assert_eq!(written.next().await, Some(Message::Text("last".to_string())));

        handle.close();
        writer.await.unwrap();
        assert_eq!(written.next().await, Some(Message::Close(None)));
    }

    #[tokio::test]
    async fn test_failed_writes_close_connection() {
        let (handle, rx) = ChannelHandle::new(ConnectionId::new(901), 8, 3);
        let (sink, written) = futures::channel::mpsc::channel::<Message>(16);
        drop(written);

        for i in 0..3 {
            handle.send_text(format!("msg-{}", i)).unwrap();
        }

        pump_outbound(sink, rx, handle.clone()).await;
        assert!(handle.is_closed());
    }
}
