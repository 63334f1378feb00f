use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{SignalingEnvelope, SignalingError, SignalingSender};
use crate::identity::PeerId;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum SignalingEvent {
    Envelope(SignalingEnvelope),
    Disconnected,
}

/// Owns the single WebSocket connection to the relay.
///
/// A client only exists once the connection is established, so there is no
/// way to send before the relay is reachable.
pub struct SignalingClient {
    local_id: PeerId,
    url: Url,
    sender: SignalingSender,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Opens the relay connection and resolves once it is either connected or
    /// failed. There is no internal deadline; wrap in a timeout if needed.
    pub async fn connect(url: &Url, local_id: PeerId) -> Result<Arc<Self>, SignalingError> {
        Self::connect_with_keepalive(url, local_id, KEEPALIVE_INTERVAL).await
    }

    /// Like [`SignalingClient::connect`], pinging the relay every `keepalive`.
    pub async fn connect_with_keepalive(
        url: &Url,
        local_id: PeerId,
        keepalive: Duration,
    ) -> Result<Arc<Self>, SignalingError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::ConnectFailed(format!("{url}: {err}")))?;
        tracing::info!(target = "signaling", url = %url, local_id = %local_id, "signaling connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (sender, mut outbound_rx) = SignalingSender::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        let writer_handle = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(keepalive);
            keepalive.tick().await;
            loop {
                let message = tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(envelope) => match envelope.encode() {
                            Ok(text) => Message::Text(text),
                            Err(err) => {
                                tracing::warn!(target = "signaling", error = %err, "failed to encode envelope");
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = keepalive.tick() => Message::Ping(Vec::new()),
                };
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target = "signaling", error = %err, "signaling writer stopped");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target = "signaling", len = text.len(), "ws_in");
                        match SignalingEnvelope::decode(&text) {
                            Ok(envelope) => {
                                if events_tx.send(SignalingEvent::Envelope(envelope)).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::trace!(target = "signaling", error = %err, "dropping frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(other) => {
                        tracing::trace!(target = "signaling", len = other.len(), "ignoring non-text frame");
                    }
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                }
            }
            tracing::info!(target = "signaling", "signaling closed");
            let _ = events_tx.send(SignalingEvent::Disconnected);
        });

        Ok(Arc::new(Self {
            local_id,
            url: url.clone(),
            sender,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        }))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn sender(&self) -> SignalingSender {
        self.sender.clone()
    }

    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.sender.send(envelope)
    }

    /// Inbound envelopes in arrival order. Can be taken once.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        self.events_rx
            .lock()
            .take()
            .ok_or(SignalingError::EventsTaken)
    }

    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}
