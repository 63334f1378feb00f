use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::PeerId;
use crate::progress::Progress;
use crate::registry::{ChannelRegistry, RegistryError};
use crate::transport::{ChannelEvent, ChannelHandle, ChannelPayload, DataChannel, TransportError};

pub const DEFAULT_MESSAGE_SIZE: usize = 65_535;
pub const PAYLOAD_FILL: u8 = 0xFF;

/// Process-wide byte counters, read and reset once per sampling interval.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSample {
    pub sent: u64,
    pub received: u64,
}

impl ByteCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns the bytes counted since the previous call and resets both
    /// counters to zero.
    pub fn take(&self) -> CounterSample {
        CounterSample {
            sent: self.sent.swap(0, Ordering::Relaxed),
            received: self.received.swap(0, Ordering::Relaxed),
        }
    }

    pub fn peek(&self) -> CounterSample {
        CounterSample {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }
}

/// Drives the fixed payload into every attached channel, gated on the
/// channel's buffered amount.
pub struct TransmissionController {
    counters: Arc<ByteCounters>,
    payload: Bytes,
    channels: Arc<ChannelRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransmissionController {
    pub fn new(message_size: usize, counters: Arc<ByteCounters>) -> Arc<Self> {
        Arc::new(Self {
            counters,
            payload: Bytes::from(vec![PAYLOAD_FILL; message_size]),
            channels: Arc::new(ChannelRegistry::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn counters(&self) -> &Arc<ByteCounters> {
        &self.counters
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    pub fn message_size(&self) -> usize {
        self.payload.len()
    }

    /// Registers the channel for `peer_id` and spawns the task consuming its
    /// events. Sending starts right away if the channel is already open,
    /// otherwise on its `Open` event.
    pub fn attach(&self, peer_id: PeerId, handle: ChannelHandle) -> Result<(), RegistryError> {
        let ChannelHandle { channel, events } = handle;
        let label = channel.label().to_string();
        self.channels.insert(peer_id.clone(), channel)?;
        tracing::debug!(target = "transmission", peer = %peer_id, label = %label, "channel attached");

        let worker = ChannelWorker {
            peer_id,
            channels: Arc::clone(&self.channels),
            counters: Arc::clone(&self.counters),
            payload: self.payload.clone(),
            stopped: false,
        };
        let task = tokio::spawn(worker.run(events));
        self.tasks.lock().push(task);
        Ok(())
    }

    /// Sum of the buffered amount over every attached channel.
    pub async fn buffered_total(&self) -> usize {
        let mut total = 0;
        for channel in self.channels.snapshot() {
            total += channel.buffered_amount().await;
        }
        total
    }

    /// Closes and releases every channel. Channel tasks that are still
    /// running observe an empty registry and stop sending.
    pub async fn shutdown(&self) {
        let channels = self.channels.remove_all();
        for channel in &channels {
            channel.close().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if !channels.is_empty() {
            tracing::debug!(target = "transmission", count = channels.len(), "channels released");
        }
    }
}

impl Drop for TransmissionController {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug)]
enum PumpOutcome {
    /// The channel reported a non-zero buffered amount or is not open.
    Paused { sent: usize },
    Failed { sent: usize, error: TransportError },
}

/// Sends while the channel is open and reports nothing buffered.
async fn pump(channel: &dyn DataChannel, payload: &Bytes, counters: &ByteCounters) -> PumpOutcome {
    let mut sent = 0;
    while channel.is_open() && channel.buffered_amount().await == 0 {
        match channel.send(payload).await {
            Ok(len) => {
                counters.add_sent(len as u64);
                sent += 1;
            }
            Err(error) => return PumpOutcome::Failed { sent, error },
        }
    }
    PumpOutcome::Paused { sent }
}

struct ChannelWorker {
    peer_id: PeerId,
    channels: Arc<ChannelRegistry>,
    counters: Arc<ByteCounters>,
    payload: Bytes,
    stopped: bool,
}

impl ChannelWorker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        self.resume("attach").await;
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    tracing::info!(target = "transmission", peer = %self.peer_id, "data channel open");
                    Progress::ChannelOpen { peer: self.peer_id.clone() }.announce();
                    self.resume("open").await;
                }
                ChannelEvent::BufferedAmountLow => self.resume("buffered_low").await,
                ChannelEvent::Message(ChannelPayload::Binary(bytes)) => {
                    self.counters.add_received(bytes.len() as u64);
                }
                ChannelEvent::Message(ChannelPayload::Text(text)) => {
                    tracing::trace!(target = "transmission", peer = %self.peer_id, len = text.len(), "ignoring text message");
                }
                ChannelEvent::Closed => {
                    tracing::info!(target = "transmission", peer = %self.peer_id, "data channel closed");
                    Progress::ChannelClosed { peer: self.peer_id.clone() }.announce();
                    self.stopped = true;
                }
                ChannelEvent::Error(error) => {
                    tracing::warn!(target = "transmission", peer = %self.peer_id, error = %error, "data channel error");
                }
            }
        }
        tracing::trace!(target = "transmission", peer = %self.peer_id, "channel events ended");
    }

    async fn resume(&mut self, reason: &'static str) {
        if self.stopped {
            return;
        }
        let Some(channel) = self.channels.get(&self.peer_id) else {
            tracing::trace!(target = "transmission", peer = %self.peer_id, reason, "channel released");
            return;
        };
        match pump(channel.as_ref(), &self.payload, &self.counters).await {
            PumpOutcome::Paused { sent } => {
                tracing::trace!(target = "transmission", peer = %self.peer_id, reason, sent, "send loop paused");
            }
            PumpOutcome::Failed { sent, error } => {
                tracing::warn!(
                    target = "transmission",
                    peer = %self.peer_id,
                    reason,
                    sent,
                    error = %error,
                    "send failed; stopping send loop for this channel"
                );
                Progress::SendFailed {
                    peer: self.peer_id.clone(),
                    error: error.to_string(),
                }
                .announce();
                self.stopped = true;
            }
        }
    }
}
