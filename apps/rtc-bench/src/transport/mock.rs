//! In-memory transport used by tests.
//!
//! Sessions emulate the engine's auto-negotiation (a remote offer yields a
//! local answer, a local channel yields a local offer) and channels expose a
//! scriptable buffered amount so backpressure can be driven by hand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelEvent, ChannelHandle, ChannelPayload, DataChannel, DescriptionKind, IceCandidate,
    PeerSession, SessionDescription, SessionEvent, SessionFactory, SessionHandle, SessionStats,
    TransportError,
};
use crate::identity::PeerId;

pub const MOCK_OFFER_SDP: &str = "mock-offer";
pub const MOCK_ANSWER_SDP: &str = "mock-answer";

#[derive(Default)]
pub struct MockSessionFactory {
    sessions: Mutex<HashMap<PeerId, Arc<MockSession>>>,
    created: AtomicUsize,
    /// Buffered amount each channel of new sessions reports after a send.
    buffered_after_send: AtomicUsize,
}

impl MockSessionFactory {
    /// Channels from this factory report one buffered byte after each send.
    pub fn new() -> Arc<Self> {
        Self::with_buffered_after_send(1)
    }

    pub fn with_buffered_after_send(bytes: usize) -> Arc<Self> {
        let factory = Self::default();
        factory.buffered_after_send.store(bytes, Ordering::SeqCst);
        Arc::new(factory)
    }

    pub fn session(&self, peer_id: &str) -> Option<Arc<MockSession>> {
        self.sessions.lock().get(peer_id).cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create_session(&self, peer_id: &PeerId) -> Result<SessionHandle, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockSession {
            peer_id: peer_id.clone(),
            events_tx,
            remote_descriptions: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            local_channels: Mutex::new(Vec::new()),
            stats: Mutex::new(SessionStats::default()),
            closed: AtomicBool::new(false),
            buffered_after_send: self.buffered_after_send.load(Ordering::SeqCst),
        });
        self.sessions
            .lock()
            .insert(peer_id.clone(), Arc::clone(&session));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SessionHandle {
            session,
            events: events_rx,
        })
    }
}

pub struct MockSession {
    peer_id: PeerId,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    local_channels: Mutex<Vec<Arc<MockDataChannel>>>,
    stats: Mutex<SessionStats>,
    closed: AtomicBool,
    buffered_after_send: usize,
}

impl MockSession {
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Simulates the remote side opening a channel; the channel is already
    /// open when delivered.
    pub fn open_remote_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let (channel, handle) = MockDataChannel::new(label, true, self.buffered_after_send);
        self.emit(SessionEvent::DataChannel(handle));
        channel
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    pub fn local_channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.local_channels.lock().clone()
    }

    pub fn set_stats(&self, stats: SessionStats) {
        *self.stats.lock() = stats;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for MockSession {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let kind = description.kind;
        self.remote_descriptions.lock().push(description);
        if kind == DescriptionKind::Offer {
            self.emit(SessionEvent::LocalDescription(SessionDescription::new(
                DescriptionKind::Answer,
                MOCK_ANSWER_SDP,
            )));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError> {
        let (channel, handle) = MockDataChannel::new(label, false, self.buffered_after_send);
        self.local_channels.lock().push(channel);
        self.emit(SessionEvent::LocalDescription(SessionDescription::new(
            DescriptionKind::Offer,
            MOCK_OFFER_SDP,
        )));
        Ok(handle)
    }

    async fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Channel whose buffered amount jumps to `buffered_after_send` on every send
/// and only returns to zero through [`MockDataChannel::drain`].
pub struct MockDataChannel {
    label: String,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    open: AtomicBool,
    buffered: AtomicUsize,
    buffered_after_send: usize,
    fail_sends: AtomicBool,
    sends: Mutex<Vec<SendRecord>>,
}

/// One accepted send and the buffered amount observed right before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRecord {
    pub len: usize,
    pub buffered_before: usize,
}

impl MockDataChannel {
    pub fn new(label: &str, open: bool, buffered_after_send: usize) -> (Arc<Self>, ChannelHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            events_tx,
            open: AtomicBool::new(open),
            buffered: AtomicUsize::new(0),
            buffered_after_send,
            fail_sends: AtomicBool::new(false),
            sends: Mutex::new(Vec::new()),
        });
        let handle = ChannelHandle {
            channel: Arc::clone(&channel) as Arc<dyn DataChannel>,
            events: events_rx,
        };
        (channel, handle)
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Open);
    }

    /// Empties the send buffer and fires the low-watermark event if anything
    /// was buffered.
    pub fn drain(&self) {
        let previous = self.buffered.swap(0, Ordering::SeqCst);
        if previous > 0 {
            let _ = self.events_tx.send(ChannelEvent::BufferedAmountLow);
        }
    }

    /// Fires a low-watermark event without touching the buffer.
    pub fn fire_low(&self) {
        let _ = self.events_tx.send(ChannelEvent::BufferedAmountLow);
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    pub fn deliver(&self, payload: ChannelPayload) {
        let _ = self.events_tx.send(ChannelEvent::Message(payload));
    }

    pub fn remote_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.sends.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().len()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: &Bytes) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("rejected by mock".into()));
        }
        let buffered_before = self
            .buffered
            .fetch_add(self.buffered_after_send, Ordering::SeqCst);
        self.sends.lock().push(SendRecord {
            len: payload.len(),
            buffered_before,
        });
        Ok(payload.len())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(ChannelEvent::Closed);
        }
    }
}
