//! Boundary to the peer-to-peer transport engine.
//!
//! The engine owns negotiation, encryption and delivery. This module only
//! describes what the benchmark needs from it: sessions that accept remote
//! descriptions and candidates, data channels that report their buffered
//! amount, and one ordered event stream per session and per channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerId;

pub mod mock;
pub mod webrtc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("data channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl DescriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptionKind::Offer => "offer",
            DescriptionKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: DescriptionKind, sdp: impl Into<String>) -> Self {
        Self {
            kind,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate tagged with its media-line identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub mid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::New => "new",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    InProgress,
    Complete,
}

impl fmt::Display for GatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GatheringState::New => "new",
            GatheringState::InProgress => "in-progress",
            GatheringState::Complete => "complete",
        };
        f.write_str(label)
    }
}

/// Cumulative counters reported by the engine for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug)]
pub enum ChannelEvent {
    Open,
    Message(ChannelPayload),
    /// Buffered amount dropped back to the low-watermark threshold.
    BufferedAmountLow,
    Closed,
    Error(String),
}

pub enum SessionEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    /// The remote side opened a channel on this session.
    DataChannel(ChannelHandle),
    StateChanged(SessionState),
    GatheringStateChanged(GatheringState),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::LocalDescription(desc) => {
                f.debug_tuple("LocalDescription").field(&desc.kind).finish()
            }
            SessionEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(&candidate.mid).finish()
            }
            SessionEvent::DataChannel(handle) => f
                .debug_tuple("DataChannel")
                .field(&handle.channel.label())
                .finish(),
            SessionEvent::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            SessionEvent::GatheringStateChanged(state) => {
                f.debug_tuple("GatheringStateChanged").field(state).finish()
            }
        }
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Bytes accepted for send but not yet flushed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn send(&self, payload: &Bytes) -> Result<usize, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    /// Applies a remote offer or answer. A remote offer makes the engine
    /// produce a local answer on the event stream.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Creates a local channel and starts negotiation; the local offer
    /// follows on the session event stream.
    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError>;

    async fn stats(&self) -> SessionStats;

    async fn close(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, peer_id: &PeerId) -> Result<SessionHandle, TransportError>;
}

pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

pub struct SessionHandle {
    pub session: Arc<dyn PeerSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}
