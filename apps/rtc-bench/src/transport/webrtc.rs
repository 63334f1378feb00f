use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::stats::StatsReportType;

use super::{
    ChannelEvent, ChannelHandle, ChannelPayload, DataChannel, DescriptionKind, GatheringState,
    IceCandidate, PeerSession, SessionDescription, SessionEvent, SessionFactory, SessionHandle,
    SessionState, SessionStats, TransportError,
};
use crate::identity::PeerId;

/// Buffered-amount-low fires when the send buffer drains back to this level.
const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 0;

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn build_api() -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates webrtc-rs peer connections sharing one API instance.
pub struct WebRtcSessionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcSessionFactory {
    /// `ice_servers` holds `stun:<host>:<port>` urls; empty means host
    /// candidates only.
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TransportError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn create_session(&self, peer_id: &PeerId) -> Result<SessionHandle, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(CandidateGate::default());

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                if let Some(state) = map_session_state(state) {
                    let _ = tx.send(SessionEvent::StateChanged(state));
                }
            })
        }));

        let gathering_tx = events_tx.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let tx = gathering_tx.clone();
            Box::pin(async move {
                if let Some(state) = map_gathering_state(state) {
                    let _ = tx.send(SessionEvent::GatheringStateChanged(state));
                }
            })
        }));

        let candidate_tx = events_tx.clone();
        let candidate_gate = Arc::clone(&gate);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let gate = Arc::clone(&candidate_gate);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid.unwrap_or_default(),
                        };
                        gate.push(&tx, candidate);
                    }
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let channel_tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = dc.label(), "remote data channel received");
                let handle = wrap_channel(dc).await;
                let _ = tx.send(SessionEvent::DataChannel(handle));
            })
        }));

        let session = WebRtcSession {
            peer_id: peer_id.clone(),
            pc,
            events_tx,
            gate,
        };
        Ok(SessionHandle {
            session: Arc::new(session),
            events: events_rx,
        })
    }
}

/// Holds local candidates back until the local description has been
/// emitted, so the remote side never sees a candidate before the offer or
/// answer it belongs to.
#[derive(Default)]
struct CandidateGate {
    inner: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    open: bool,
    pending: Vec<IceCandidate>,
}

impl CandidateGate {
    fn push(&self, tx: &mpsc::UnboundedSender<SessionEvent>, candidate: IceCandidate) {
        let mut state = self.inner.lock();
        if state.open {
            let _ = tx.send(SessionEvent::LocalCandidate(candidate));
        } else {
            state.pending.push(candidate);
        }
    }

    fn open_with(&self, tx: &mpsc::UnboundedSender<SessionEvent>, description: SessionDescription) {
        let mut state = self.inner.lock();
        let _ = tx.send(SessionEvent::LocalDescription(description));
        state.open = true;
        for candidate in state.pending.drain(..) {
            let _ = tx.send(SessionEvent::LocalCandidate(candidate));
        }
    }
}

struct WebRtcSession {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    gate: Arc<CandidateGate>,
}

impl WebRtcSession {
    async fn publish_local(&self, kind: DescriptionKind) -> Result<(), TransportError> {
        let description = match kind {
            DescriptionKind::Offer => self.pc.create_offer(None).await,
            DescriptionKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(to_negotiation_error)?;
        let sdp = description.sdp.clone();
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)?;
        tracing::debug!(target = "webrtc", peer = %self.peer_id, kind = kind.as_str(), "local description set");
        self.gate
            .open_with(&self.events_tx, SessionDescription::new(kind, sdp));
        Ok(())
    }
}

#[async_trait]
impl PeerSession for WebRtcSession {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let kind = description.kind;
        let remote = match kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_negotiation_error)?;
        if kind == DescriptionKind::Offer {
            self.publish_local(DescriptionKind::Answer).await?;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.mid),
            sdp_mline_index: None,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_negotiation_error)
    }

    async fn create_data_channel(&self, label: &str) -> Result<ChannelHandle, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        let handle = wrap_channel(dc).await;
        self.publish_local(DescriptionKind::Offer).await?;
        Ok(handle)
    }

    async fn stats(&self) -> SessionStats {
        let report = self.pc.get_stats().await;
        let mut best: Option<(bool, SessionStats)> = None;
        for entry in report.reports.values() {
            let StatsReportType::CandidatePair(pair) = entry else {
                continue;
            };
            let rtt = (pair.current_round_trip_time > 0.0)
                .then(|| Duration::from_secs_f64(pair.current_round_trip_time));
            let stats = SessionStats {
                bytes_sent: pair.bytes_sent,
                bytes_received: pair.bytes_received,
                rtt,
            };
            let replace = match &best {
                None => true,
                Some((nominated, current)) => {
                    (pair.nominated && !nominated)
                        || (pair.nominated == *nominated
                            && stats.bytes_sent + stats.bytes_received
                                > current.bytes_sent + current.bytes_received)
                }
            };
            if replace {
                best = Some((pair.nominated, stats));
            }
        }
        best.map(|(_, stats)| stats).unwrap_or_default()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", peer = %self.peer_id, error = %err, "peer connection close failed");
        }
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

/// Registers every channel handler up front and forwards them as events.
async fn wrap_channel(dc: Arc<RTCDataChannel>) -> ChannelHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_tx.send(ChannelEvent::Open);
        })
    }));

    let message_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let payload = if msg.is_string {
                ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelPayload::Binary(msg.data)
            };
            let _ = tx.send(ChannelEvent::Message(payload));
        })
    }));

    let close_tx = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Closed);
        })
    }));

    let error_tx = tx.clone();
    dc.on_error(Box::new(move |err| {
        let tx = error_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::Error(err.to_string()));
        })
    }));

    dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
        .await;
    let low_tx = tx;
    dc.on_buffered_amount_low(Box::new(move || {
        let tx = low_tx.clone();
        Box::pin(async move {
            let _ = tx.send(ChannelEvent::BufferedAmountLow);
        })
    }))
    .await;

    ChannelHandle {
        channel: Arc::new(WebRtcDataChannel { inner: dc }),
        events: rx,
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn send(&self, payload: &Bytes) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.inner
            .send(payload)
            .await
            .map_err(|err| TransportError::SendFailed(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.inner.close().await {
            tracing::debug!(target = "webrtc", label = self.inner.label(), error = %err, "data channel close failed");
        }
    }
}

fn map_session_state(state: RTCPeerConnectionState) -> Option<SessionState> {
    match state {
        RTCPeerConnectionState::New => Some(SessionState::New),
        RTCPeerConnectionState::Connecting => Some(SessionState::Connecting),
        RTCPeerConnectionState::Connected => Some(SessionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(SessionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(SessionState::Failed),
        RTCPeerConnectionState::Closed => Some(SessionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_gathering_state(state: RTCIceGathererState) -> Option<GatheringState> {
    match state {
        RTCIceGathererState::New => Some(GatheringState::New),
        RTCIceGathererState::Gathering => Some(GatheringState::InProgress),
        RTCIceGathererState::Complete => Some(GatheringState::Complete),
        RTCIceGathererState::Closed | RTCIceGathererState::Unspecified => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(mid: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{mid}"),
            mid: mid.to_string(),
        }
    }

    #[test]
    fn gate_holds_candidates_until_description() {
        let gate = CandidateGate::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        gate.push(&tx, candidate("0"));
        assert!(rx.try_recv().is_err());

        gate.open_with(&tx, SessionDescription::new(DescriptionKind::Offer, "v=0"));
        gate.push(&tx, candidate("1"));

        assert!(matches!(rx.try_recv(), Ok(SessionEvent::LocalDescription(desc)) if desc.kind == DescriptionKind::Offer));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::LocalCandidate(c)) if c.mid == "0"));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::LocalCandidate(c)) if c.mid == "1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn maps_connection_states() {
        assert_eq!(
            map_session_state(RTCPeerConnectionState::Connected),
            Some(SessionState::Connected)
        );
        assert_eq!(map_session_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_gathering_state(RTCIceGathererState::Gathering),
            Some(GatheringState::InProgress)
        );
    }

    #[tokio::test]
    async fn factory_builds_session_without_ice_servers() {
        let factory = WebRtcSessionFactory::new(Vec::new()).expect("factory");
        let handle = factory
            .create_session(&PeerId::from("ZZ99"))
            .await
            .expect("session");
        assert_eq!(handle.session.peer_id().as_str(), "ZZ99");
        assert_eq!(handle.session.stats().await, SessionStats::default());
        handle.session.close().await;
    }
}
