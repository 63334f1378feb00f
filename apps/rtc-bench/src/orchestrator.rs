use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::identity::PeerId;
use crate::progress::Progress;
use crate::registry::{RegistryError, SessionRegistry};
use crate::signaling::{EnvelopeKind, SignalPayload, SignalingEnvelope, SignalingSender};
use crate::transmission::TransmissionController;
use crate::transport::{PeerSession, SessionEvent, SessionFactory, TransportError};

/// Label of the data channel opened by the initiating side.
pub const CHANNEL_LABEL: &str = "benchmark";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened to one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Applied to an existing session.
    Routed,
    /// An offer from an unknown peer created a session and was applied to it.
    Created,
    /// No session exists and the envelope cannot start one.
    Dropped,
}

/// Result of asking to open a session towards a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiated {
    /// A new session was created and its offer is on its way.
    Offered,
    /// A session with that peer already exists; nothing was created.
    Existing,
}

/// Decides whether an envelope starts a session or routes to an existing one,
/// and wires every session's events back into signaling and transmission.
pub struct ConnectionOrchestrator {
    factory: Arc<dyn SessionFactory>,
    sessions: Arc<SessionRegistry>,
    signaling: SignalingSender,
    transmission: Arc<TransmissionController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionOrchestrator {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        signaling: SignalingSender,
        transmission: Arc<TransmissionController>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            sessions: Arc::new(SessionRegistry::new()),
            signaling,
            transmission,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn transmission(&self) -> &Arc<TransmissionController> {
        &self.transmission
    }

    pub async fn handle_envelope(
        &self,
        envelope: SignalingEnvelope,
    ) -> Result<Dispatch, OrchestratorError> {
        let kind = envelope.kind();
        let SignalingEnvelope { peer_id, payload } = envelope;

        let (session, outcome) = match self.sessions.get(&peer_id) {
            Some(session) => (session, Dispatch::Routed),
            None if kind == EnvelopeKind::Offer => {
                tracing::info!(target = "orchestrator", peer = %peer_id, "accepting offer from new peer");
                (self.open_session(peer_id.clone()).await?, Dispatch::Created)
            }
            None => {
                tracing::debug!(
                    target = "orchestrator",
                    peer = %peer_id,
                    kind = ?kind,
                    "dropping unroutable envelope"
                );
                return Ok(Dispatch::Dropped);
            }
        };

        match payload {
            SignalPayload::Description(description) => {
                tracing::debug!(target = "orchestrator", peer = %peer_id, kind = description.kind.as_str(), "applying remote description");
                session.set_remote_description(description).await?;
            }
            SignalPayload::Candidate(candidate) => {
                tracing::trace!(target = "orchestrator", peer = %peer_id, mid = %candidate.mid, "applying remote candidate");
                session.add_remote_candidate(candidate).await?;
            }
        }
        Ok(outcome)
    }

    /// Creates a session towards `peer_id` and opens the benchmark channel on
    /// it; the local offer goes out through signaling once ready. A peer that
    /// already has a session is left untouched.
    pub async fn initiate(&self, peer_id: PeerId) -> Result<Initiated, OrchestratorError> {
        if self.sessions.contains(&peer_id) {
            tracing::info!(target = "orchestrator", peer = %peer_id, "session already exists");
            return Ok(Initiated::Existing);
        }
        tracing::info!(target = "orchestrator", peer = %peer_id, "initiating session");
        let session = self.open_session(peer_id.clone()).await?;
        Progress::CreatingChannel {
            label: CHANNEL_LABEL.to_string(),
        }
        .announce();
        let handle = session.create_data_channel(CHANNEL_LABEL).await?;
        self.transmission.attach(peer_id, handle)?;
        Ok(Initiated::Offered)
    }

    async fn open_session(&self, peer_id: PeerId) -> Result<Arc<dyn PeerSession>, OrchestratorError> {
        let handle = self.factory.create_session(&peer_id).await?;
        if let Err(err) = self.sessions.insert(peer_id.clone(), Arc::clone(&handle.session)) {
            handle.session.close().await;
            return Err(err.into());
        }

        let wiring = SessionWiring {
            peer_id,
            signaling: self.signaling.clone(),
            transmission: Arc::downgrade(&self.transmission),
        };
        let task = tokio::spawn(wiring.run(handle.events));
        self.tasks.lock().push(task);
        Ok(handle.session)
    }

    /// Closes every channel, then every session, and stops the wiring tasks.
    pub async fn shutdown(&self) {
        self.transmission.shutdown().await;
        let sessions = self.sessions.remove_all();
        for session in &sessions {
            session.close().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!(target = "orchestrator", sessions = sessions.len(), "sessions released");
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Consumes one session's events. Holds only the peer id, the signaling
/// sender and a weak controller handle, never the session itself.
struct SessionWiring {
    peer_id: PeerId,
    signaling: SignalingSender,
    transmission: Weak<TransmissionController>,
}

impl SessionWiring {
    async fn run(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::LocalDescription(description) => {
                    let kind = description.kind.as_str();
                    self.signal(
                        SignalingEnvelope::description(self.peer_id.clone(), description),
                        kind,
                    );
                }
                SessionEvent::LocalCandidate(candidate) => {
                    self.signal(
                        SignalingEnvelope::candidate(self.peer_id.clone(), candidate),
                        "candidate",
                    );
                }
                SessionEvent::DataChannel(handle) => {
                    let Some(transmission) = self.transmission.upgrade() else {
                        tracing::debug!(target = "orchestrator", peer = %self.peer_id, "inbound channel after teardown");
                        continue;
                    };
                    let label = handle.channel.label().to_string();
                    tracing::info!(target = "orchestrator", peer = %self.peer_id, label = %label, "inbound data channel");
                    match transmission.attach(self.peer_id.clone(), handle) {
                        Ok(()) => Progress::ChannelReceived {
                            peer: self.peer_id.clone(),
                            label,
                        }
                        .announce(),
                        Err(err) => {
                            tracing::warn!(target = "orchestrator", peer = %self.peer_id, error = %err, "ignoring extra data channel");
                        }
                    }
                }
                SessionEvent::StateChanged(state) => {
                    tracing::info!(target = "orchestrator", peer = %self.peer_id, state = %state, "session state changed");
                }
                SessionEvent::GatheringStateChanged(state) => {
                    tracing::debug!(target = "orchestrator", peer = %self.peer_id, state = %state, "gathering state changed");
                }
            }
        }
    }

    fn signal(&self, envelope: SignalingEnvelope, kind: &'static str) {
        match self.signaling.send(envelope) {
            Ok(()) => {
                tracing::debug!(target = "orchestrator", peer = %self.peer_id, kind, "signal queued");
            }
            Err(err) => {
                tracing::debug!(target = "orchestrator", peer = %self.peer_id, kind, error = %err, "signaling gone; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::ByteCounters;
    use crate::transport::mock::{MOCK_ANSWER_SDP, MOCK_OFFER_SDP, MockSessionFactory};
    use crate::transport::{DataChannel, DescriptionKind, IceCandidate, SessionDescription};
    use std::time::Duration;

    struct Fixture {
        factory: Arc<MockSessionFactory>,
        orchestrator: Arc<ConnectionOrchestrator>,
        outbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    }

    fn fixture() -> Fixture {
        let factory = MockSessionFactory::new();
        let (sender, outbound) = SignalingSender::channel();
        let transmission = TransmissionController::new(1024, ByteCounters::new());
        let orchestrator = ConnectionOrchestrator::new(
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            sender,
            transmission,
        );
        Fixture {
            factory,
            orchestrator,
            outbound,
        }
    }

    async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<SignalingEnvelope>) -> SignalingEnvelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for signal")
            .expect("signaling channel closed")
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn offer(from: &str) -> SignalingEnvelope {
        SignalingEnvelope::description(
            PeerId::from(from),
            SessionDescription::new(DescriptionKind::Offer, "remote-offer"),
        )
    }

    fn answer(from: &str) -> SignalingEnvelope {
        SignalingEnvelope::description(
            PeerId::from(from),
            SessionDescription::new(DescriptionKind::Answer, "remote-answer"),
        )
    }

    fn candidate(from: &str, mid: &str) -> SignalingEnvelope {
        SignalingEnvelope::candidate(
            PeerId::from(from),
            IceCandidate {
                candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 50000 typ host".into(),
                mid: mid.into(),
            },
        )
    }

    #[tokio::test]
    async fn initiate_sends_offer_for_remote_peer() {
        let mut fx = fixture();
        fx.orchestrator
            .initiate(PeerId::from("ZZ99"))
            .await
            .expect("initiate");

        assert!(fx.orchestrator.sessions().contains(&PeerId::from("ZZ99")));
        let envelope = next_outbound(&mut fx.outbound).await;
        assert_eq!(envelope.peer_id, PeerId::from("ZZ99"));
        assert_eq!(
            envelope.payload,
            SignalPayload::Description(SessionDescription::new(
                DescriptionKind::Offer,
                MOCK_OFFER_SDP
            ))
        );

        // Sending starts once the local channel opens.
        let session = fx.factory.session("ZZ99").expect("session");
        let channel = session.local_channels().pop().expect("local channel");
        assert_eq!(channel.label(), CHANNEL_LABEL);
        assert_eq!(channel.send_count(), 0);
        channel.open();
        wait_until(|| channel.send_count() == 1).await;
    }

    #[tokio::test]
    async fn offer_from_unknown_peer_creates_session_and_answers() {
        let mut fx = fixture();
        let outcome = fx
            .orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Dispatch::Created);

        let session = fx.factory.session("AB12").expect("session");
        assert_eq!(
            session.remote_descriptions(),
            vec![SessionDescription::new(DescriptionKind::Offer, "remote-offer")]
        );
        let envelope = next_outbound(&mut fx.outbound).await;
        assert_eq!(envelope.peer_id, PeerId::from("AB12"));
        assert_eq!(envelope.kind(), EnvelopeKind::Answer);
        assert_eq!(
            envelope.payload,
            SignalPayload::Description(SessionDescription::new(
                DescriptionKind::Answer,
                MOCK_ANSWER_SDP
            ))
        );
    }

    #[tokio::test]
    async fn unroutable_envelopes_have_no_side_effect() {
        let mut fx = fixture();
        for envelope in [answer("AB12"), candidate("AB12", "0")] {
            let outcome = fx
                .orchestrator
                .handle_envelope(envelope)
                .await
                .expect("dispatch");
            assert_eq!(outcome, Dispatch::Dropped);
        }
        assert_eq!(fx.factory.created_count(), 0);
        assert!(fx.orchestrator.sessions().is_empty());
        assert!(fx.outbound.try_recv().is_err());
        assert_eq!(fx.orchestrator.transmission().counters().peek().sent, 0);
    }

    #[tokio::test]
    async fn session_created_only_when_first_known_envelope_is_offer() {
        let fx = fixture();
        let sequence = [
            (candidate("AB12", "0"), Dispatch::Dropped),
            (answer("AB12"), Dispatch::Dropped),
            (offer("AB12"), Dispatch::Created),
            (candidate("AB12", "data"), Dispatch::Routed),
            (offer("AB12"), Dispatch::Routed),
        ];
        for (envelope, expected) in sequence {
            let outcome = fx
                .orchestrator
                .handle_envelope(envelope)
                .await
                .expect("dispatch");
            assert_eq!(outcome, expected);
        }
        assert_eq!(fx.factory.created_count(), 1);

        let session = fx.factory.session("AB12").expect("session");
        let candidates = session.remote_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].mid, "data");
        assert_eq!(session.remote_descriptions().len(), 2);
    }

    #[tokio::test]
    async fn answer_routes_to_initiated_session() {
        let fx = fixture();
        fx.orchestrator
            .initiate(PeerId::from("ZZ99"))
            .await
            .expect("initiate");
        let outcome = fx
            .orchestrator
            .handle_envelope(answer("ZZ99"))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Dispatch::Routed);
        let session = fx.factory.session("ZZ99").expect("session");
        assert_eq!(
            session.remote_descriptions(),
            vec![SessionDescription::new(DescriptionKind::Answer, "remote-answer")]
        );
    }

    #[tokio::test]
    async fn local_candidates_are_signaled_with_mid() {
        let mut fx = fixture();
        fx.orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");
        let _answer = next_outbound(&mut fx.outbound).await;

        let session = fx.factory.session("AB12").expect("session");
        session.emit(SessionEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:7".into(),
            mid: "0".into(),
        }));
        let envelope = next_outbound(&mut fx.outbound).await;
        assert_eq!(envelope.kind(), EnvelopeKind::Candidate);
        assert_eq!(
            envelope.payload,
            SignalPayload::Candidate(IceCandidate {
                candidate: "candidate:7".into(),
                mid: "0".into(),
            })
        );
    }

    #[tokio::test]
    async fn inbound_channel_starts_sending() {
        let fx = fixture();
        fx.orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");
        let session = fx.factory.session("AB12").expect("session");
        let channel = session.open_remote_channel(CHANNEL_LABEL);
        wait_until(|| channel.send_count() == 1).await;
        assert!(
            fx.orchestrator
                .transmission()
                .channels()
                .get(&PeerId::from("AB12"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn lost_signaling_does_not_block_sessions() {
        let fx = fixture();
        drop(fx.outbound);
        let outcome = fx
            .orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Dispatch::Created);

        let session = fx.factory.session("AB12").expect("session");
        let channel = session.open_remote_channel(CHANNEL_LABEL);
        wait_until(|| channel.send_count() == 1).await;
    }

    #[tokio::test]
    async fn repeated_initiate_keeps_existing_session() {
        let fx = fixture();
        let first = fx
            .orchestrator
            .initiate(PeerId::from("ZZ99"))
            .await
            .expect("initiate");
        assert_eq!(first, Initiated::Offered);
        let second = fx
            .orchestrator
            .initiate(PeerId::from("ZZ99"))
            .await
            .expect("initiate again");
        assert_eq!(second, Initiated::Existing);
        assert_eq!(fx.factory.created_count(), 1);
        assert_eq!(fx.orchestrator.sessions().len(), 1);
    }

    #[tokio::test]
    async fn initiate_towards_answering_peer_leaves_session_running() {
        let fx = fixture();
        fx.orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");
        let session = fx.factory.session("AB12").expect("session");
        let channel = session.open_remote_channel(CHANNEL_LABEL);
        wait_until(|| channel.send_count() == 1).await;

        let outcome = fx
            .orchestrator
            .initiate(PeerId::from("AB12"))
            .await
            .expect("initiate");
        assert_eq!(outcome, Initiated::Existing);
        assert_eq!(fx.factory.created_count(), 1);
        assert!(!session.is_closed());
        assert!(session.local_channels().is_empty());
        assert!(fx.orchestrator.transmission().channels().get(&PeerId::from("AB12")).is_some());
    }

    #[tokio::test]
    async fn shutdown_releases_sessions_and_channels() {
        let fx = fixture();
        fx.orchestrator
            .initiate(PeerId::from("ZZ99"))
            .await
            .expect("initiate");
        fx.orchestrator
            .handle_envelope(offer("AB12"))
            .await
            .expect("dispatch");

        fx.orchestrator.shutdown().await;
        assert!(fx.orchestrator.sessions().is_empty());
        assert!(fx.orchestrator.transmission().channels().is_empty());
        for id in ["ZZ99", "AB12"] {
            assert!(fx.factory.session(id).expect("session").is_closed());
        }
        let local = fx
            .factory
            .session("ZZ99")
            .and_then(|session| session.local_channels().pop())
            .expect("local channel");
        local.drain();
        local.fire_low();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(local.send_count(), 0);

        // Envelopes for released peers are no longer routable.
        let outcome = fx
            .orchestrator
            .handle_envelope(candidate("ZZ99", "0"))
            .await
            .expect("dispatch");
        assert_eq!(outcome, Dispatch::Dropped);
    }
}
