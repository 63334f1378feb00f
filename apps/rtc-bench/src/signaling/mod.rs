use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::transport::{DescriptionKind, IceCandidate, SessionDescription};

mod client;

pub use client::{SignalingClient, SignalingEvent};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    ConnectFailed(String),
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("malformed signaling envelope: {0}")]
    MalformedEnvelope(String),
    #[error("signaling connection is gone")]
    SendFailed,
    #[error("signaling event stream already taken")]
    EventsTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// A logical signaling message addressed to (outbound) or received from
/// (inbound) the peer named by `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub peer_id: PeerId,
    pub payload: SignalPayload,
}

impl SignalingEnvelope {
    pub fn description(peer_id: PeerId, description: SessionDescription) -> Self {
        Self {
            peer_id,
            payload: SignalPayload::Description(description),
        }
    }

    pub fn candidate(peer_id: PeerId, candidate: IceCandidate) -> Self {
        Self {
            peer_id,
            payload: SignalPayload::Candidate(candidate),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match &self.payload {
            SignalPayload::Description(desc) => match desc.kind {
                DescriptionKind::Offer => EnvelopeKind::Offer,
                DescriptionKind::Answer => EnvelopeKind::Answer,
            },
            SignalPayload::Candidate(_) => EnvelopeKind::Candidate,
        }
    }

    /// Parses one relay text frame. Unknown `type`, a missing or empty `id`,
    /// or a missing kind-specific field all yield `MalformedEnvelope`.
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let wire: WireEnvelope = serde_json::from_str(text)
            .map_err(|err| SignalingError::MalformedEnvelope(err.to_string()))?;
        let envelope = match wire {
            WireEnvelope::Offer { id, description } => Self::description(
                id,
                SessionDescription::new(DescriptionKind::Offer, description),
            ),
            WireEnvelope::Answer { id, description } => Self::description(
                id,
                SessionDescription::new(DescriptionKind::Answer, description),
            ),
            WireEnvelope::Candidate { id, candidate, mid } => {
                Self::candidate(id, IceCandidate { candidate, mid })
            }
        };
        if envelope.peer_id.is_empty() {
            return Err(SignalingError::MalformedEnvelope("empty id".into()));
        }
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        let id = self.peer_id.clone();
        let wire = match &self.payload {
            SignalPayload::Description(desc) => match desc.kind {
                DescriptionKind::Offer => WireEnvelope::Offer {
                    id,
                    description: desc.sdp.clone(),
                },
                DescriptionKind::Answer => WireEnvelope::Answer {
                    id,
                    description: desc.sdp.clone(),
                },
            },
            SignalPayload::Candidate(candidate) => WireEnvelope::Candidate {
                id,
                candidate: candidate.candidate.clone(),
                mid: candidate.mid.clone(),
            },
        };
        serde_json::to_string(&wire).map_err(|err| SignalingError::MalformedEnvelope(err.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireEnvelope {
    Offer { id: PeerId, description: String },
    Answer { id: PeerId, description: String },
    Candidate { id: PeerId, candidate: String, mid: String },
}

/// Cloneable handle for queueing outbound envelopes onto the relay writer.
///
/// Sends fail with `SendFailed` once the relay connection has gone away.
#[derive(Debug, Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl SignalingSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalingError> {
        self.tx.send(envelope).map_err(|_| SignalingError::SendFailed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn decodes_offer_and_answer() {
        let offer = SignalingEnvelope::decode(r#"{"id":"AB12","type":"offer","description":"v=0"}"#)
            .expect("offer");
        assert_eq!(offer.peer_id, PeerId::from("AB12"));
        assert_eq!(offer.kind(), EnvelopeKind::Offer);
        assert_eq!(
            offer.payload,
            SignalPayload::Description(SessionDescription::new(DescriptionKind::Offer, "v=0"))
        );

        let answer =
            SignalingEnvelope::decode(r#"{"type":"answer","id":"ZZ99","description":"v=0"}"#)
                .expect("answer");
        assert_eq!(answer.kind(), EnvelopeKind::Answer);
    }

    #[test]
    fn decodes_candidate_with_mid() {
        let envelope = SignalingEnvelope::decode(
            r#"{"id":"AB12","type":"candidate","candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","mid":"0"}"#,
        )
        .expect("candidate");
        match envelope.payload {
            SignalPayload::Candidate(candidate) => {
                assert_eq!(candidate.mid, "0");
                assert!(candidate.candidate.starts_with("candidate:1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn ignores_unknown_extra_fields() {
        let envelope = SignalingEnvelope::decode(
            r#"{"id":"AB12","type":"offer","description":"v=0","extra":42}"#,
        )
        .expect("offer");
        assert_eq!(envelope.kind(), EnvelopeKind::Offer);
    }

    #[test]
    fn rejects_malformed_frames() {
        let frames = [
            "",
            "not json",
            "[]",
            r#"{"type":"offer","description":"v=0"}"#,
            r#"{"id":"AB12","description":"v=0"}"#,
            r#"{"id":"","type":"offer","description":"v=0"}"#,
            r#"{"id":7,"type":"offer","description":"v=0"}"#,
            r#"{"id":"AB12","type":"bye"}"#,
            r#"{"id":"AB12","type":"offer"}"#,
            r#"{"id":"AB12","type":"candidate","candidate":"c"}"#,
            r#"{"id":"AB12","type":"candidate","mid":"0"}"#,
        ];
        for frame in frames {
            assert!(
                matches!(
                    SignalingEnvelope::decode(frame),
                    Err(SignalingError::MalformedEnvelope(_))
                ),
                "frame should be rejected: {frame}"
            );
        }
    }

    #[test]
    fn encodes_wire_fields() {
        let offer = SignalingEnvelope::description(
            PeerId::from("ZZ99"),
            SessionDescription::new(DescriptionKind::Offer, "v=0"),
        );
        let value: Value = serde_json::from_str(&offer.encode().expect("encode")).expect("json");
        assert_eq!(value, json!({"id": "ZZ99", "type": "offer", "description": "v=0"}));

        let candidate = SignalingEnvelope::candidate(
            PeerId::from("ZZ99"),
            IceCandidate {
                candidate: "candidate:0".into(),
                mid: "data".into(),
            },
        );
        let value: Value =
            serde_json::from_str(&candidate.encode().expect("encode")).expect("json");
        assert_eq!(
            value,
            json!({"id": "ZZ99", "type": "candidate", "candidate": "candidate:0", "mid": "data"})
        );
    }

    #[test]
    fn sender_fails_once_writer_is_gone() {
        let (sender, rx) = SignalingSender::channel();
        drop(rx);
        let envelope = SignalingEnvelope::description(
            PeerId::from("ZZ99"),
            SessionDescription::new(DescriptionKind::Answer, "v=0"),
        );
        assert!(sender.is_closed());
        assert!(matches!(sender.send(envelope), Err(SignalingError::SendFailed)));
    }
}
