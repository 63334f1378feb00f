use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::identity::PeerId;
use crate::orchestrator::{ConnectionOrchestrator, Dispatch, Initiated, OrchestratorError};
use crate::progress::Progress;
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent};
use crate::stats::StatsCollector;
use crate::transmission::{ByteCounters, TransmissionController};
use crate::transport::SessionFactory;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// One running benchmark participant: the relay connection, the in-order
/// dispatch of inbound envelopes, and every session created through it.
pub struct Benchmark {
    local_id: PeerId,
    signaling: Arc<SignalingClient>,
    orchestrator: Arc<ConnectionOrchestrator>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Benchmark {
    /// Connects to the relay and starts dispatching. Resolves only once the
    /// connection attempt has either succeeded or failed.
    pub async fn connect(
        local_id: PeerId,
        relay_url: &Url,
        factory: Arc<dyn SessionFactory>,
        message_size: usize,
    ) -> Result<Self, BenchError> {
        let signaling = SignalingClient::connect(relay_url, local_id.clone()).await?;
        let events = signaling.events()?;

        let transmission = TransmissionController::new(message_size, ByteCounters::new());
        let orchestrator = ConnectionOrchestrator::new(factory, signaling.sender(), transmission);
        let dispatch = tokio::spawn(dispatch_loop(Arc::downgrade(&orchestrator), events));

        Ok(Self {
            local_id,
            signaling,
            orchestrator,
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn relay_url(&self) -> &Url {
        self.signaling.url()
    }

    pub fn orchestrator(&self) -> &Arc<ConnectionOrchestrator> {
        &self.orchestrator
    }

    pub async fn initiate(&self, remote_id: PeerId) -> Result<Initiated, BenchError> {
        Ok(self.orchestrator.initiate(remote_id).await?)
    }

    pub fn stats(&self) -> StatsCollector {
        StatsCollector::new(
            Arc::clone(self.orchestrator.sessions()),
            Arc::clone(self.orchestrator.transmission()),
        )
    }

    /// Stops dispatch, releases every channel and session, then drops the
    /// relay connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
        tracing::debug!(
            target = "bench",
            sessions = self.orchestrator.sessions().len(),
            channels = self.orchestrator.transmission().channels().len(),
            "releasing benchmark"
        );
        self.orchestrator.shutdown().await;
        self.signaling.close();
        tracing::info!(target = "bench", local_id = %self.local_id, "benchmark torn down");
    }
}

impl Drop for Benchmark {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.lock().take() {
            dispatch.abort();
        }
    }
}

async fn dispatch_loop(
    orchestrator: Weak<ConnectionOrchestrator>,
    mut events: mpsc::UnboundedReceiver<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        let envelope = match event {
            SignalingEvent::Envelope(envelope) => envelope,
            SignalingEvent::Disconnected => {
                tracing::info!(target = "bench", "relay disconnected; established sessions keep running");
                Progress::SignalingClosed.announce();
                break;
            }
        };
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        let peer_id = envelope.peer_id.clone();
        let kind = envelope.kind();
        match orchestrator.handle_envelope(envelope).await {
            Ok(Dispatch::Created) => {
                println!("Answering to {peer_id}");
            }
            Ok(outcome) => {
                tracing::trace!(target = "bench", peer = %peer_id, kind = ?kind, outcome = ?outcome, "envelope dispatched");
            }
            Err(err) => {
                tracing::warn!(target = "bench", peer = %peer_id, kind = ?kind, error = %err, "failed to apply envelope");
            }
        }
    }
}
