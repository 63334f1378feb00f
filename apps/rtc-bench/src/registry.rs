use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::identity::PeerId;
use crate::transport::{DataChannel, PeerSession};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session for peer {0} already exists")]
    DuplicateSession(PeerId),
    #[error("data channel for peer {0} already exists")]
    DuplicateChannel(PeerId),
}

/// Authoritative owner of every live session, keyed by peer id.
///
/// Everything else refers to a session by id and resolves it here, so a
/// lookup after [`SessionRegistry::remove_all`] simply comes back empty.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<PeerId, Arc<dyn PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerSession>> {
        self.sessions.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    pub fn insert(
        &self,
        peer_id: PeerId,
        session: Arc<dyn PeerSession>,
    ) -> Result<(), RegistryError> {
        let mut guard = self.sessions.write();
        if guard.contains_key(&peer_id) {
            return Err(RegistryError::DuplicateSession(peer_id));
        }
        guard.insert(peer_id, session);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn PeerSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Releases every session; the caller decides whether to close them.
    pub fn remove_all(&self) -> Vec<Arc<dyn PeerSession>> {
        self.sessions.write().drain().map(|(_, session)| session).collect()
    }
}

/// At most one data channel per peer. Entries stay after the channel closes
/// and are only released at shutdown.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<PeerId, Arc<dyn DataChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<Arc<dyn DataChannel>> {
        self.channels.read().get(peer_id).cloned()
    }

    pub fn insert(
        &self,
        peer_id: PeerId,
        channel: Arc<dyn DataChannel>,
    ) -> Result<(), RegistryError> {
        let mut guard = self.channels.write();
        if guard.contains_key(&peer_id) {
            return Err(RegistryError::DuplicateChannel(peer_id));
        }
        guard.insert(peer_id, channel);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn DataChannel>> {
        self.channels.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    pub fn remove_all(&self) -> Vec<Arc<dyn DataChannel>> {
        self.channels.write().drain().map(|(_, channel)| channel).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SessionFactory;
    use crate::transport::mock::{MockDataChannel, MockSessionFactory};

    #[tokio::test]
    async fn rejects_duplicate_session() {
        let factory = MockSessionFactory::new();
        let registry = SessionRegistry::new();
        let peer = PeerId::from("AB12");
        let first = factory.create_session(&peer).await.expect("session");
        let second = factory.create_session(&peer).await.expect("session");

        registry
            .insert(peer.clone(), first.session)
            .expect("first insert");
        assert_eq!(
            registry.insert(peer.clone(), second.session).unwrap_err(),
            RegistryError::DuplicateSession(peer.clone())
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&peer));
    }

    #[tokio::test]
    async fn remove_all_empties_registry() {
        let factory = MockSessionFactory::new();
        let registry = SessionRegistry::new();
        for id in ["AAAA", "BBBB", "CCCC"] {
            let peer = PeerId::from(id);
            let handle = factory.create_session(&peer).await.expect("session");
            registry.insert(peer, handle.session).expect("insert");
        }
        assert_eq!(registry.remove_all().len(), 3);
        assert!(registry.is_empty());
        assert!(registry.get(&PeerId::from("AAAA")).is_none());
    }

    #[test]
    fn channel_registry_keeps_first_channel() {
        let registry = ChannelRegistry::new();
        let peer = PeerId::from("ZZ99");
        let (first, first_handle) = MockDataChannel::new("benchmark", true, 1);
        let (_second, second_handle) = MockDataChannel::new("other", true, 1);

        registry
            .insert(peer.clone(), first_handle.channel)
            .expect("insert");
        assert_eq!(
            registry.insert(peer.clone(), second_handle.channel).unwrap_err(),
            RegistryError::DuplicateChannel(peer.clone())
        );
        let stored = registry.get(&peer).expect("stored");
        assert_eq!(stored.label(), first.label());
    }

    #[test]
    fn concurrent_inserts_keep_unique_keys() {
        let registry = Arc::new(ChannelRegistry::new());
        let threads = (0..8)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let mut inserted = 0;
                    for n in 0..50 {
                        let peer = PeerId::new(format!("peer-{}", (worker * 50 + n) % 100));
                        let (_channel, handle) = MockDataChannel::new("benchmark", true, 1);
                        if registry.insert(peer, handle.channel).is_ok() {
                            inserted += 1;
                        }
                    }
                    inserted
                })
            })
            .collect::<Vec<_>>();
        let inserted: usize = threads
            .into_iter()
            .map(|handle| handle.join().expect("worker"))
            .sum();
        assert_eq!(inserted, 100);
        assert_eq!(registry.len(), 100);
    }
}
