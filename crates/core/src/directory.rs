//! Access to the node's peer store.
//!
//! The reconnection queue only ever reads from the directory: it lists every
//! known peer once on startup and looks single peers up when they disconnect.
//! Tags are written by whoever owns the directory.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;

use crate::peer::{PeerId, PeerRecord, Tag};

pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("peer {0} not found")]
    NotFound(PeerId),
    #[error("peer directory unavailable: {0}")]
    Unavailable(String),
}

/// Read access to peer records.
pub trait PeerDirectory: Send + Sync + 'static {
    /// Snapshot of every known peer. May be empty.
    fn list_all(&self) -> impl Future<Output = DirectoryResult<Vec<PeerRecord>>> + Send;

    /// Current record for `peer`, failing with [`DirectoryError::NotFound`] when unknown.
    fn get(&self, peer: &PeerId) -> impl Future<Output = DirectoryResult<PeerRecord>> + Send;
}

/// Directory kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryPeerDirectory {
    peers: DashMap<PeerId, PeerRecord>,
    unavailable: AtomicBool,
}

impl MemoryPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PeerRecord) {
        self.peers.insert(record.id, record);
    }

    pub fn remove(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer).map(|(_, record)| record)
    }

    /// Adds or replaces a tag, creating the record if the peer is not known yet.
    pub fn tag_peer(&self, peer: PeerId, name: impl Into<String>, tag: Tag) {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerRecord::new(peer))
            .tags
            .insert(name.into(), tag);
    }

    /// Removes a tag, returning whether it was present.
    pub fn untag_peer(&self, peer: &PeerId, name: &str) -> bool {
        self.peers
            .get_mut(peer)
            .map(|mut record| record.tags.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Makes every subsequent read fail with [`DirectoryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn check_available(&self) -> DirectoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("store offline".into()));
        }
        Ok(())
    }
}

impl PeerDirectory for MemoryPeerDirectory {
    async fn list_all(&self) -> DirectoryResult<Vec<PeerRecord>> {
        self.check_available()?;
        Ok(self.peers.iter().map(|e| e.value().clone()).collect())
    }

    async fn get(&self, peer: &PeerId) -> DirectoryResult<PeerRecord> {
        self.check_available()?;
        self.peers
            .get(peer)
            .map(|e| e.value().clone())
            .ok_or(DirectoryError::NotFound(*peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::KEEP_ALIVE;

    #[tokio::test]
    async fn get_unknown_peer_is_not_found() {
        let dir = MemoryPeerDirectory::new();
        let peer = PeerId::random();
        assert_eq!(dir.get(&peer).await, Err(DirectoryError::NotFound(peer)));
    }

    #[tokio::test]
    async fn tag_and_untag_are_visible_to_reads() {
        let dir = MemoryPeerDirectory::new();
        let peer = PeerId::random();

        dir.tag_peer(peer, KEEP_ALIVE, Tag::new(1));
        assert!(dir.get(&peer).await.unwrap().is_keep_alive());

        assert!(dir.untag_peer(&peer, KEEP_ALIVE));
        assert!(!dir.get(&peer).await.unwrap().is_keep_alive());
        assert!(!dir.untag_peer(&peer, KEEP_ALIVE));
    }

    #[tokio::test]
    async fn unavailable_directory_fails_reads() {
        let dir = MemoryPeerDirectory::new();
        dir.insert(PeerRecord::new(PeerId::random()));
        dir.set_unavailable(true);
        assert!(matches!(
            dir.list_all().await,
            Err(DirectoryError::Unavailable(_))
        ));

        dir.set_unavailable(false);
        assert_eq!(dir.list_all().await.unwrap().len(), 1);
    }
}
