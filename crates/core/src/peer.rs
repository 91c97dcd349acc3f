//! Peer identities and the tagged records the directory keeps for them.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Reserved tag name marking a peer the node must stay connected to.
///
/// Only the presence of the tag matters, its value is never inspected.
pub const KEEP_ALIVE: &str = "keep-alive";

const PEER_ID_LEN: usize = 32;

/// Opaque identity of a peer. Cheap to copy, ordered and hashable so it can key
/// every map in the crate.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub const fn new(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0; PEER_ID_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParsePeerIdError {
    #[error("invalid base58 peer id: {0}")]
    Encoding(String),
    #[error("peer id must be {PEER_ID_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ParsePeerIdError::Encoding(e.to_string()))?;
        let bytes: [u8; PEER_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ParsePeerIdError::Length(bytes.len()))?;
        Ok(Self(bytes))
    }
}

/// Numeric tag attached to a peer record by code outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub value: u32,
}

impl Tag {
    pub const fn new(value: u32) -> Self {
        Self { value }
    }
}

/// Snapshot of what the directory knows about a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    #[serde(default)]
    pub tags: BTreeMap<String, Tag>,
}

impl PeerRecord {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, name: impl Into<String>, tag: Tag) -> Self {
        self.tags.insert(name.into(), tag);
        self
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Whether the node should hold a persistent connection to this peer.
    pub fn is_keep_alive(&self) -> bool {
        self.has_tag(KEEP_ALIVE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display_roundtrips_through_from_str() {
        let peer = PeerId::random();
        let parsed: PeerId = peer.to_string().parse().unwrap();
        assert_eq!(peer, parsed);
    }

    #[test]
    fn peer_id_rejects_wrong_length() {
        let short = bs58::encode([1u8; 4]).into_string();
        assert_eq!(
            short.parse::<PeerId>(),
            Err(ParsePeerIdError::Length(4))
        );
        assert!(matches!(
            "0OIl".parse::<PeerId>(),
            Err(ParsePeerIdError::Encoding(_))
        ));
    }

    #[test]
    fn keep_alive_ignores_tag_value() {
        let peer = PeerId::random();
        assert!(!PeerRecord::new(peer).is_keep_alive());
        assert!(PeerRecord::new(peer)
            .with_tag(KEEP_ALIVE, Tag::new(0))
            .is_keep_alive());
        assert!(PeerRecord::new(peer)
            .with_tag(KEEP_ALIVE, Tag::new(u32::MAX))
            .is_keep_alive());
    }

    #[test]
    fn other_tags_do_not_mark_keep_alive() {
        let record = PeerRecord::new(PeerId::random())
            .with_tag("keep-alive-relay", Tag::new(1))
            .with_tag("bootstrap", Tag::new(50));
        assert!(!record.is_keep_alive());
        assert!(record.has_tag("bootstrap"));
    }
}
