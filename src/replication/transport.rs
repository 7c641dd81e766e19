use serde::{Deserialize, Serialize};
use std::fmt;

use thiserror::Error;

/// Identity of a peer node in the cluster mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("send to peer {peer} failed: {reason}")]
    Send { peer: PeerId, reason: String },
    #[error("send to peer {0} timed out")]
    Timeout(PeerId),
}

/// Mesh transport owned by the surrounding service.
///
/// `send` is called from the flush loop for one peer at a time; any timeout is
/// the transport's to enforce. `members` is a point-in-time snapshot of the
/// other nodes in the cluster, excluding the local one.
pub trait Transport: Send + Sync {
    fn send(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError>;

    fn members(&self) -> Vec<PeerId>;

    fn is_online(&self, peer: PeerId) -> bool;
}
