//! Subscription events exchanged between nodes.
//!
//! A node tells its peers when it gains its first local subscriber on a topic
//! and when it loses the last one; peers record the node as interested so
//! publishes reach it. The events are opaque bytes to the mesh collaborator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transport::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionEvent {
    Subscribe { tenant: u32, topic: String },
    Unsubscribe { tenant: u32, topic: String },
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("encode subscription event: {0}")]
    Encode(String),
    #[error("decode subscription event: {0}")]
    Decode(String),
}

impl SubscriptionEvent {
    pub fn subscribe(tenant: u32, topic: impl Into<String>) -> Self {
        Self::Subscribe {
            tenant,
            topic: topic.into(),
        }
    }

    pub fn unsubscribe(tenant: u32, topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            tenant,
            topic: topic.into(),
        }
    }

    pub fn tenant(&self) -> u32 {
        match self {
            Self::Subscribe { tenant, .. } | Self::Unsubscribe { tenant, .. } => *tenant,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Self::Subscribe { topic, .. } | Self::Unsubscribe { topic, .. } => topic,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        bincode::serialize(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        bincode::deserialize(bytes).map_err(|e| EventError::Decode(e.to_string()))
    }
}

/// Out-of-band channel for subscription events, owned by the surrounding
/// service. Delivery is best-effort.
///
/// Both calls are made under the subscription's lock so one topic's events
/// leave in order; implementations should only enqueue.
pub trait MeshEvents: Send + Sync {
    /// Send to every current peer.
    fn broadcast(&self, event: &SubscriptionEvent);

    /// Send to one peer, used to replay state to a node that just joined.
    fn send_to(&self, peer: PeerId, event: &SubscriptionEvent);
}

/// Mesh sink for single-node deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMesh;

impl MeshEvents for NoMesh {
    fn broadcast(&self, _event: &SubscriptionEvent) {}

    fn send_to(&self, _peer: PeerId, _event: &SubscriptionEvent) {}
}
