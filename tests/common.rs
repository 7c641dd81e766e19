//! Common in-memory collaborators for integration tests.
//!
//! - Recording consumers that capture deliveries and presence events
//! - A transport that records sent frames and reports a fixed membership
//! - A mesh sink that records subscription events
//! - A message store backed by a vector

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use meshcast::presence::{ClientIdentity, PresenceEvent};
use meshcast::replication::TransportError;
use meshcast::routing::{ConsumerId, DeliveryError};
use meshcast::storage::{MessageStore, StoreError, StoredMessage};
use meshcast::{Consumer, ConsumerRef, MeshEvents, Message, PeerId, SubscriptionEvent, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// -----------------------------------------------------------------------------
// Consumers
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub tenant: u32,
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct RecordingConsumer {
    id: ConsumerId,
    identity: Option<ClientIdentity>,
    pub messages: Mutex<Vec<Received>>,
    pub presence: Mutex<Vec<PresenceEvent>>,
}

impl RecordingConsumer {
    pub fn new(id: ConsumerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            identity: None,
            messages: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
        })
    }

    pub fn with_identity(id: ConsumerId, client: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            identity: Some(ClientIdentity::new(client)),
            messages: Mutex::new(Vec::new()),
            presence: Mutex::new(Vec::new()),
        })
    }

    pub fn payloads(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect()
    }

    pub fn presence_events(&self) -> Vec<PresenceEvent> {
        self.presence.lock().clone()
    }
}

impl Consumer for RecordingConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn identity(&self) -> Option<ClientIdentity> {
        self.identity.clone()
    }

    fn deliver(&self, message: &Message<'_>) -> Result<(), DeliveryError> {
        self.messages.lock().push(Received {
            tenant: message.tenant,
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
        });
        Ok(())
    }

    fn notify_presence(&self, event: &PresenceEvent) {
        self.presence.lock().push(event.clone());
    }
}

pub fn as_ref(consumer: &Arc<RecordingConsumer>) -> ConsumerRef {
    consumer.clone()
}

// -----------------------------------------------------------------------------
// Transport
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct LoopbackTransport {
    members: Mutex<Vec<PeerId>>,
    offline: Mutex<HashSet<PeerId>>,
    failing: Mutex<HashSet<PeerId>>,
    pub sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
}

impl LoopbackTransport {
    pub fn with_members(members: &[PeerId]) -> Arc<Self> {
        let transport = Self::default();
        *transport.members.lock() = members.to_vec();
        Arc::new(transport)
    }

    pub fn set_offline(&self, peer: PeerId, offline: bool) {
        let mut set = self.offline.lock();
        if offline {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    pub fn fail_sends_to(&self, peer: PeerId) {
        self.failing.lock().insert(peer);
    }

    /// Frames sent so far, removed from the log.
    pub fn take_sent(&self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn frames_to(&self, peer: PeerId) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == peer)
            .count()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, peer: PeerId, frame: &[u8]) -> Result<(), TransportError> {
        if self.failing.lock().contains(&peer) {
            return Err(TransportError::Send {
                peer,
                reason: "connection reset".into(),
            });
        }
        self.sent.lock().push((peer, frame.to_vec()));
        Ok(())
    }

    fn members(&self) -> Vec<PeerId> {
        self.members.lock().clone()
    }

    fn is_online(&self, peer: PeerId) -> bool {
        !self.offline.lock().contains(&peer)
    }
}

// -----------------------------------------------------------------------------
// Mesh events
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingMesh {
    pub broadcasts: Mutex<Vec<SubscriptionEvent>>,
    pub direct: Mutex<Vec<(PeerId, SubscriptionEvent)>>,
}

impl RecordingMesh {
    pub fn take_broadcasts(&self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut *self.broadcasts.lock())
    }
}

impl MeshEvents for RecordingMesh {
    fn broadcast(&self, event: &SubscriptionEvent) {
        self.broadcasts.lock().push(event.clone());
    }

    fn send_to(&self, peer: PeerId, event: &SubscriptionEvent) {
        self.direct.lock().push((peer, event.clone()));
    }
}

// -----------------------------------------------------------------------------
// Store
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct VecStore {
    pub stored: Mutex<Vec<StoredMessage>>,
}

impl MessageStore for VecStore {
    fn store(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.stored.lock().push(message);
        Ok(())
    }
}

/// Wait for a condition with bounded timeout, polling at intervals.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
