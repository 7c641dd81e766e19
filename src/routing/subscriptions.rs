//! Subscription records and the registry that owns them.
//!
//! One [`Subscription`] exists per (tenant, topic) with at least one member:
//! local message consumers, local presence observers, or peers that reported a
//! subscriber. Membership lists are copy-on-write so publishers iterate a
//! stable snapshot without taking the record lock.
//!
//! Mesh announcements and presence changes for a record are emitted while its
//! lock is held, so peers observe a topic's transitions in the order they
//! happened here.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::consumer::{ConsumerId, ConsumerRef, Interest};
use super::presence::{
    ClientIdentity, PresenceEntry, PresenceEvent, PresenceKey, PresenceKind, PresenceObserver, PresenceProvider,
    PresenceSet,
};
use crate::messaging::ssid::Ssid;
use crate::messaging::trie::{Matches, TopicIndex};
use crate::replication::events::{MeshEvents, SubscriptionEvent};
use crate::replication::transport::PeerId;

// ---------------------------------------------------------------------------
// Copy-on-write helpers
// ---------------------------------------------------------------------------

fn cow_insert<T: Clone>(set: &ArcSwap<Vec<T>>, item: T, same: impl Fn(&T) -> bool) -> bool {
    let current = set.load();
    if current.iter().any(same) {
        return false;
    }
    let mut next = Vec::with_capacity(current.len() + 1);
    next.extend(current.iter().cloned());
    next.push(item);
    set.store(Arc::new(next));
    true
}

fn cow_remove<T: Clone>(set: &ArcSwap<Vec<T>>, matches: impl Fn(&T) -> bool) -> bool {
    let current = set.load();
    if !current.iter().any(&matches) {
        return false;
    }
    let next: Vec<T> = current.iter().filter(|item| !matches(item)).cloned().collect();
    set.store(Arc::new(next));
    true
}

// ---------------------------------------------------------------------------
// Subscription record
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RecordState {
    /// Set once the record has been taken out of the index; a retired record
    /// never accepts members again.
    retired: bool,
    /// Local message consumers holding each client identity.
    identities: HashMap<String, usize>,
}

pub struct Subscription {
    tenant: u32,
    topic: String,
    ssid: Ssid,
    presence: Arc<dyn PresenceSet>,
    consumers: ArcSwap<Vec<ConsumerRef>>,
    observers: ArcSwap<Vec<ConsumerRef>>,
    peers: ArcSwap<Vec<PeerId>>,
    state: Mutex<RecordState>,
}

impl Subscription {
    fn new(tenant: u32, topic: &str, ssid: Ssid, presence: Arc<dyn PresenceSet>) -> Self {
        Self {
            tenant,
            topic: topic.to_string(),
            ssid,
            presence,
            consumers: ArcSwap::from_pointee(Vec::new()),
            observers: ArcSwap::from_pointee(Vec::new()),
            peers: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn tenant(&self) -> u32 {
        self.tenant
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn ssid(&self) -> &Ssid {
        &self.ssid
    }

    /// Snapshot of local message consumers.
    pub fn consumers(&self) -> Arc<Vec<ConsumerRef>> {
        self.consumers.load_full()
    }

    /// Snapshot of local presence observers.
    pub fn observers(&self) -> Arc<Vec<ConsumerRef>> {
        self.observers.load_full()
    }

    /// Snapshot of interested peers.
    pub fn peers(&self) -> Arc<Vec<PeerId>> {
        self.peers.load_full()
    }

    pub fn has_local_consumers(&self) -> bool {
        !self.consumers.load().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.load().is_empty()
            && self.observers.load().is_empty()
            && self.peers.load().is_empty()
    }

    /// Cluster-wide number of clients present on this topic.
    pub fn occupancy(&self) -> usize {
        self.presence.count(&self.ssid)
    }

    fn presence_key(&self, client: &str) -> PresenceKey {
        PresenceKey {
            ssid: self.ssid.clone(),
            client: client.to_string(),
        }
    }

    /// Count one more holder of `who`; the first one enters the presence set.
    fn hold_identity(&self, state: &mut RecordState, who: ClientIdentity) {
        let holders = state.identities.entry(who.id.clone()).or_insert(0);
        *holders += 1;
        if *holders == 1 {
            self.presence.add(PresenceEntry {
                key: self.presence_key(&who.id),
                who,
            });
        }
    }

    /// Drop one holder of `client`; the last one leaves the presence set.
    fn release_identity(&self, state: &mut RecordState, client: &str) {
        let Some(holders) = state.identities.get_mut(client) else {
            return;
        };
        *holders -= 1;
        if *holders == 0 {
            state.identities.remove(client);
            self.presence.remove(&self.presence_key(client));
        }
    }
}

fn same_consumer(id: ConsumerId) -> impl Fn(&ConsumerRef) -> bool {
    move |candidate| candidate.id() == id
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct SubscriptionRegistry {
    index: TopicIndex<Arc<Subscription>>,
    presence: Arc<dyn PresenceProvider>,
    mesh: Arc<dyn MeshEvents>,
}

impl SubscriptionRegistry {
    pub fn new(presence: Arc<dyn PresenceProvider>, mesh: Arc<dyn MeshEvents>) -> Self {
        Self {
            index: TopicIndex::new(),
            presence,
            mesh,
        }
    }

    /// Run `mutate` under the lock of the live record for `ssid`, creating the
    /// record if needed. Retries when the record found was retired between
    /// lookup and lock.
    fn with_live_record<R>(
        &self,
        tenant: u32,
        topic: &str,
        ssid: &Ssid,
        mut mutate: impl FnMut(&Subscription, &mut RecordState) -> R,
    ) -> (Arc<Subscription>, R) {
        loop {
            let record = self.index.get_or_add(ssid.as_slice(), || {
                Arc::new(Subscription::new(
                    tenant,
                    topic,
                    ssid.clone(),
                    self.presence.presence_set(tenant),
                ))
            });
            let mut state = record.state.lock();
            if state.retired {
                continue;
            }
            let result = mutate(&record, &mut state);
            drop(state);
            return (record, result);
        }
    }

    /// Take `record` out of the index when it has no members left. Must be
    /// called with the record's lock held.
    fn retire_if_empty(&self, record: &Arc<Subscription>, state: &mut RecordState) -> bool {
        if !record.is_empty() {
            return false;
        }
        state.retired = true;
        self.index
            .remove_if(record.ssid.as_slice(), |current| Arc::ptr_eq(current, record));
        tracing::debug!(tenant = record.tenant, topic = %record.topic, "subscription retired");
        true
    }

    /// Register a local consumer. The first local message consumer on a topic
    /// is announced to the cluster.
    pub fn subscribe(
        &self,
        consumer: &ConsumerRef,
        tenant: u32,
        topic: &str,
        interest: Interest,
    ) -> Arc<Subscription> {
        let ssid = Ssid::new(tenant, topic);
        let (record, ()) = self.with_live_record(tenant, topic, &ssid, |record, state| {
            let had_local = record.has_local_consumers();
            let mut added_message = false;
            if interest.messages() {
                added_message = cow_insert(
                    &record.consumers,
                    Arc::clone(consumer),
                    same_consumer(consumer.id()),
                );
            }
            if interest.presence() {
                cow_insert(
                    &record.observers,
                    Arc::clone(consumer),
                    same_consumer(consumer.id()),
                );
            }
            if !had_local && record.has_local_consumers() {
                self.mesh
                    .broadcast(&SubscriptionEvent::subscribe(tenant, record.topic()));
            }
            if added_message {
                if let Some(who) = consumer.identity() {
                    record.hold_identity(state, who);
                }
            }
        });
        tracing::debug!(
            consumer = consumer.id(),
            tenant,
            topic,
            ?interest,
            "subscribed"
        );
        record
    }

    /// Remove a local consumer. Returns false when it was not subscribed.
    pub fn unsubscribe(
        &self,
        consumer: &ConsumerRef,
        tenant: u32,
        topic: &str,
        interest: Interest,
    ) -> bool {
        let ssid = Ssid::new(tenant, topic);
        let Some(record) = self.index.get(ssid.as_slice()) else {
            return false;
        };
        let mut state = record.state.lock();
        if state.retired {
            return false;
        }
        let id = consumer.id();
        let removed_message =
            interest.messages() && cow_remove(&record.consumers, same_consumer(id));
        let removed_observer =
            interest.presence() && cow_remove(&record.observers, same_consumer(id));
        if removed_message && !record.has_local_consumers() {
            self.mesh
                .broadcast(&SubscriptionEvent::unsubscribe(tenant, record.topic()));
        }
        if removed_message {
            if let Some(who) = consumer.identity() {
                record.release_identity(&mut state, &who.id);
            }
        }
        // Retire last: a replacement record may announce itself as soon as
        // this one leaves the index.
        self.retire_if_empty(&record, &mut state);
        removed_message || removed_observer
    }

    /// A peer reported its first subscriber on a topic.
    pub fn on_peer_subscribe_event(
        &self,
        peer: PeerId,
        tenant: u32,
        topic: &str,
    ) -> Arc<Subscription> {
        let ssid = Ssid::new(tenant, topic);
        let (record, added) = self.with_live_record(tenant, topic, &ssid, |record, _| {
            cow_insert(&record.peers, peer, |candidate| *candidate == peer)
        });
        if added {
            tracing::debug!(%peer, tenant, topic, "peer subscribed");
        }
        record
    }

    /// A peer reported that it lost its last subscriber on a topic.
    pub fn on_peer_unsubscribe_event(&self, peer: PeerId, tenant: u32, topic: &str) -> bool {
        let ssid = Ssid::new(tenant, topic);
        let Some(record) = self.index.get(ssid.as_slice()) else {
            return false;
        };
        let mut state = record.state.lock();
        if state.retired {
            return false;
        }
        let removed = cow_remove(&record.peers, |candidate| *candidate == peer);
        if removed {
            self.retire_if_empty(&record, &mut state);
            tracing::debug!(%peer, tenant, topic, "peer unsubscribed");
        }
        removed
    }

    /// Apply a subscription event received from `peer`.
    pub fn on_mesh_event(&self, peer: PeerId, event: &SubscriptionEvent) {
        match event {
            SubscriptionEvent::Subscribe { tenant, topic } => {
                self.on_peer_subscribe_event(peer, *tenant, topic);
            }
            SubscriptionEvent::Unsubscribe { tenant, topic } => {
                self.on_peer_unsubscribe_event(peer, *tenant, topic);
            }
        }
    }

    /// Replay every topic with local message consumers to a newly joined peer.
    pub fn on_node_join(&self, peer: PeerId) -> usize {
        let mut replayed = 0;
        for record in self.index.values() {
            let state = record.state.lock();
            if !state.retired && record.has_local_consumers() {
                self.mesh
                    .send_to(peer, &SubscriptionEvent::subscribe(record.tenant, record.topic()));
                replayed += 1;
            }
        }
        tracing::info!(%peer, replayed, "replayed subscriptions to joined peer");
        replayed
    }

    /// Forget every interest registered by a departed peer.
    pub fn on_node_leave(&self, peer: PeerId) -> usize {
        let mut dropped = 0;
        for record in self.index.values() {
            let mut state = record.state.lock();
            if state.retired {
                continue;
            }
            if cow_remove(&record.peers, |candidate| *candidate == peer) {
                dropped += 1;
                self.retire_if_empty(&record, &mut state);
            }
        }
        tracing::info!(%peer, dropped, "dropped interests of departed peer");
        dropped
    }

    pub fn lookup(&self, tenant: u32, topic: &str) -> Option<Arc<Subscription>> {
        self.index.get(Ssid::new(tenant, topic).as_slice())
    }

    /// Records whose patterns match the concrete key `ssid`.
    pub fn matches<'a>(&'a self, ssid: &'a Ssid) -> Matches<'a, Arc<Subscription>> {
        self.index.matches(ssid.as_slice())
    }

    /// Cluster-wide presence count for a topic.
    pub fn occupancy(&self, tenant: u32, topic: &str) -> usize {
        self.presence
            .presence_set(tenant)
            .count(&Ssid::new(tenant, topic))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl PresenceObserver for SubscriptionRegistry {
    fn on_presence_change(&self, entry: &PresenceEntry, source: PeerId, is_merge: bool) {
        let Some(record) = self.index.get(entry.key.ssid.as_slice()) else {
            return;
        };
        let observers = record.observers();
        if observers.is_empty() {
            return;
        }
        let kind = if is_merge {
            PresenceKind::Subscribe
        } else {
            PresenceKind::Unsubscribe
        };
        let event = PresenceEvent::new(
            kind,
            record.tenant,
            record.topic(),
            entry.who.clone(),
            record.occupancy(),
        );
        for observer in observers.iter() {
            observer.notify_presence(&event);
        }
        tracing::trace!(%source, topic = %record.topic, ?kind, "presence change delivered");
    }
}
