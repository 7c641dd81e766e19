//! Presence: who is subscribed where, cluster-wide.
//!
//! The replicated set itself belongs to the surrounding service; this module
//! defines what the routing core needs from it and the notifications it emits.
//! [`MemoryPresence`] is an in-process set for single-node use.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::messaging::ssid::Ssid;
use crate::replication::transport::PeerId;

/// Identity a consumer presents for presence tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Presence entries are unique per (topic key, client).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceKey {
    pub ssid: Ssid,
    pub client: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub key: PresenceKey,
    pub who: ClientIdentity,
}

/// Tenant-scoped presence set.
pub trait PresenceSet: Send + Sync {
    fn add(&self, entry: PresenceEntry);

    fn remove(&self, key: &PresenceKey);

    /// Clients currently present on exactly `ssid`.
    fn members(&self, ssid: &Ssid) -> Vec<ClientIdentity>;

    fn count(&self, ssid: &Ssid) -> usize {
        self.members(ssid).len()
    }
}

/// Receives merge/delete notifications from presence sets.
pub trait PresenceObserver: Send + Sync {
    fn on_presence_change(&self, entry: &PresenceEntry, source: PeerId, is_merge: bool);
}

/// Hands out the presence set for a tenant.
pub trait PresenceProvider: Send + Sync {
    fn presence_set(&self, tenant: u32) -> Arc<dyn PresenceSet>;

    /// Register the observer for change notifications. Providers whose
    /// notifications are wired elsewhere may ignore this.
    fn attach(&self, _observer: Weak<dyn PresenceObserver>) {}
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Subscribe,
    Unsubscribe,
}

/// Join/leave notification sent to presence observers of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub event: PresenceKind,
    #[serde(skip)]
    pub tenant: u32,
    pub channel: String,
    pub time: u64,
    pub who: ClientIdentity,
    pub occupancy: usize,
}

impl PresenceEvent {
    pub fn new(
        event: PresenceKind,
        tenant: u32,
        channel: impl Into<String>,
        who: ClientIdentity,
        occupancy: usize,
    ) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            event,
            tenant,
            channel: channel.into(),
            time,
            who,
            occupancy,
        }
    }

    /// JSON body for front ends that deliver presence as ordinary messages.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// In-memory presence
// ---------------------------------------------------------------------------

type ObserverSlot = Arc<OnceLock<Weak<dyn PresenceObserver>>>;

/// Presence provider that keeps everything in this process.
///
/// Changes are reported to the attached observer as merges/deletes from
/// `local`, after the set's own lock is released.
pub struct MemoryPresence {
    local: PeerId,
    tenants: DashMap<u32, Arc<TenantPresence>>,
    observer: ObserverSlot,
}

impl MemoryPresence {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            tenants: DashMap::new(),
            observer: Arc::new(OnceLock::new()),
        }
    }

    fn tenant(&self, tenant: u32) -> Arc<TenantPresence> {
        let entry = self.tenants.entry(tenant).or_insert_with(|| {
            Arc::new(TenantPresence {
                local: self.local,
                entries: Mutex::new(HashMap::new()),
                observer: Arc::clone(&self.observer),
            })
        });
        Arc::clone(entry.value())
    }
}

impl PresenceProvider for MemoryPresence {
    fn presence_set(&self, tenant: u32) -> Arc<dyn PresenceSet> {
        self.tenant(tenant)
    }

    fn attach(&self, observer: Weak<dyn PresenceObserver>) {
        if self.observer.set(observer).is_err() {
            tracing::warn!("presence observer already attached; ignoring");
        }
    }
}

pub struct TenantPresence {
    local: PeerId,
    entries: Mutex<HashMap<PresenceKey, ClientIdentity>>,
    observer: ObserverSlot,
}

impl TenantPresence {
    fn notify(&self, entry: &PresenceEntry, is_merge: bool) {
        if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
            observer.on_presence_change(entry, self.local, is_merge);
        }
    }
}

impl PresenceSet for TenantPresence {
    fn add(&self, entry: PresenceEntry) {
        let previous = self
            .entries
            .lock()
            .insert(entry.key.clone(), entry.who.clone());
        if previous.as_ref() != Some(&entry.who) {
            self.notify(&entry, true);
        }
    }

    fn remove(&self, key: &PresenceKey) {
        let removed = self.entries.lock().remove(key);
        if let Some(who) = removed {
            let entry = PresenceEntry {
                key: key.clone(),
                who,
            };
            self.notify(&entry, false);
        }
    }

    fn members(&self, ssid: &Ssid) -> Vec<ClientIdentity> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, _)| &key.ssid == ssid)
            .map(|(_, who)| who.clone())
            .collect()
    }
}
