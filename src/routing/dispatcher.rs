//! Publish path: local delivery plus bloom-filtered cluster fan-out.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

use super::consumer::Message;
use super::subscriptions::{Subscription, SubscriptionRegistry};
use crate::messaging::fanout::{FanoutFilter, DEFAULT_CAPACITY, DEFAULT_FP_RATE};
use crate::messaging::frame::{
    FrameDecoder, FrameError, DEFAULT_FRAME_CAPACITY, DEFAULT_MAX_TOPIC_LEN, RECORD_OVERHEAD,
};
use crate::messaging::pool::Pool;
use crate::messaging::queue::PeerQueues;
use crate::messaging::ssid::Ssid;
use crate::replication::transport::Transport;
use crate::storage::{StoreError, StoreHandle, StoredMessage};

/// Longest retention a publish may ask for, in seconds.
pub const MAX_TTL_SECONDS: u32 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("topic of {len} bytes exceeds the {max} byte limit")]
    TopicTooLong { len: usize, max: usize },
    #[error("{failed} peer copies dropped: {source}")]
    Fanout { failed: usize, source: FrameError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchOptions {
    pub max_ttl: u32,
    pub bloom_capacity: usize,
    pub bloom_fp_rate: f64,
    pub filter_pool_size: usize,
    pub max_message_size: usize,
    pub max_topic_len: usize,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_ttl: MAX_TTL_SECONDS,
            bloom_capacity: DEFAULT_CAPACITY,
            bloom_fp_rate: DEFAULT_FP_RATE,
            filter_pool_size: 32,
            max_message_size: DEFAULT_FRAME_CAPACITY - RECORD_OVERHEAD - DEFAULT_MAX_TOPIC_LEN,
            max_topic_len: DEFAULT_MAX_TOPIC_LEN,
        }
    }
}

/// Clamp a requested ttl into `[0, max]`; zero and negative mean transient.
pub fn clamp_ttl(ttl: i64, max: u32) -> u32 {
    if ttl <= 0 {
        0
    } else {
        ttl.min(i64::from(max)) as u32
    }
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    queues: Arc<PeerQueues>,
    transport: Arc<dyn Transport>,
    filters: Pool<FanoutFilter>,
    store: Option<StoreHandle>,
    max_ttl: u32,
    max_message_size: usize,
    max_topic_len: usize,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        queues: Arc<PeerQueues>,
        transport: Arc<dyn Transport>,
        options: DispatchOptions,
    ) -> Self {
        let DispatchOptions {
            bloom_capacity,
            bloom_fp_rate,
            ..
        } = options;
        Self {
            registry,
            queues,
            transport,
            filters: Pool::new(options.filter_pool_size, move || {
                FanoutFilter::new(bloom_capacity, bloom_fp_rate)
            }),
            store: None,
            max_ttl: options.max_ttl.min(MAX_TTL_SECONDS),
            max_message_size: options.max_message_size,
            max_topic_len: options.max_topic_len,
        }
    }

    /// Hand messages with a positive ttl to `store`.
    pub fn with_store(mut self, store: StoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn queues(&self) -> &Arc<PeerQueues> {
        &self.queues
    }

    /// Deliver a message to every matching local consumer and interested peer.
    ///
    /// Best-effort: failures are logged and never reach the caller. Messages
    /// over the size or topic limits are dropped whole, before any delivery,
    /// since no peer could decode them.
    pub fn publish(&self, tenant: u32, topic: &str, payload: &[u8], ttl: i64) {
        if let Err(err) = self.try_publish(tenant, topic, payload, ttl) {
            tracing::warn!(tenant, topic, "publish incomplete: {err}");
        }
    }

    fn try_publish(
        &self,
        tenant: u32,
        topic: &str,
        payload: &[u8],
        ttl: i64,
    ) -> Result<(), DispatchError> {
        if payload.len() > self.max_message_size {
            return Err(DispatchError::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size,
            });
        }
        if topic.len() > self.max_topic_len {
            return Err(DispatchError::TopicTooLong {
                len: topic.len(),
                max: self.max_topic_len,
            });
        }
        let ttl = clamp_ttl(ttl, self.max_ttl);
        let ssid = Ssid::new(tenant, topic);
        let message = Message {
            tenant,
            topic,
            payload,
        };

        let mut filter = self.filters.acquire();
        for record in self.registry.matches(&ssid) {
            deliver_local(&record, &message);
            for peer in record.peers().iter() {
                filter.insert(peer);
            }
        }

        let mut failed = 0;
        let mut last_error = None;
        if !filter.is_empty() {
            for peer in self.transport.members() {
                if !filter.contains(&peer) {
                    continue;
                }
                if let Err(err) = self.queues.enqueue(peer, tenant, topic, payload) {
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }
        drop(filter);

        if ttl > 0 {
            if let Some(store) = &self.store {
                store.submit(StoredMessage {
                    tenant,
                    ssid,
                    ttl,
                    payload: Bytes::copy_from_slice(payload),
                })?;
            }
        }

        match last_error {
            Some(source) => Err(DispatchError::Fanout { failed, source }),
            None => Ok(()),
        }
    }

    /// Local delivery only; the entry point for messages that arrived from a
    /// peer, so they are neither stored nor forwarded again.
    pub fn forward_to_local_consumers(&self, tenant: u32, topic: &str, payload: &[u8]) -> usize {
        let ssid = Ssid::new(tenant, topic);
        let message = Message {
            tenant,
            topic,
            payload,
        };
        self.registry
            .matches(&ssid)
            .map(|record| deliver_local(&record, &message))
            .sum()
    }

    /// Decode an inbound frame with the caller's decoder and deliver each
    /// record locally as it is decoded. Returns the number of records.
    pub fn deliver_frame(
        &self,
        decoder: &mut FrameDecoder,
        frame: &[u8],
    ) -> Result<usize, FrameError> {
        decoder.decode(frame, |tenant, topic, payload| {
            self.forward_to_local_consumers(tenant, topic, payload);
        })
    }
}

fn deliver_local(record: &Subscription, message: &Message<'_>) -> usize {
    let consumers = record.consumers();
    let mut delivered = 0;
    for consumer in consumers.iter() {
        match consumer.deliver(message) {
            Ok(()) => delivered += 1,
            Err(err) => {
                tracing::debug!(consumer = consumer.id(), topic = message.topic, "{err}");
            }
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::frame::Frame;
    use crate::replication::events::NoMesh;
    use crate::replication::transport::{PeerId, TransportError};
    use crate::routing::consumer::{Consumer, ConsumerId, ConsumerRef, DeliveryError, Interest};
    use crate::routing::presence::{MemoryPresence, PresenceEvent};
    use parking_lot::Mutex;

    struct Inbox {
        id: ConsumerId,
        received: Mutex<Vec<(String, Vec<u8>)>>,
        closed: bool,
    }

    impl Inbox {
        fn new(id: ConsumerId) -> Arc<Self> {
            Arc::new(Self {
                id,
                received: Mutex::new(Vec::new()),
                closed: false,
            })
        }

        fn payloads(&self) -> Vec<Vec<u8>> {
            self.received.lock().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    impl Consumer for Inbox {
        fn id(&self) -> ConsumerId {
            self.id
        }

        fn deliver(&self, message: &Message<'_>) -> Result<(), DeliveryError> {
            if self.closed {
                return Err(DeliveryError::Closed(self.id));
            }
            self.received
                .lock()
                .push((message.topic.to_string(), message.payload.to_vec()));
            Ok(())
        }

        fn notify_presence(&self, _event: &PresenceEvent) {}
    }

    struct Members(Vec<PeerId>);

    impl Transport for Members {
        fn send(&self, _peer: PeerId, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn members(&self) -> Vec<PeerId> {
            self.0.clone()
        }

        fn is_online(&self, _peer: PeerId) -> bool {
            true
        }
    }

    fn dispatcher(members: Vec<PeerId>) -> Dispatcher {
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(MemoryPresence::new(PeerId(0))),
            Arc::new(NoMesh),
        ));
        Dispatcher::new(
            registry,
            Arc::new(PeerQueues::new(4096, 4)),
            Arc::new(Members(members)),
            DispatchOptions::default(),
        )
    }

    #[test]
    fn test_clamp_ttl() {
        assert_eq!(clamp_ttl(-5, MAX_TTL_SECONDS), 0);
        assert_eq!(clamp_ttl(0, MAX_TTL_SECONDS), 0);
        assert_eq!(clamp_ttl(60, MAX_TTL_SECONDS), 60);
        assert_eq!(clamp_ttl(i64::MAX, MAX_TTL_SECONDS), MAX_TTL_SECONDS);
    }

    #[test]
    fn test_wildcard_and_exact_subscribers_receive_publish() {
        let dispatcher = dispatcher(Vec::new());
        let exact = Inbox::new(1);
        let wild = Inbox::new(2);
        let exact_ref: ConsumerRef = exact.clone();
        let wild_ref: ConsumerRef = wild.clone();
        dispatcher
            .registry()
            .subscribe(&exact_ref, 7, "news/sports/", Interest::Messages);
        dispatcher
            .registry()
            .subscribe(&wild_ref, 7, "news/+/", Interest::Messages);

        dispatcher.publish(7, "news/sports/", b"GOAL", 0);
        dispatcher.publish(7, "news/weather/", b"RAIN", 0);

        assert_eq!(exact.payloads(), vec![b"GOAL".to_vec()]);
        assert_eq!(wild.payloads(), vec![b"GOAL".to_vec(), b"RAIN".to_vec()]);
    }

    #[test]
    fn test_other_tenants_are_never_reached() {
        let dispatcher = dispatcher(Vec::new());
        let inbox = Inbox::new(1);
        let consumer: ConsumerRef = inbox.clone();
        dispatcher
            .registry()
            .subscribe(&consumer, 1, "a/", Interest::Messages);
        dispatcher.publish(2, "a/", b"x", 0);
        assert!(inbox.payloads().is_empty());
    }

    #[test]
    fn test_presence_only_consumers_get_no_messages() {
        let dispatcher = dispatcher(Vec::new());
        let inbox = Inbox::new(1);
        let consumer: ConsumerRef = inbox.clone();
        dispatcher
            .registry()
            .subscribe(&consumer, 1, "a/", Interest::Presence);
        dispatcher.publish(1, "a/", b"x", 0);
        assert!(inbox.payloads().is_empty());
    }

    #[test]
    fn test_failing_consumer_does_not_block_others() {
        let dispatcher = dispatcher(Vec::new());
        let closed: ConsumerRef = Arc::new(Inbox {
            id: 1,
            received: Mutex::new(Vec::new()),
            closed: true,
        });
        let open = Inbox::new(2);
        let open_ref: ConsumerRef = open.clone();
        dispatcher
            .registry()
            .subscribe(&closed, 1, "a/", Interest::Messages);
        dispatcher
            .registry()
            .subscribe(&open_ref, 1, "a/", Interest::Messages);
        assert_eq!(dispatcher.forward_to_local_consumers(1, "a/", b"x"), 1);
        assert_eq!(open.payloads(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_interested_peer_gets_exactly_one_record() {
        let peers = vec![PeerId(1), PeerId(2), PeerId(3)];
        let dispatcher = dispatcher(peers);
        dispatcher
            .registry()
            .on_peer_subscribe_event(PeerId(2), 9, "x/");
        dispatcher.publish(9, "x/", b"hello", 0);

        let p2 = dispatcher.queues().get(PeerId(2)).unwrap();
        assert_eq!(p2.buffered_messages(), 1);
        // Filter fills back up from the pool with no leftovers.
        assert_eq!(dispatcher.filters.idle(), 1);
    }

    #[test]
    fn test_peers_outside_membership_are_skipped() {
        let dispatcher = dispatcher(vec![PeerId(1)]);
        dispatcher
            .registry()
            .on_peer_subscribe_event(PeerId(5), 9, "x/");
        dispatcher.publish(9, "x/", b"hello", 0);
        assert!(dispatcher.queues().get(PeerId(5)).is_none());
    }

    #[test]
    fn test_inbound_frame_reaches_local_consumers_only() {
        let dispatcher = dispatcher(vec![PeerId(1)]);
        let inbox = Inbox::new(1);
        let consumer: ConsumerRef = inbox.clone();
        dispatcher
            .registry()
            .subscribe(&consumer, 4, "chat/", Interest::Messages);
        dispatcher
            .registry()
            .on_peer_subscribe_event(PeerId(1), 4, "chat/");

        let mut frame = Frame::with_capacity(1024);
        assert!(frame.try_append(4, "chat/", b"one"));
        assert!(frame.try_append(4, "chat/room/", b"two"));
        assert!(frame.try_append(5, "chat/", b"other tenant"));
        let mut decoder = FrameDecoder::default();
        assert_eq!(dispatcher.deliver_frame(&mut decoder, frame.as_bytes()), Ok(3));

        assert_eq!(inbox.payloads(), vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(dispatcher.queues().get(PeerId(1)).is_none());
    }

    #[test]
    fn test_publish_over_limits_is_dropped_before_delivery() {
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(MemoryPresence::new(PeerId(0))),
            Arc::new(NoMesh),
        ));
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(PeerQueues::new(4096, 4)),
            Arc::new(Members(vec![PeerId(1)])),
            DispatchOptions {
                max_message_size: 8,
                max_topic_len: 4,
                ..DispatchOptions::default()
            },
        );
        let inbox = Inbox::new(1);
        let consumer: ConsumerRef = inbox.clone();
        dispatcher
            .registry()
            .subscribe(&consumer, 1, "a/", Interest::Messages);
        dispatcher.registry().on_peer_subscribe_event(PeerId(1), 1, "a/");

        let err = dispatcher.try_publish(1, "a/", b"123456789", 0).unwrap_err();
        assert!(matches!(err, DispatchError::MessageTooLarge { len: 9, max: 8 }));
        let err = dispatcher.try_publish(1, "a/b/c/", b"x", 0).unwrap_err();
        assert!(matches!(err, DispatchError::TopicTooLong { len: 6, max: 4 }));
        assert!(inbox.payloads().is_empty());
        assert!(dispatcher.queues().get(PeerId(1)).is_none());

        dispatcher.publish(1, "a/", b"12345678", 0);
        assert_eq!(inbox.payloads(), vec![b"12345678".to_vec()]);
        assert_eq!(dispatcher.queues().get(PeerId(1)).unwrap().buffered_messages(), 1);
    }
}
