//! Per-peer outbound batching.
//!
//! Each peer owns one [`MessageQueue`]: a current frame that records are
//! appended to under the queue lock, and a lock-free queue of completed frames
//! waiting for the flush loop.

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::frame::{encoded_len, Frame, FrameError};
use super::pool::Pool;
use crate::replication::transport::{PeerId, Transport};

/// Outcome of flushing one or more peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub peers: usize,
    pub frames_sent: usize,
    pub frames_failed: usize,
    pub messages_sent: usize,
}

impl FlushStats {
    pub fn absorb(&mut self, other: FlushStats) {
        self.peers += other.peers;
        self.frames_sent += other.frames_sent;
        self.frames_failed += other.frames_failed;
        self.messages_sent += other.messages_sent;
    }
}

// ---------------------------------------------------------------------------
// Message Queue
// ---------------------------------------------------------------------------

pub struct MessageQueue {
    peer: PeerId,
    current: Mutex<Frame>,
    pending: SegQueue<Frame>,
    frames: Arc<Pool<Frame>>,
    buffered: AtomicUsize,
}

impl MessageQueue {
    pub fn new(peer: PeerId, frames: Arc<Pool<Frame>>) -> Self {
        let current = frames.take();
        Self {
            peer,
            current: Mutex::new(current),
            pending: SegQueue::new(),
            frames,
            buffered: AtomicUsize::new(0),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Append a record, rotating full frames into the pending queue.
    ///
    /// Fails only when the record is larger than an empty frame.
    pub fn enqueue(&self, tenant: u32, topic: &str, payload: &[u8]) -> Result<(), FrameError> {
        let mut current = self.current.lock();
        loop {
            if current.try_append(tenant, topic, payload) {
                self.buffered.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
            if current.is_empty() {
                return Err(FrameError::Oversized {
                    len: encoded_len(topic, payload),
                    capacity: current.capacity(),
                });
            }
            let full = std::mem::replace(&mut *current, self.frames.take());
            self.pending.push(full);
        }
    }

    /// Move the current frame to the pending queue if it holds anything.
    pub fn seal(&self) {
        let mut current = self.current.lock();
        if !current.is_empty() {
            let partial = std::mem::replace(&mut *current, self.frames.take());
            self.pending.push(partial);
        }
    }

    /// Seal the current frame and send every pending frame to the peer.
    ///
    /// Frames go back to the pool whether or not the send succeeded. Runs
    /// `Transport::send` on the calling thread, so callers that must not
    /// block drain from the blocking pool.
    pub fn drain(&self, transport: &dyn Transport) -> FlushStats {
        self.seal();
        let mut stats = FlushStats {
            peers: 1,
            ..FlushStats::default()
        };
        while let Some(frame) = self.pending.pop() {
            self.buffered
                .fetch_sub(frame.message_count(), Ordering::AcqRel);
            match transport.send(self.peer, frame.as_bytes()) {
                Ok(()) => {
                    stats.frames_sent += 1;
                    stats.messages_sent += frame.message_count();
                }
                Err(err) => {
                    stats.frames_failed += 1;
                    tracing::warn!(
                        peer = %self.peer,
                        messages = frame.message_count(),
                        "dropping frame after send failure: {err}"
                    );
                }
            }
            self.frames.release(frame);
        }
        stats
    }

    /// Frames waiting for transmission, excluding the current one.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Records accepted and not yet handed to the transport.
    pub fn buffered_messages(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Drop everything buffered for this peer.
    pub fn discard(&self) -> usize {
        let mut dropped = 0;
        {
            let mut current = self.current.lock();
            dropped += current.message_count();
            current.reset();
        }
        while let Some(frame) = self.pending.pop() {
            dropped += frame.message_count();
            self.frames.release(frame);
        }
        self.buffered.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }
}

// ---------------------------------------------------------------------------
// Peer Queues
// ---------------------------------------------------------------------------

/// Outbound queues for every peer that has been sent anything.
pub struct PeerQueues {
    queues: DashMap<PeerId, Arc<MessageQueue>>,
    frames: Arc<Pool<Frame>>,
}

impl PeerQueues {
    pub fn new(frame_capacity: usize, pool_size: usize) -> Self {
        Self {
            queues: DashMap::new(),
            frames: Arc::new(Pool::new(pool_size, move || {
                Frame::with_capacity(frame_capacity)
            })),
        }
    }

    pub fn queue(&self, peer: PeerId) -> Arc<MessageQueue> {
        if let Some(queue) = self.queues.get(&peer) {
            return Arc::clone(queue.value());
        }
        let queue = self
            .queues
            .entry(peer)
            .or_insert_with(|| Arc::new(MessageQueue::new(peer, Arc::clone(&self.frames))));
        Arc::clone(queue.value())
    }

    pub fn get(&self, peer: PeerId) -> Option<Arc<MessageQueue>> {
        self.queues.get(&peer).map(|queue| Arc::clone(queue.value()))
    }

    pub fn enqueue(
        &self,
        peer: PeerId,
        tenant: u32,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        self.queue(peer).enqueue(tenant, topic, payload)
    }

    /// Queues with buffered records whose peer the transport reports online.
    /// Offline peers keep their frames until they reconnect or are removed.
    pub fn ready(&self, transport: &dyn Transport) -> Vec<Arc<MessageQueue>> {
        self.queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|queue| queue.buffered_messages() > 0 && transport.is_online(queue.peer()))
            .collect()
    }

    /// Drain every ready peer one after another on the calling thread. The
    /// flush loop drains peers concurrently instead; see
    /// [`FlushLoop`](crate::replication::flush::FlushLoop).
    pub fn flush(&self, transport: &dyn Transport) -> FlushStats {
        let mut stats = FlushStats::default();
        for queue in self.ready(transport) {
            stats.absorb(queue.drain(transport));
        }
        stats
    }

    /// Forget a peer, dropping whatever was buffered for it.
    pub fn remove(&self, peer: PeerId) -> usize {
        self.queues
            .remove(&peer)
            .map(|(_, queue)| queue.discard())
            .unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.queues.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn frame_pool(&self) -> &Arc<Pool<Frame>> {
        &self.frames
    }
}
