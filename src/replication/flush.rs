//! Background flush of peer queues.
//!
//! One task wakes on a fixed interval, which bounds the latency of records
//! sitting in a partially filled frame. Each peer is drained on the blocking
//! pool with at most one drain per peer in flight, so a slow peer delays only
//! its own frames and per-peer frame order is kept.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::transport::{PeerId, Transport};
use crate::messaging::queue::{FlushStats, MessageQueue, PeerQueues};
use crate::time::Clock;

/// Default pause between flush passes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(5);

type InFlight = HashMap<PeerId, JoinHandle<FlushStats>>;

pub struct FlushLoop<C: Clock> {
    queues: Arc<PeerQueues>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    clock: C,
}

impl<C: Clock> FlushLoop<C> {
    pub fn new(
        queues: Arc<PeerQueues>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        clock: C,
    ) -> Self {
        Self {
            queues,
            transport,
            interval: interval.max(Duration::from_millis(1)),
            clock,
        }
    }

    fn spawn_drain(&self, queue: Arc<MessageQueue>) -> JoinHandle<FlushStats> {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || queue.drain(transport.as_ref()))
    }

    /// Drain every ready peer concurrently and wait for all of them.
    pub async fn flush_once(&self) -> FlushStats {
        let mut drains = JoinSet::new();
        for queue in self.queues.ready(self.transport.as_ref()) {
            let transport = Arc::clone(&self.transport);
            drains.spawn_blocking(move || queue.drain(transport.as_ref()));
        }
        let mut stats = FlushStats::default();
        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok(pass) => stats.absorb(pass),
                Err(err) => tracing::error!("peer drain failed: {err}"),
            }
        }
        stats
    }

    /// Start a drain for every ready peer that has none running.
    fn start_drains(&self, in_flight: &mut InFlight) {
        for queue in self.queues.ready(self.transport.as_ref()) {
            let peer = queue.peer();
            if in_flight.contains_key(&peer) {
                tracing::trace!(%peer, "previous drain still running");
                continue;
            }
            in_flight.insert(peer, self.spawn_drain(queue));
        }
    }

    /// Run until `shutdown` turns true or its sender goes away, then make a
    /// final pass. The handle resolves to the totals of every pass.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<FlushStats> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> FlushStats {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "flush loop started");
        let mut totals = FlushStats::default();
        let mut in_flight = InFlight::new();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                () = self.clock.sleep(self.interval) => {
                    totals.absorb(reap(&mut in_flight, false).await);
                    self.start_drains(&mut in_flight);
                }
            }
        }
        totals.absorb(reap(&mut in_flight, true).await);
        totals.absorb(self.flush_once().await);
        tracing::info!(
            frames_sent = totals.frames_sent,
            frames_failed = totals.frames_failed,
            messages_sent = totals.messages_sent,
            "flush loop stopped"
        );
        totals
    }
}

/// Collect finished drains, or every drain when `wait` is set.
async fn reap(in_flight: &mut InFlight, wait: bool) -> FlushStats {
    let done: Vec<PeerId> = in_flight
        .iter()
        .filter(|(_, handle)| wait || handle.is_finished())
        .map(|(peer, _)| *peer)
        .collect();
    let mut stats = FlushStats::default();
    for peer in done {
        let Some(handle) = in_flight.remove(&peer) else {
            continue;
        };
        match handle.await {
            Ok(pass) => stats.absorb(pass),
            Err(err) => tracing::error!(%peer, "peer drain failed: {err}"),
        }
    }
    stats
}
