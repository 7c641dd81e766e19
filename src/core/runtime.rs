use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::messaging::frame::{FrameDecoder, FrameError};
use crate::messaging::queue::{FlushStats, PeerQueues};
use crate::replication::events::{MeshEvents, SubscriptionEvent};
use crate::replication::flush::FlushLoop;
use crate::replication::transport::{PeerId, Transport};
use crate::routing::dispatcher::Dispatcher;
use crate::routing::presence::{PresenceObserver, PresenceProvider};
use crate::routing::subscriptions::SubscriptionRegistry;
use crate::storage::{MessageStore, StoreWorker};
use crate::telemetry::{self, LogHandle};
use crate::time::Clock;

/// Services the routing core consumes from the surrounding broker.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub mesh: Arc<dyn MeshEvents>,
    pub presence: Arc<dyn PresenceProvider>,
    pub store: Option<Arc<dyn MessageStore>>,
}

/// Wires configuration and collaborators into the registry, dispatcher and
/// peer queues, and owns the background flush and store tasks.
pub struct Router<C: Clock> {
    config: Config,
    clock: C,
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    queues: Arc<PeerQueues>,
    dispatcher: Arc<Dispatcher>,
    store_worker: Option<StoreWorker>,
    flush_task: Option<JoinHandle<FlushStats>>,
    store_task: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    log_handle: Option<LogHandle>,
}

impl<C: Clock> Router<C> {
    pub fn new(
        config: Config,
        clock: C,
        collaborators: Collaborators,
        log_handle: Option<LogHandle>,
    ) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            transport,
            mesh,
            presence,
            store,
        } = collaborators;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&presence), mesh));
        let observer: Arc<dyn PresenceObserver> = registry.clone();
        presence.attach(Arc::downgrade(&observer));

        let queues = Arc::new(PeerQueues::new(
            config.cluster.frame_capacity,
            config.cluster.frame_pool_size,
        ));
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&queues),
            Arc::clone(&transport),
            config.dispatch_options(),
        );
        let store_worker = match store {
            Some(store) => {
                let (worker, handle) = StoreWorker::new(store, config.dispatch.store_queue_depth);
                dispatcher = dispatcher.with_store(handle);
                Some(worker)
            }
            None => None,
        };

        Ok(Self {
            config,
            clock,
            transport,
            registry,
            queues,
            dispatcher: Arc::new(dispatcher),
            store_worker,
            flush_task: None,
            store_task: None,
            shutdown_tx,
            shutdown_rx,
            log_handle,
        })
    }

    /// Start the flush loop and store worker on the current tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        Handle::try_current().context("router must be started inside a tokio runtime")?;
        if self.flush_task.is_some() {
            bail!("router already started");
        }
        if *self.shutdown_rx.borrow() {
            bail!("router already shut down");
        }
        let flush = FlushLoop::new(
            Arc::clone(&self.queues),
            Arc::clone(&self.transport),
            self.config.cluster.flush_interval(),
            self.clock.clone(),
        );
        self.flush_task = Some(flush.spawn(self.shutdown_rx.clone()));
        if let Some(worker) = self.store_worker.take() {
            self.store_task = Some(worker.spawn(self.shutdown_rx.clone()));
        }
        tracing::info!(
            flush_interval_ms = self.config.cluster.flush_interval_ms,
            frame_capacity = self.config.cluster.frame_capacity,
            store = self.store_task.is_some(),
            "router started"
        );
        Ok(())
    }

    /// Signal the background tasks, wait for them, and return the flush totals.
    pub async fn shutdown(&mut self) -> Result<FlushStats> {
        self.shutdown_tx
            .send(true)
            .context("failed to broadcast shutdown")?;
        let mut totals = FlushStats::default();
        if let Some(task) = self.flush_task.take() {
            totals = task.await.context("flush loop panicked")?;
        }
        if let Some(task) = self.store_task.take() {
            task.await.context("store worker panicked")?;
        }
        tracing::info!(
            frames_sent = totals.frames_sent,
            frames_failed = totals.frames_failed,
            "router stopped"
        );
        Ok(totals)
    }

    pub fn publish(&self, tenant: u32, topic: &str, payload: &[u8], ttl: i64) {
        self.dispatcher.publish(tenant, topic, payload, ttl);
    }

    /// Decoder for inbound frames, bounded by `cluster.max_topic_len`. Each
    /// receiving worker keeps its own.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.config.cluster.max_topic_len)
    }

    /// Deliver a frame received from `from` to local consumers.
    pub fn receive_frame(
        &self,
        decoder: &mut FrameDecoder,
        from: PeerId,
        frame: &[u8],
    ) -> Result<usize, FrameError> {
        self.dispatcher.deliver_frame(decoder, frame).map_err(|err| {
            tracing::warn!(peer = %from, "malformed frame: {err}");
            err
        })
    }

    /// Apply a subscription event that arrived over the mesh.
    pub fn receive_event(&self, from: PeerId, event: &SubscriptionEvent) {
        self.registry.on_mesh_event(from, event);
    }

    pub fn on_node_join(&self, peer: PeerId) -> usize {
        self.registry.on_node_join(peer)
    }

    /// Forget a departed peer: its interests and anything queued for it.
    pub fn on_node_leave(&self, peer: PeerId) -> usize {
        let dropped = self.registry.on_node_leave(peer);
        let discarded = self.queues.remove(peer);
        if discarded > 0 {
            tracing::warn!(%peer, discarded, "discarded messages queued for departed peer");
        }
        dropped
    }

    /// Apply the reloadable parts of a new configuration.
    pub fn hot_reload(&mut self, new_config: Config) -> Result<()> {
        new_config.validate()?;
        if let Some(handle) = &self.log_handle {
            telemetry::set_level(handle, &new_config.telemetry.log_level)?;
        }
        self.config.telemetry = new_config.telemetry;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> C {
        self.clock.clone()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn queues(&self) -> &Arc<PeerQueues> {
        &self.queues
    }

    pub fn log_handle(&self) -> Option<LogHandle> {
        self.log_handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.flush_task.is_some()
    }
}

impl<C: Clock> Drop for Router<C> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
