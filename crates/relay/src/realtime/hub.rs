// The hub task owns all realtime state and processes one command at a time.
//
// Connection tasks hold a cloneable `HubHandle`. Canvas fetches run in
// spawned tasks that post their result back as a `Loaded` command, so other
// commands keep flowing while storage is slow.

use std::{sync::Arc, time::Instant};

use easel_common::{
    protocol::realtime::{ClientEvent, ServerEvent},
    types::Canvas,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    broadcast::BroadcastCoordinator,
    error::RealtimeError,
    lifecycle::{Effect, FetchPurpose, Input, RealtimeState},
    ConnectionId,
};
use crate::{metrics, store::CanvasStore};

const HUB_CHANNEL_CAPACITY: usize = 256;
/// Store reads the hub runs at once; the rest wait for a permit. Kept below
/// the default pool size so REST handlers still get connections.
const MAX_CONCURRENT_FETCHES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeStats {
    pub connections: usize,
    pub cached_canvases: usize,
}

enum HubCommand {
    Connect {
        connection_id: ConnectionId,
        identity: String,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    },
    Event {
        connection_id: ConnectionId,
        event: ClientEvent,
        received_at: Instant,
    },
    Loaded {
        connection_id: ConnectionId,
        identity: String,
        canvas_id: Uuid,
        purpose: FetchPurpose,
        result: Result<Canvas, RealtimeError>,
        received_at: Instant,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<RealtimeStats>,
    },
    ViewerCount {
        canvas_id: Uuid,
        reply: oneshot::Sender<Option<usize>>,
    },
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub async fn connect(
        &self,
        connection_id: ConnectionId,
        identity: String,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(), RealtimeError> {
        self.send(HubCommand::Connect { connection_id, identity, outbound }).await
    }

    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RealtimeError> {
        self.send(HubCommand::Event { connection_id, event, received_at: Instant::now() }).await
    }

    pub async fn disconnect(&self, connection_id: ConnectionId) {
        if self.send(HubCommand::Disconnect { connection_id }).await.is_err() {
            debug!(connection_id = %connection_id, "hub already stopped during disconnect");
        }
    }

    pub async fn stats(&self) -> Result<RealtimeStats, RealtimeError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        response.await.map_err(|_| RealtimeError::Unavailable)
    }

    pub async fn viewer_count(&self, canvas_id: Uuid) -> Result<Option<usize>, RealtimeError> {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::ViewerCount { canvas_id, reply }).await?;
        response.await.map_err(|_| RealtimeError::Unavailable)
    }

    async fn send(&self, command: HubCommand) -> Result<(), RealtimeError> {
        self.tx.send(command).await.map_err(|_| RealtimeError::Unavailable)
    }
}

struct Hub {
    state: RealtimeState,
    coordinator: BroadcastCoordinator,
    store: CanvasStore,
    fetch_permits: Arc<Semaphore>,
    loopback: mpsc::WeakSender<HubCommand>,
}

/// Starts the hub. It stops once every `HubHandle` is dropped and in-flight
/// fetches have drained.
pub fn spawn_hub(store: CanvasStore) -> HubHandle {
    let (tx, mut rx) = mpsc::channel::<HubCommand>(HUB_CHANNEL_CAPACITY);
    let mut hub = Hub {
        state: RealtimeState::default(),
        coordinator: BroadcastCoordinator::default(),
        store,
        fetch_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES)),
        loopback: tx.downgrade(),
    };

    tokio::spawn(async move {
        info!(store = hub.store.backend_name(), "realtime hub started");
        while let Some(command) = rx.recv().await {
            hub.handle(command);
        }
        info!("realtime hub stopped");
    });

    HubHandle { tx }
}

impl Hub {
    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { connection_id, identity, outbound } => {
                debug!(connection_id = %connection_id, identity = %identity, "connection registered");
                self.coordinator.register(connection_id, outbound);
                self.state.apply(Input::Connected { connection_id, identity });
            }
            HubCommand::Event { connection_id, event, received_at } => {
                let kind = event.kind();
                let effects = self.state.apply(Input::Event { connection_id, event });
                self.run_effects(effects, kind, received_at);
            }
            HubCommand::Loaded {
                connection_id,
                identity,
                canvas_id,
                purpose,
                result,
                received_at,
            } => {
                let effects = self.state.apply(Input::Fetched {
                    connection_id,
                    identity,
                    canvas_id,
                    purpose,
                    result,
                });
                self.run_effects(effects, purpose.event_kind(), received_at);
            }
            HubCommand::Disconnect { connection_id } => {
                self.state.apply(Input::Disconnected { connection_id });
                self.coordinator.unregister(&connection_id);
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(RealtimeStats {
                    connections: self.state.connection_count(),
                    cached_canvases: self.state.registry().cached_canvases(),
                });
            }
            HubCommand::ViewerCount { canvas_id, reply } => {
                let _ = reply.send(self.state.registry().viewer_count(&canvas_id));
            }
        }

        metrics::set_realtime_gauges(
            self.state.connection_count(),
            self.state.registry().cached_canvases(),
        );
    }

    fn run_effects(&mut self, effects: Vec<Effect>, kind: &'static str, received_at: Instant) {
        let mut awaiting_fetch = false;
        let mut is_error = false;

        for effect in effects {
            is_error |= effect.is_error();
            match effect {
                Effect::Fetch { connection_id, identity, canvas_id, purpose } => {
                    awaiting_fetch = true;
                    self.spawn_fetch(connection_id, identity, canvas_id, purpose, received_at);
                }
                Effect::Send { connection_id, event } => {
                    self.coordinator.send(&connection_id, event);
                }
                Effect::Broadcast { canvas_id, recipients, event } => {
                    let delivered = self.coordinator.deliver(&recipients, &event);
                    debug!(
                        canvas_id = %canvas_id,
                        recipients = recipients.len(),
                        delivered,
                        "broadcast canvas state"
                    );
                }
            }
        }

        if !awaiting_fetch {
            let latency_ms = received_at.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;
            metrics::record_realtime_event(kind, is_error, latency_ms);
        }
    }

    fn spawn_fetch(
        &self,
        connection_id: ConnectionId,
        identity: String,
        canvas_id: Uuid,
        purpose: FetchPurpose,
        received_at: Instant,
    ) {
        let Some(loopback) = self.loopback.upgrade() else {
            return;
        };
        let store = self.store.clone();
        let permits = Arc::clone(&self.fetch_permits);

        tokio::spawn(async move {
            // The semaphore is never closed.
            let result = match permits.acquire_owned().await {
                Ok(_permit) => fetch_canvas(&store, canvas_id).await,
                Err(_) => Err(RealtimeError::Unavailable),
            };
            let loaded = HubCommand::Loaded {
                connection_id,
                identity,
                canvas_id,
                purpose,
                result,
                received_at,
            };
            if loopback.send(loaded).await.is_err() {
                debug!(canvas_id = %canvas_id, "hub stopped before fetch completed");
            }
        });
    }
}

async fn fetch_canvas(store: &CanvasStore, canvas_id: Uuid) -> Result<Canvas, RealtimeError> {
    match store.find_canvas_by_external_id(canvas_id).await {
        Ok(Some(canvas)) => Ok(canvas),
        Ok(None) => Err(RealtimeError::NotFound("canvas")),
        Err(error) => {
            warn!(canvas_id = %canvas_id, error = %error, "canvas lookup failed");
            Err(RealtimeError::Unavailable)
        }
    }
}
