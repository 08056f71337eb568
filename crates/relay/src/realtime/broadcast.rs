use std::collections::{HashMap, HashSet};

use easel_common::protocol::realtime::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::ConnectionId;

/// Room subscriptions: which connections receive broadcasts for a canvas.
#[derive(Debug, Default)]
pub struct Rooms {
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Rooms {
    pub fn subscribe(&mut self, canvas_id: Uuid, connection_id: ConnectionId) {
        self.rooms.entry(canvas_id).or_default().insert(connection_id);
    }

    pub fn unsubscribe(&mut self, canvas_id: &Uuid, connection_id: &ConnectionId) {
        if let Some(members) = self.rooms.get_mut(canvas_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(canvas_id);
            }
        }
    }

    pub fn unsubscribe_all(&mut self, connection_id: &ConnectionId) {
        self.rooms.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
    }

    pub fn members(&self, canvas_id: &Uuid) -> Vec<ConnectionId> {
        let mut members: Vec<ConnectionId> =
            self.rooms.get(canvas_id).map(|set| set.iter().copied().collect()).unwrap_or_default();
        members.sort_unstable();
        members
    }

    pub fn is_subscribed(&self, canvas_id: &Uuid, connection_id: &ConnectionId) -> bool {
        self.rooms.get(canvas_id).is_some_and(|members| members.contains(connection_id))
    }
}

/// Outbound queues of live connections. Delivery is fire-and-forget.
#[derive(Debug, Default)]
pub struct BroadcastCoordinator {
    outbound: HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
}

impl BroadcastCoordinator {
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) {
        self.outbound.insert(connection_id, sender);
    }

    pub fn unregister(&mut self, connection_id: &ConnectionId) {
        self.outbound.remove(connection_id);
    }

    pub fn send(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        let Some(sender) = self.outbound.get(connection_id) else {
            return false;
        };
        if sender.send(event).is_err() {
            debug!(connection_id = %connection_id, "outbound queue closed, dropping event");
            return false;
        }
        true
    }

    /// Sends one copy of `event` to each recipient; returns how many were queued.
    pub fn deliver(&self, recipients: &[ConnectionId], event: &ServerEvent) -> usize {
        recipients
            .iter()
            .filter(|connection_id| self.send(connection_id, event.clone()))
            .count()
    }
}
