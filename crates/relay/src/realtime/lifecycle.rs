// Connection lifecycle as a state machine.
//
// `RealtimeState::apply` consumes one input and returns the effects to carry
// out; it never performs I/O. Collaborator look-ups come back later as
// `Input::Fetched`, and everything about the connection and the canvas is
// re-checked at that point because other inputs may have run in between.

use std::collections::HashMap;

use easel_common::{
    protocol::realtime::{ClientEvent, ServerEvent},
    types::Canvas,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    broadcast::Rooms, error::RealtimeError, guard::authorize, registry::SessionRegistry,
    ConnectionId,
};

/// Why a canvas is being fetched; decides what happens when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    /// First load: install the snapshot unless another fetch got there first.
    Join,
    /// The cached snapshot denied the joiner; replace it and check again.
    JoinRevalidate,
    /// A persisted change: replace the snapshot and broadcast it.
    Update,
}

impl FetchPurpose {
    pub fn event_kind(self) -> &'static str {
        match self {
            Self::Join | Self::JoinRevalidate => "joinCanvas",
            Self::Update => "updateInMemory",
        }
    }
}

#[derive(Debug)]
pub enum Input {
    Connected {
        connection_id: ConnectionId,
        identity: String,
    },
    Event {
        connection_id: ConnectionId,
        event: ClientEvent,
    },
    Fetched {
        connection_id: ConnectionId,
        identity: String,
        canvas_id: Uuid,
        purpose: FetchPurpose,
        result: Result<Canvas, RealtimeError>,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// `identity` is the requester's, so the result can be judged after it disconnects.
    Fetch { connection_id: ConnectionId, identity: String, canvas_id: Uuid, purpose: FetchPurpose },
    Send { connection_id: ConnectionId, event: ServerEvent },
    Broadcast { canvas_id: Uuid, recipients: Vec<ConnectionId>, event: ServerEvent },
}

impl Effect {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Send { event: ServerEvent::Error { .. }, .. })
    }
}

#[derive(Debug, Default)]
pub struct RealtimeState {
    registry: SessionRegistry,
    rooms: Rooms,
    identities: HashMap<ConnectionId, String>,
    /// One update fetch in flight per canvas, plus at most one requester
    /// waiting to rerun it once the current fetch lands.
    pending_updates: HashMap<Uuid, Option<(ConnectionId, String)>>,
}

impl RealtimeState {
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub fn connection_count(&self) -> usize {
        self.identities.len()
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Connected { connection_id, identity } => {
                self.identities.insert(connection_id, identity);
                Vec::new()
            }
            Input::Event { connection_id, event } => self.on_event(connection_id, event),
            Input::Fetched { connection_id, identity, canvas_id, purpose, result } => {
                match purpose {
                    FetchPurpose::Update => {
                        self.on_update_fetched(connection_id, identity, canvas_id, result)
                    }
                    FetchPurpose::Join | FetchPurpose::JoinRevalidate => {
                        self.on_join_fetched(connection_id, canvas_id, purpose, result)
                    }
                }
            }
            Input::Disconnected { connection_id } => {
                self.on_disconnect(connection_id);
                Vec::new()
            }
        }
    }

    fn on_event(&mut self, connection_id: ConnectionId, event: ClientEvent) -> Vec<Effect> {
        let Some(identity) = self.identities.get(&connection_id).cloned() else {
            warn!(connection_id = %connection_id, kind = event.kind(), "event from unknown connection");
            return Vec::new();
        };

        let canvas_id = match parse_canvas_id(event.canvas_id()) {
            Ok(canvas_id) => canvas_id,
            Err(error) => {
                debug!(connection_id = %connection_id, kind = event.kind(), %error, "rejected event");
                return vec![reject(connection_id, &error, event.canvas_id())];
            }
        };

        let cached_access =
            self.registry.snapshot(&canvas_id).map(|snapshot| authorize(snapshot, &identity));

        match event {
            ClientEvent::JoinCanvas { .. } => match cached_access {
                Some(true) => self.complete_join(connection_id, canvas_id),
                Some(false) => vec![Effect::Fetch {
                    connection_id,
                    identity,
                    canvas_id,
                    purpose: FetchPurpose::JoinRevalidate,
                }],
                None => vec![Effect::Fetch {
                    connection_id,
                    identity,
                    canvas_id,
                    purpose: FetchPurpose::Join,
                }],
            },
            ClientEvent::UpdateInMemory { .. } => {
                self.request_update(connection_id, identity, canvas_id).into_iter().collect()
            }
            ClientEvent::LeaveCanvas { .. } => {
                self.leave(connection_id, canvas_id);
                Vec::new()
            }
        }
    }

    /// Starts an update fetch, or queues the requester behind the one in flight.
    fn request_update(
        &mut self,
        connection_id: ConnectionId,
        identity: String,
        canvas_id: Uuid,
    ) -> Option<Effect> {
        match self.pending_updates.get_mut(&canvas_id) {
            Some(queued) => {
                debug!(
                    connection_id = %connection_id,
                    canvas_id = %canvas_id,
                    "update fetch already in flight, queued"
                );
                *queued = Some((connection_id, identity));
                None
            }
            None => {
                self.pending_updates.insert(canvas_id, None);
                let purpose = FetchPurpose::Update;
                Some(Effect::Fetch { connection_id, identity, canvas_id, purpose })
            }
        }
    }

    fn on_join_fetched(
        &mut self,
        connection_id: ConnectionId,
        canvas_id: Uuid,
        purpose: FetchPurpose,
        result: Result<Canvas, RealtimeError>,
    ) -> Vec<Effect> {
        let Some(identity) = self.identities.get(&connection_id).cloned() else {
            debug!(
                connection_id = %connection_id,
                canvas_id = %canvas_id,
                "connection closed while fetching canvas, dropping result"
            );
            return Vec::new();
        };

        let fetched = match result {
            Ok(canvas) => canvas,
            Err(error) => return vec![self.fetch_failed(connection_id, canvas_id, &error)],
        };

        let snapshot = match purpose {
            FetchPurpose::Join => self.registry.ensure_loaded(fetched),
            _ => self.registry.refresh(fetched),
        };

        if !authorize(snapshot, &identity) {
            debug!(connection_id = %connection_id, canvas_id = %canvas_id, identity = %identity, "access denied");
            return vec![denied(connection_id, canvas_id)];
        }

        self.complete_join(connection_id, canvas_id)
    }

    /// The room hears about a persisted change even if the requester is gone;
    /// only replies addressed to the requester need it to still be connected.
    fn on_update_fetched(
        &mut self,
        connection_id: ConnectionId,
        identity: String,
        canvas_id: Uuid,
        result: Result<Canvas, RealtimeError>,
    ) -> Vec<Effect> {
        let queued = self.pending_updates.remove(&canvas_id).flatten();
        let live = self.identities.contains_key(&connection_id);

        let mut effects: Vec<Effect> = match result {
            Err(error) => {
                let reply = self.fetch_failed(connection_id, canvas_id, &error);
                if live {
                    vec![reply]
                } else {
                    Vec::new()
                }
            }
            Ok(fetched) => {
                if authorize(self.registry.refresh(fetched), &identity) {
                    self.broadcast_snapshot(canvas_id).into_iter().collect()
                } else {
                    debug!(
                        connection_id = %connection_id,
                        canvas_id = %canvas_id,
                        identity = %identity,
                        live,
                        "access denied on update"
                    );
                    if live {
                        vec![denied(connection_id, canvas_id)]
                    } else {
                        Vec::new()
                    }
                }
            }
        };

        if let Some((next_connection, next_identity)) = queued {
            effects.extend(self.request_update(next_connection, next_identity, canvas_id));
        }
        effects
    }

    fn fetch_failed(
        &mut self,
        connection_id: ConnectionId,
        canvas_id: Uuid,
        error: &RealtimeError,
    ) -> Effect {
        if matches!(error, RealtimeError::NotFound(_)) {
            self.registry.evict_idle(&canvas_id);
        }
        warn!(connection_id = %connection_id, canvas_id = %canvas_id, %error, "canvas fetch failed");
        reject(connection_id, error, Some(&canvas_id.to_string()))
    }

    fn complete_join(&mut self, connection_id: ConnectionId, canvas_id: Uuid) -> Vec<Effect> {
        if self.registry.record_membership(connection_id, canvas_id) {
            let viewers = self.registry.increment_viewer(&canvas_id);
            debug!(connection_id = %connection_id, canvas_id = %canvas_id, ?viewers, "joined canvas");
        }
        self.rooms.subscribe(canvas_id, connection_id);

        self.broadcast_snapshot(canvas_id).into_iter().collect()
    }

    fn broadcast_snapshot(&self, canvas_id: Uuid) -> Option<Effect> {
        let canvas = self.registry.snapshot(&canvas_id)?.clone();
        Some(Effect::Broadcast {
            canvas_id,
            recipients: self.rooms.members(&canvas_id),
            event: ServerEvent::CanvasUpdated { canvas },
        })
    }

    fn leave(&mut self, connection_id: ConnectionId, canvas_id: Uuid) {
        if !self.registry.remove_membership(&connection_id, &canvas_id) {
            return;
        }
        self.rooms.unsubscribe(&canvas_id, &connection_id);
        let remaining = self.registry.decrement_viewer(&canvas_id);
        debug!(connection_id = %connection_id, canvas_id = %canvas_id, ?remaining, "left canvas");
    }

    fn on_disconnect(&mut self, connection_id: ConnectionId) {
        let joined = self.registry.take_memberships(&connection_id);
        for canvas_id in &joined {
            self.registry.decrement_viewer(canvas_id);
        }
        self.rooms.unsubscribe_all(&connection_id);
        self.identities.remove(&connection_id);
        debug!(connection_id = %connection_id, released = joined.len(), "connection removed");
    }
}

fn parse_canvas_id(raw: Option<&str>) -> Result<Uuid, RealtimeError> {
    let raw = raw.map(str::trim).filter(|value| !value.is_empty()).ok_or_else(|| {
        RealtimeError::InvalidRequest("canvasId is required".to_owned())
    })?;

    Uuid::parse_str(raw)
        .map_err(|_| RealtimeError::InvalidRequest("canvasId is not a valid canvas id".to_owned()))
}

fn denied(connection_id: ConnectionId, canvas_id: Uuid) -> Effect {
    reject(connection_id, &RealtimeError::AccessDenied, Some(&canvas_id.to_string()))
}

fn reject(connection_id: ConnectionId, error: &RealtimeError, canvas_id: Option<&str>) -> Effect {
    Effect::Send { connection_id, event: error.to_event(canvas_id) }
}

#[cfg(test)]
mod tests {
    use super::{Effect, FetchPurpose, Input, RealtimeState};
    use crate::realtime::{error::RealtimeError, guard::tests::canvas_owned_by};
    use easel_common::{
        protocol::realtime::{ClientEvent, ServerEvent},
        types::{Canvas, UserRef},
    };
    use serde_json::json;
    use uuid::Uuid;

    fn connect(state: &mut RealtimeState, identity: &str) -> Uuid {
        let connection_id = Uuid::new_v4();
        state.apply(Input::Connected { connection_id, identity: identity.to_owned() });
        connection_id
    }

    fn join(state: &mut RealtimeState, connection_id: Uuid, canvas_id: Uuid) -> Vec<Effect> {
        state.apply(Input::Event {
            connection_id,
            event: ClientEvent::JoinCanvas { canvas_id: Some(canvas_id.to_string()) },
        })
    }

    fn leave(state: &mut RealtimeState, connection_id: Uuid, canvas_id: Uuid) -> Vec<Effect> {
        state.apply(Input::Event {
            connection_id,
            event: ClientEvent::LeaveCanvas { canvas_id: Some(canvas_id.to_string()) },
        })
    }

    fn update(state: &mut RealtimeState, connection_id: Uuid, canvas_id: Uuid) -> Vec<Effect> {
        state.apply(Input::Event {
            connection_id,
            event: ClientEvent::UpdateInMemory { canvas_id: Some(canvas_id.to_string()) },
        })
    }

    fn fetched(
        state: &mut RealtimeState,
        connection_id: Uuid,
        purpose: FetchPurpose,
        canvas: &Canvas,
    ) -> Vec<Effect> {
        let identity = state.identities.get(&connection_id).cloned().unwrap_or_default();
        fetched_as(state, connection_id, &identity, purpose, canvas)
    }

    fn fetched_as(
        state: &mut RealtimeState,
        connection_id: Uuid,
        identity: &str,
        purpose: FetchPurpose,
        canvas: &Canvas,
    ) -> Vec<Effect> {
        state.apply(Input::Fetched {
            connection_id,
            identity: identity.to_owned(),
            canvas_id: canvas.id,
            purpose,
            result: Ok(canvas.clone()),
        })
    }

    fn fetch_count(effects: &[Effect]) -> usize {
        effects.iter().filter(|effect| matches!(effect, Effect::Fetch { .. })).count()
    }

    /// Runs a join through its fetch, if one is requested.
    fn join_with(
        state: &mut RealtimeState,
        connection_id: Uuid,
        canvas: &Canvas,
    ) -> Vec<Effect> {
        let effects = join(state, connection_id, canvas.id);
        if let [Effect::Fetch { purpose, .. }] = effects.as_slice() {
            let purpose = *purpose;
            return fetched(state, connection_id, purpose, canvas);
        }
        effects
    }

    fn error_code(effects: &[Effect]) -> Option<String> {
        effects.iter().find_map(|effect| match effect {
            Effect::Send { event: ServerEvent::Error { code, .. }, .. } => Some(code.clone()),
            _ => None,
        })
    }

    fn broadcast_of(effects: &[Effect]) -> Option<(&[Uuid], &Canvas)> {
        effects.iter().find_map(|effect| match effect {
            Effect::Broadcast { recipients, event: ServerEvent::CanvasUpdated { canvas }, .. } => {
                Some((recipients.as_slice(), canvas))
            }
            _ => None,
        })
    }

    fn share_with(canvas: &Canvas, email: &str) -> Canvas {
        let mut updated = canvas.clone();
        updated.shared.push(UserRef { id: Uuid::new_v4(), email: email.to_owned() });
        updated
    }

    #[test]
    fn first_join_fetches_then_counts_and_broadcasts_to_joiner() {
        let mut state = RealtimeState::default();
        let owner = connect(&mut state, "a@x.io");
        let canvas = canvas_owned_by("a@x.io", &[]);

        let effects = join(&mut state, owner, canvas.id);
        assert_eq!(
            effects,
            vec![Effect::Fetch {
                connection_id: owner,
                identity: "a@x.io".to_owned(),
                canvas_id: canvas.id,
                purpose: FetchPurpose::Join
            }]
        );
        assert_eq!(state.registry().viewer_count(&canvas.id), None);

        let effects = fetched(&mut state, owner, FetchPurpose::Join, &canvas);
        let (recipients, broadcast) = broadcast_of(&effects).expect("join should broadcast");
        assert_eq!(recipients, &[owner]);
        assert_eq!(broadcast, &canvas);
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(1));
        assert!(state.registry().is_member(&owner, &canvas.id));
        assert!(state.registry().is_symmetric());
    }

    #[test]
    fn join_on_cached_canvas_completes_without_fetch() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let first = connect(&mut state, "a@x.io");
        let second = connect(&mut state, "b@x.io");
        join_with(&mut state, first, &canvas);

        let effects = join(&mut state, second, canvas.id);
        let (recipients, _) = broadcast_of(&effects).expect("cached join should broadcast");
        let mut expected = vec![first, second];
        expected.sort_unstable();
        assert_eq!(recipients, expected.as_slice());
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(2));
    }

    #[test]
    fn denied_join_then_share_then_join_succeeds() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let guest = connect(&mut state, "b@x.io");

        let effects = join_with(&mut state, guest, &canvas);
        assert_eq!(error_code(&effects).as_deref(), Some("ACCESS_DENIED"));
        assert!(broadcast_of(&effects).is_none());
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(0));
        assert!(!state.registry().is_member(&guest, &canvas.id));
        assert!(!state.rooms().is_subscribed(&canvas.id, &guest));

        let shared = share_with(&canvas, "b@x.io");
        let effects = join(&mut state, guest, canvas.id);
        assert_eq!(
            effects,
            vec![Effect::Fetch {
                connection_id: guest,
                identity: "b@x.io".to_owned(),
                canvas_id: canvas.id,
                purpose: FetchPurpose::JoinRevalidate
            }]
        );

        let effects = fetched(&mut state, guest, FetchPurpose::JoinRevalidate, &shared);
        let (recipients, broadcast) = broadcast_of(&effects).expect("join should broadcast");
        assert_eq!(recipients, &[guest]);
        assert!(broadcast.is_shared_with("b@x.io"));
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(1));
        assert!(state.registry().is_symmetric());
    }

    #[test]
    fn update_refreshes_and_broadcasts_identical_payload_to_room() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");
        join_with(&mut state, owner, &canvas);
        join_with(&mut state, guest, &canvas);

        let effects = update(&mut state, guest, canvas.id);
        assert!(matches!(effects.as_slice(), [Effect::Fetch { purpose: FetchPurpose::Update, .. }]));

        let mut edited = canvas.clone();
        edited.elements = vec![json!({"id": "shape-1", "type": "rect"})];
        let effects = fetched(&mut state, guest, FetchPurpose::Update, &edited);

        let (recipients, broadcast) = broadcast_of(&effects).expect("update should broadcast");
        assert_eq!(recipients.len(), 2);
        assert_eq!(broadcast.elements, edited.elements);
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(2));
        assert_eq!(
            state.registry().snapshot(&canvas.id).map(|snapshot| snapshot.elements.len()),
            Some(1)
        );
    }

    #[test]
    fn update_without_entry_creates_one_without_viewers() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let owner = connect(&mut state, "a@x.io");

        let effects = fetched(&mut state, owner, FetchPurpose::Update, &canvas);
        let (recipients, _) = broadcast_of(&effects).expect("update should broadcast");
        assert!(recipients.is_empty());
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(0));
    }

    #[test]
    fn revoked_user_is_denied_on_next_update() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let guest = connect(&mut state, "b@x.io");
        join_with(&mut state, guest, &canvas);

        let mut revoked = canvas.clone();
        revoked.shared.clear();
        let effects = fetched(&mut state, guest, FetchPurpose::Update, &revoked);

        assert_eq!(error_code(&effects).as_deref(), Some("ACCESS_DENIED"));
        assert!(broadcast_of(&effects).is_none());
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(1));
    }

    #[test]
    fn leave_without_join_is_a_silent_no_op() {
        let mut state = RealtimeState::default();
        let connection = connect(&mut state, "a@x.io");

        let effects = leave(&mut state, connection, Uuid::new_v4());

        assert!(effects.is_empty());
        assert_eq!(state.registry().cached_canvases(), 0);
        assert!(state.registry().memberships_of(&connection).is_none());
    }

    #[test]
    fn rejoin_does_not_double_count() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let owner = connect(&mut state, "a@x.io");

        join_with(&mut state, owner, &canvas);
        let effects = join_with(&mut state, owner, &canvas);

        assert!(broadcast_of(&effects).is_some());
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(1));

        leave(&mut state, owner, canvas.id);
        assert_eq!(state.registry().viewer_count(&canvas.id), None);
        assert!(state.registry().is_symmetric());
    }

    #[test]
    fn disconnect_releases_every_joined_canvas_once() {
        let mut state = RealtimeState::default();
        let first = canvas_owned_by("a@x.io", &[]);
        let second = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");

        join_with(&mut state, owner, &second);
        join_with(&mut state, owner, &first);
        join_with(&mut state, guest, &second);

        let effects = state.apply(Input::Disconnected { connection_id: owner });

        assert!(effects.is_empty());
        assert_eq!(state.registry().viewer_count(&first.id), None);
        assert_eq!(state.registry().viewer_count(&second.id), Some(1));
        assert!(state.registry().memberships_of(&owner).is_none());
        assert!(!state.rooms().is_subscribed(&second.id, &owner));
        assert_eq!(state.connection_count(), 1);
        assert!(state.registry().is_symmetric());
    }

    #[test]
    fn fetch_result_after_disconnect_is_dropped() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let owner = connect(&mut state, "a@x.io");

        let effects = join(&mut state, owner, canvas.id);
        assert!(matches!(effects.as_slice(), [Effect::Fetch { .. }]));
        state.apply(Input::Disconnected { connection_id: owner });

        let effects = fetched(&mut state, owner, FetchPurpose::Join, &canvas);

        assert!(effects.is_empty());
        assert_eq!(state.registry().cached_canvases(), 0);
        assert!(state.registry().memberships_of(&owner).is_none());
    }

    #[test]
    fn update_landing_after_requester_disconnects_still_reaches_the_room() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");
        join_with(&mut state, owner, &canvas);
        join_with(&mut state, guest, &canvas);

        assert_eq!(fetch_count(&update(&mut state, guest, canvas.id)), 1);
        state.apply(Input::Disconnected { connection_id: guest });

        let mut edited = canvas.clone();
        edited.elements = vec![json!({"id": "shape-1", "type": "rect"})];
        let effects = fetched_as(&mut state, guest, "b@x.io", FetchPurpose::Update, &edited);

        assert!(error_code(&effects).is_none());
        let (recipients, broadcast) = broadcast_of(&effects).expect("room should hear the update");
        assert_eq!(recipients, &[owner]);
        assert_eq!(broadcast.elements, edited.elements);
        assert_eq!(
            state.registry().snapshot(&canvas.id).map(|snapshot| snapshot.elements.len()),
            Some(1)
        );
    }

    #[test]
    fn update_denied_after_requester_disconnects_sends_nothing() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");
        join_with(&mut state, owner, &canvas);
        join_with(&mut state, guest, &canvas);

        update(&mut state, guest, canvas.id);
        state.apply(Input::Disconnected { connection_id: guest });

        let mut revoked = canvas.clone();
        revoked.shared.clear();
        let effects = fetched_as(&mut state, guest, "b@x.io", FetchPurpose::Update, &revoked);

        assert!(effects.is_empty());
        let cached = state.registry().snapshot(&canvas.id).expect("snapshot stays cached");
        assert!(cached.shared.is_empty());
    }

    #[test]
    fn updates_for_one_canvas_share_a_single_fetch_in_flight() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");
        join_with(&mut state, owner, &canvas);
        join_with(&mut state, guest, &canvas);

        assert_eq!(fetch_count(&update(&mut state, owner, canvas.id)), 1);
        for _ in 0..50 {
            assert!(update(&mut state, guest, canvas.id).is_empty());
        }

        let other = canvas_owned_by("a@x.io", &[]);
        assert_eq!(fetch_count(&update(&mut state, owner, other.id)), 1);

        // Edits queued behind the first fetch collapse into one rerun.
        let effects = fetched(&mut state, owner, FetchPurpose::Update, &canvas);
        assert!(broadcast_of(&effects).is_some());
        assert_eq!(
            effects.iter().find(|effect| matches!(effect, Effect::Fetch { .. })),
            Some(&Effect::Fetch {
                connection_id: guest,
                identity: "b@x.io".to_owned(),
                canvas_id: canvas.id,
                purpose: FetchPurpose::Update,
            })
        );

        let effects = fetched(&mut state, guest, FetchPurpose::Update, &canvas);
        assert!(broadcast_of(&effects).is_some());
        assert_eq!(fetch_count(&effects), 0);
        assert_eq!(fetch_count(&update(&mut state, guest, canvas.id)), 1);
    }

    #[test]
    fn concurrent_first_joins_keep_the_first_installed_snapshot() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &["b@x.io"]);
        let owner = connect(&mut state, "a@x.io");
        let guest = connect(&mut state, "b@x.io");

        join(&mut state, owner, canvas.id);
        join(&mut state, guest, canvas.id);

        let mut later = canvas.clone();
        later.name = "renamed".to_owned();
        fetched(&mut state, owner, FetchPurpose::Join, &canvas);
        let effects = fetched(&mut state, guest, FetchPurpose::Join, &later);

        let (recipients, broadcast) = broadcast_of(&effects).expect("join should broadcast");
        assert_eq!(recipients.len(), 2);
        assert_eq!(broadcast.name, "board");
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(2));
    }

    #[test]
    fn missing_or_malformed_canvas_id_is_reported_to_sender() {
        let mut state = RealtimeState::default();
        let connection = connect(&mut state, "a@x.io");

        for event in [
            ClientEvent::JoinCanvas { canvas_id: None },
            ClientEvent::UpdateInMemory { canvas_id: Some("   ".to_owned()) },
            ClientEvent::LeaveCanvas { canvas_id: Some("not-a-uuid".to_owned()) },
        ] {
            let effects = state.apply(Input::Event { connection_id: connection, event });
            assert_eq!(effects.len(), 1);
            assert!(effects[0].is_error());
            assert_eq!(error_code(&effects).as_deref(), Some("INVALID_REQUEST"));
        }
        assert_eq!(state.registry().cached_canvases(), 0);
    }

    #[test]
    fn missing_canvas_reports_not_found_and_drops_idle_entry() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let stranger = connect(&mut state, "c@x.io");
        join_with(&mut state, stranger, &canvas);
        assert_eq!(state.registry().viewer_count(&canvas.id), Some(0));

        let effects = state.apply(Input::Fetched {
            connection_id: stranger,
            identity: "c@x.io".to_owned(),
            canvas_id: canvas.id,
            purpose: FetchPurpose::Update,
            result: Err(RealtimeError::NotFound("canvas")),
        });

        assert_eq!(error_code(&effects).as_deref(), Some("NOT_FOUND"));
        assert_eq!(state.registry().cached_canvases(), 0);
    }

    #[test]
    fn only_error_replies_count_as_errors() {
        let mut state = RealtimeState::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        let owner = connect(&mut state, "a@x.io");
        let stranger = connect(&mut state, "c@x.io");

        let fetch = join(&mut state, owner, canvas.id);
        assert!(!fetch.iter().any(Effect::is_error));
        let joined = fetched(&mut state, owner, FetchPurpose::Join, &canvas);
        assert!(!joined.iter().any(Effect::is_error));

        let revalidate = join(&mut state, stranger, canvas.id);
        assert!(matches!(revalidate.as_slice(), [effect] if !effect.is_error()));
        let denied = fetched(&mut state, stranger, FetchPurpose::JoinRevalidate, &canvas);
        assert!(matches!(denied.as_slice(), [effect] if effect.is_error()));
    }

    #[test]
    fn events_from_unknown_connections_are_ignored() {
        let mut state = RealtimeState::default();
        let effects = join(&mut state, Uuid::new_v4(), Uuid::new_v4());
        assert!(effects.is_empty());
    }

    #[test]
    fn net_viewer_delta_matches_effective_joins_and_leaves() {
        let mut state = RealtimeState::default();
        let canvases: Vec<Canvas> =
            (0..3).map(|_| canvas_owned_by("a@x.io", &["b@x.io", "c@x.io"])).collect();
        let connections: Vec<Uuid> = ["a@x.io", "b@x.io", "c@x.io", "a@x.io"]
            .iter()
            .map(|identity| connect(&mut state, identity))
            .collect();

        // Deterministic LCG so the interleaving is reproducible.
        let mut seed: u64 = 0x5eed;
        let mut next = |bound: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((seed >> 33) as usize) % bound
        };

        for _ in 0..500 {
            let connection = connections[next(connections.len())];
            let canvas = &canvases[next(canvases.len())];
            let before = state.registry().viewer_count(&canvas.id).unwrap_or(0);
            let was_member = state.registry().is_member(&connection, &canvas.id);

            if next(2) == 0 {
                join_with(&mut state, connection, canvas);
                let expected = if was_member { before } else { before + 1 };
                assert_eq!(state.registry().viewer_count(&canvas.id), Some(expected));
            } else {
                leave(&mut state, connection, canvas.id);
                let after = state.registry().viewer_count(&canvas.id).unwrap_or(0);
                let expected = if was_member { before - 1 } else { before };
                assert_eq!(after, expected);
            }
            assert!(state.registry().is_symmetric());
        }

        for connection in connections {
            state.apply(Input::Disconnected { connection_id: connection });
        }
        assert_eq!(state.registry().cached_canvases(), 0);
        assert!(state.registry().is_symmetric());
    }
}
