// Process-wide cache of canvases that connections are viewing.
//
// Owned by the hub task; nothing here suspends, so every method is one
// uninterrupted step of the realtime state machine.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use easel_common::types::Canvas;
use uuid::Uuid;

use super::ConnectionId;

#[derive(Debug, Clone)]
struct RegistryEntry {
    snapshot: Canvas,
    viewers: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    canvases: HashMap<Uuid, RegistryEntry>,
    memberships: HashMap<ConnectionId, HashSet<Uuid>>,
}

impl SessionRegistry {
    pub fn snapshot(&self, canvas_id: &Uuid) -> Option<&Canvas> {
        self.canvases.get(canvas_id).map(|entry| &entry.snapshot)
    }

    pub fn viewer_count(&self, canvas_id: &Uuid) -> Option<usize> {
        self.canvases.get(canvas_id).map(|entry| entry.viewers)
    }

    pub fn cached_canvases(&self) -> usize {
        self.canvases.len()
    }

    /// Installs `fetched` with zero viewers unless an entry already exists,
    /// in which case the cached snapshot wins and `fetched` is discarded.
    pub fn ensure_loaded(&mut self, fetched: Canvas) -> &Canvas {
        let entry = self
            .canvases
            .entry(fetched.id)
            .or_insert_with(|| RegistryEntry { snapshot: fetched, viewers: 0 });
        &entry.snapshot
    }

    /// Replaces the cached snapshot, keeping the viewer count.
    pub fn refresh(&mut self, fetched: Canvas) -> &Canvas {
        match self.canvases.entry(fetched.id) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.snapshot = fetched;
                &entry.snapshot
            }
            Entry::Vacant(vacant) => {
                &vacant.insert(RegistryEntry { snapshot: fetched, viewers: 0 }).snapshot
            }
        }
    }

    /// Drops an entry nobody is viewing. Entries with viewers are kept.
    pub fn evict_idle(&mut self, canvas_id: &Uuid) -> bool {
        match self.canvases.get(canvas_id) {
            Some(entry) if entry.viewers == 0 => {
                self.canvases.remove(canvas_id);
                true
            }
            _ => false,
        }
    }

    pub fn increment_viewer(&mut self, canvas_id: &Uuid) -> Option<usize> {
        let entry = self.canvases.get_mut(canvas_id)?;
        entry.viewers += 1;
        Some(entry.viewers)
    }

    /// Returns the remaining count; the entry is removed when it reaches zero.
    pub fn decrement_viewer(&mut self, canvas_id: &Uuid) -> Option<usize> {
        let entry = self.canvases.get_mut(canvas_id)?;
        entry.viewers = entry.viewers.saturating_sub(1);
        let remaining = entry.viewers;
        if remaining == 0 {
            self.canvases.remove(canvas_id);
        }
        Some(remaining)
    }

    pub fn is_member(&self, connection_id: &ConnectionId, canvas_id: &Uuid) -> bool {
        self.memberships.get(connection_id).is_some_and(|canvases| canvases.contains(canvas_id))
    }

    pub fn memberships_of(&self, connection_id: &ConnectionId) -> Option<&HashSet<Uuid>> {
        self.memberships.get(connection_id)
    }

    /// Returns false when the connection already held this membership.
    pub fn record_membership(&mut self, connection_id: ConnectionId, canvas_id: Uuid) -> bool {
        self.memberships.entry(connection_id).or_default().insert(canvas_id)
    }

    /// Removes one membership; the connection's entry goes once its set is empty.
    pub fn remove_membership(&mut self, connection_id: &ConnectionId, canvas_id: &Uuid) -> bool {
        let Some(canvases) = self.memberships.get_mut(connection_id) else {
            return false;
        };
        let removed = canvases.remove(canvas_id);
        if canvases.is_empty() {
            self.memberships.remove(connection_id);
        }
        removed
    }

    pub fn take_memberships(&mut self, connection_id: &ConnectionId) -> HashSet<Uuid> {
        self.memberships.remove(connection_id).unwrap_or_default()
    }

    /// Every viewer count equals the number of connections holding that
    /// membership, and every membership points at a cached entry.
    #[cfg(test)]
    pub(crate) fn is_symmetric(&self) -> bool {
        let mut attributed: HashMap<Uuid, usize> = HashMap::new();
        for canvases in self.memberships.values() {
            if canvases.is_empty() {
                return false;
            }
            for canvas_id in canvases {
                *attributed.entry(*canvas_id).or_default() += 1;
            }
        }

        attributed.iter().all(|(canvas_id, count)| {
            self.canvases.get(canvas_id).is_some_and(|entry| entry.viewers == *count)
        }) && self.canvases.iter().all(|(canvas_id, entry)| {
            entry.viewers == attributed.get(canvas_id).copied().unwrap_or(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SessionRegistry;
    use crate::realtime::guard::tests::canvas_owned_by;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn ensure_loaded_keeps_existing_snapshot() {
        let mut registry = SessionRegistry::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        registry.ensure_loaded(canvas.clone());

        let mut newer = canvas.clone();
        newer.elements.push(json!({"id": 1}));
        let cached = registry.ensure_loaded(newer);

        assert!(cached.elements.is_empty());
        assert_eq!(registry.viewer_count(&canvas.id), Some(0));
    }

    #[test]
    fn refresh_replaces_snapshot_and_preserves_count() {
        let mut registry = SessionRegistry::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        registry.ensure_loaded(canvas.clone());
        registry.increment_viewer(&canvas.id);
        registry.increment_viewer(&canvas.id);

        let mut newer = canvas.clone();
        newer.elements.push(json!({"id": 1}));
        registry.refresh(newer);

        assert_eq!(registry.snapshot(&canvas.id).map(|c| c.elements.len()), Some(1));
        assert_eq!(registry.viewer_count(&canvas.id), Some(2));
    }

    #[test]
    fn decrement_to_zero_removes_entry() {
        let mut registry = SessionRegistry::default();
        let canvas = canvas_owned_by("a@x.io", &[]);
        registry.ensure_loaded(canvas.clone());
        registry.increment_viewer(&canvas.id);

        assert_eq!(registry.decrement_viewer(&canvas.id), Some(0));
        assert!(registry.snapshot(&canvas.id).is_none());
        assert_eq!(registry.decrement_viewer(&canvas.id), None);
        assert_eq!(registry.increment_viewer(&canvas.id), None);
    }

    #[test]
    fn membership_entry_disappears_when_empty() {
        let mut registry = SessionRegistry::default();
        let connection = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(registry.record_membership(connection, first));
        assert!(!registry.record_membership(connection, first));
        assert!(registry.record_membership(connection, second));

        assert!(registry.remove_membership(&connection, &first));
        assert!(registry.memberships_of(&connection).is_some());
        assert!(registry.remove_membership(&connection, &second));
        assert!(registry.memberships_of(&connection).is_none());
        assert!(!registry.remove_membership(&connection, &second));
    }

    #[test]
    fn evict_idle_only_drops_unviewed_entries() {
        let mut registry = SessionRegistry::default();
        let idle = canvas_owned_by("a@x.io", &[]);
        let viewed = canvas_owned_by("a@x.io", &[]);
        registry.ensure_loaded(idle.clone());
        registry.ensure_loaded(viewed.clone());
        registry.increment_viewer(&viewed.id);

        assert!(registry.evict_idle(&idle.id));
        assert!(!registry.evict_idle(&viewed.id));
        assert_eq!(registry.cached_canvases(), 1);
    }
}
