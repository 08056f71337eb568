use std::collections::HashMap;

use chrono::Utc;
use easel_common::types::{Canvas, CanvasSummary, UserRef};
use serde_json::Value;
use uuid::Uuid;

use super::{StoreError, UserRecord};

#[derive(Default)]
pub struct MemoryCanvasStore {
    users: HashMap<String, UserRecord>,
    canvases: HashMap<Uuid, MemoryCanvas>,
    next_sequence: u64,
}

struct MemoryCanvas {
    canvas: Canvas,
    // Tie-breaker for canvases created within the same clock tick.
    sequence: u64,
}

impl MemoryCanvasStore {
    pub(super) fn find_user_by_email(&self, email: &str) -> Option<UserRecord> {
        self.users.get(email).cloned()
    }

    pub(super) fn create_user(
        &mut self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, StoreError> {
        if self.users.contains_key(email) {
            return Err(StoreError::Conflict("user already exists"));
        }

        let now = Utc::now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            email: email.to_owned(),
            password_hash: password_hash.to_owned(),
            created_at: now,
            updated_at: now,
        };
        self.users.insert(email.to_owned(), record.clone());

        Ok(record)
    }

    pub(super) fn find_canvas(&self, canvas_id: Uuid) -> Option<Canvas> {
        self.canvases.get(&canvas_id).map(|entry| entry.canvas.clone())
    }

    pub(super) fn create_canvas(&mut self, owner: &UserRef, name: &str) -> Canvas {
        let now = Utc::now();
        let canvas = Canvas {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            owner: owner.clone(),
            shared: Vec::new(),
            elements: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.next_sequence += 1;
        self.canvases
            .insert(canvas.id, MemoryCanvas { canvas: canvas.clone(), sequence: self.next_sequence });

        canvas
    }

    pub(super) fn list_canvases_for_user(&self, user_id: Uuid) -> Vec<CanvasSummary> {
        let mut visible: Vec<&MemoryCanvas> = self
            .canvases
            .values()
            .filter(|entry| {
                entry.canvas.owner.id == user_id
                    || entry.canvas.shared.iter().any(|user| user.id == user_id)
            })
            .collect();

        visible.sort_by(|left, right| {
            right
                .canvas
                .created_at
                .cmp(&left.canvas.created_at)
                .then_with(|| right.sequence.cmp(&left.sequence))
        });

        visible.into_iter().map(|entry| entry.canvas.summary()).collect()
    }

    pub(super) fn replace_elements(
        &mut self,
        canvas_id: Uuid,
        elements: Vec<Value>,
    ) -> Result<Canvas, StoreError> {
        let entry = self.canvas_mut(canvas_id)?;
        entry.canvas.elements = elements;
        entry.canvas.updated_at = Utc::now();
        Ok(entry.canvas.clone())
    }

    pub(super) fn add_shared_user(
        &mut self,
        canvas_id: Uuid,
        user: &UserRef,
    ) -> Result<Canvas, StoreError> {
        let entry = self.canvas_mut(canvas_id)?;
        if !entry.canvas.shared.iter().any(|existing| existing.id == user.id) {
            entry.canvas.shared.push(user.clone());
            entry.canvas.updated_at = Utc::now();
        }
        Ok(entry.canvas.clone())
    }

    pub(super) fn remove_shared_user(
        &mut self,
        canvas_id: Uuid,
        user: &UserRef,
    ) -> Result<Canvas, StoreError> {
        let entry = self.canvas_mut(canvas_id)?;
        let before = entry.canvas.shared.len();
        entry.canvas.shared.retain(|existing| existing.id != user.id);
        if entry.canvas.shared.len() != before {
            entry.canvas.updated_at = Utc::now();
        }
        Ok(entry.canvas.clone())
    }

    pub(super) fn delete_canvas(&mut self, canvas_id: Uuid) -> Result<(), StoreError> {
        self.canvases.remove(&canvas_id).map(|_| ()).ok_or(StoreError::NotFound("canvas"))
    }

    fn canvas_mut(&mut self, canvas_id: Uuid) -> Result<&mut MemoryCanvas, StoreError> {
        self.canvases.get_mut(&canvas_id).ok_or(StoreError::NotFound("canvas"))
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryCanvasStore;
    use crate::store::StoreError;
    use easel_common::types::UserRef;
    use serde_json::json;
    use uuid::Uuid;

    fn user_ref(email: &str) -> UserRef {
        UserRef { id: Uuid::new_v4(), email: email.to_owned() }
    }

    #[test]
    fn duplicate_email_conflicts() {
        let mut store = MemoryCanvasStore::default();
        store.create_user("Ada", "ada@example.com", "hash").expect("first user");
        let error = store.create_user("Ada 2", "ada@example.com", "hash").expect_err("conflict");
        assert!(matches!(error, StoreError::Conflict(_)));
    }

    #[test]
    fn listing_includes_owned_and_shared_newest_first() {
        let mut store = MemoryCanvasStore::default();
        let ada = user_ref("ada@example.com");
        let bob = user_ref("bob@example.com");

        let first = store.create_canvas(&ada, "first");
        let second = store.create_canvas(&bob, "second");
        let _unrelated = store.create_canvas(&bob, "bob only");
        store.add_shared_user(second.id, &ada).expect("share");
        let third = store.create_canvas(&ada, "third");

        let names: Vec<_> =
            store.list_canvases_for_user(ada.id).into_iter().map(|summary| summary.name).collect();
        assert_eq!(names, vec![third.name, second.name, first.name]);
    }

    #[test]
    fn sharing_is_unique_and_removable() {
        let mut store = MemoryCanvasStore::default();
        let ada = user_ref("ada@example.com");
        let bob = user_ref("bob@example.com");
        let canvas = store.create_canvas(&ada, "shared");

        store.add_shared_user(canvas.id, &bob).expect("share");
        let shared_twice = store.add_shared_user(canvas.id, &bob).expect("share again");
        assert_eq!(shared_twice.shared.len(), 1);

        let removed = store.remove_shared_user(canvas.id, &bob).expect("unshare");
        assert!(removed.shared.is_empty());
    }

    #[test]
    fn replacing_elements_on_missing_canvas_is_not_found() {
        let mut store = MemoryCanvasStore::default();
        let error = store.replace_elements(Uuid::new_v4(), vec![json!(1)]).expect_err("missing");
        assert!(matches!(error, StoreError::NotFound("canvas")));
    }
}
