// Core domain types shared across the easel crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public view of a registered user. Never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user as referenced from a canvas (owner or shared entry).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    pub id: Uuid,
    pub email: String,
}

/// A canvas with its full content.
///
/// `id` is the stable external identifier handed to clients; storage keys
/// never leave the store. `elements` is an opaque client-owned document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Canvas {
    pub id: Uuid,
    pub name: String,
    pub owner: UserRef,
    #[serde(default)]
    pub shared: Vec<UserRef>,
    #[serde(default)]
    pub elements: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Canvas {
    pub fn is_owner(&self, email: &str) -> bool {
        self.owner.email == email
    }

    pub fn is_shared_with(&self, email: &str) -> bool {
        self.shared.iter().any(|user| user.email == email)
    }

    pub fn summary(&self) -> CanvasSummary {
        CanvasSummary {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner.clone(),
            shared: self.shared.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing view of a canvas, without its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanvasSummary {
    pub id: Uuid,
    pub name: String,
    pub owner: UserRef,
    #[serde(default)]
    pub shared: Vec<UserRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
