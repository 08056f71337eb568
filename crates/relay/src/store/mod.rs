// Persistent users and canvases.
//
// Two interchangeable backends: PostgreSQL for deployments and an in-memory
// map for tests and local development without a database.

mod memory;
mod postgres;

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use easel_common::types::{Canvas, CanvasSummary, UserProfile, UserRef};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::db::{
    migrations::run_migrations,
    pool::{check_pool_health, create_pg_pool, PoolConfig},
};

pub use memory::MemoryCanvasStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(&'static str),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A stored account, including its password hash.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn user_ref(&self) -> UserRef {
        UserRef { id: self.id, email: self.email.clone() }
    }
}

#[derive(Clone)]
pub enum CanvasStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryCanvasStore>>),
}

impl CanvasStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::default())
    }

    /// Connects to PostgreSQL when a URL is configured, otherwise falls back to memory.
    pub async fn from_config(database_url: Option<&str>) -> anyhow::Result<Self> {
        let Some(database_url) = database_url else {
            info!("no database url configured, using in-memory canvas store");
            return Ok(Self::memory());
        };

        let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
        check_pool_health(&pool).await?;
        run_migrations(&pool).await.context("canvas store migrations failed")?;
        info!("connected to postgres canvas store");

        Ok(Self::Postgres(pool))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_user_by_email(pool, email).await,
            Self::Memory(store) => Ok(store.read().await.find_user_by_email(email)),
        }
    }

    pub async fn create_user(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::create_user(pool, name, email, password_hash).await,
            Self::Memory(store) => store.write().await.create_user(name, email, password_hash),
        }
    }

    pub async fn find_canvas_by_external_id(
        &self,
        canvas_id: Uuid,
    ) -> Result<Option<Canvas>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::find_canvas(pool, canvas_id).await,
            Self::Memory(store) => Ok(store.read().await.find_canvas(canvas_id)),
        }
    }

    pub async fn create_canvas(&self, owner: &UserRef, name: &str) -> Result<Canvas, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::create_canvas(pool, owner, name).await,
            Self::Memory(store) => Ok(store.write().await.create_canvas(owner, name)),
        }
    }

    /// Canvases owned by or shared with `user_id`, newest first, without content.
    pub async fn list_canvases_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<CanvasSummary>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::list_canvases_for_user(pool, user_id).await,
            Self::Memory(store) => Ok(store.read().await.list_canvases_for_user(user_id)),
        }
    }

    pub async fn replace_elements(
        &self,
        canvas_id: Uuid,
        elements: Vec<Value>,
    ) -> Result<Canvas, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::replace_elements(pool, canvas_id, elements).await,
            Self::Memory(store) => store.write().await.replace_elements(canvas_id, elements),
        }
    }

    pub async fn add_shared_user(
        &self,
        canvas_id: Uuid,
        user: &UserRef,
    ) -> Result<Canvas, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::add_shared_user(pool, canvas_id, user.id).await,
            Self::Memory(store) => store.write().await.add_shared_user(canvas_id, user),
        }
    }

    pub async fn remove_shared_user(
        &self,
        canvas_id: Uuid,
        user: &UserRef,
    ) -> Result<Canvas, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::remove_shared_user(pool, canvas_id, user.id).await,
            Self::Memory(store) => store.write().await.remove_shared_user(canvas_id, user),
        }
    }

    pub async fn delete_canvas(&self, canvas_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => postgres::delete_canvas(pool, canvas_id).await,
            Self::Memory(store) => store.write().await.delete_canvas(canvas_id),
        }
    }
}
