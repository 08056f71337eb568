pub mod broadcast;
pub mod error;
pub mod guard;
pub mod handler;
pub mod hub;
pub mod lifecycle;
pub mod registry;

pub use handler::{router, RealtimeRouterState};
pub use hub::{spawn_hub, HubHandle};

/// Identifies one realtime connection for its whole lifetime.
pub type ConnectionId = uuid::Uuid;
