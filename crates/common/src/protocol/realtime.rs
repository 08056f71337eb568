// Frame types for the easel realtime canvas channel.

use serde::{Deserialize, Serialize};

use crate::types::Canvas;

/// Frames a client may send once its connection is authenticated.
///
/// `canvasId` is optional on the wire so that a frame with a missing id still
/// decodes and can be answered with a targeted error instead of a decode
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Subscribe to a canvas room and receive its current state.
    JoinCanvas {
        #[serde(rename = "canvasId", default, skip_serializing_if = "Option::is_none")]
        canvas_id: Option<String>,
    },

    /// Leave a canvas room previously joined on this connection.
    LeaveCanvas {
        #[serde(rename = "canvasId", default, skip_serializing_if = "Option::is_none")]
        canvas_id: Option<String>,
    },

    /// Signal that the canvas was persisted and should be re-broadcast.
    UpdateInMemory {
        #[serde(rename = "canvasId", default, skip_serializing_if = "Option::is_none")]
        canvas_id: Option<String>,
    },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinCanvas { .. } => "joinCanvas",
            Self::LeaveCanvas { .. } => "leaveCanvas",
            Self::UpdateInMemory { .. } => "updateInMemory",
        }
    }

    pub fn canvas_id(&self) -> Option<&str> {
        match self {
            Self::JoinCanvas { canvas_id }
            | Self::LeaveCanvas { canvas_id }
            | Self::UpdateInMemory { canvas_id } => canvas_id.as_deref(),
        }
    }
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Room broadcast: the authoritative state of a canvas.
    CanvasUpdated { canvas: Canvas },

    /// Unicast to the originating connection only.
    Error {
        code: String,
        message: String,
        #[serde(rename = "canvasId", default, skip_serializing_if = "Option::is_none")]
        canvas_id: Option<String>,
    },
}

pub fn decode_client_event(raw: &str) -> Result<ClientEvent, serde_json::Error> {
    serde_json::from_str::<ClientEvent>(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
