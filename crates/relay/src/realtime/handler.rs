use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use easel_common::protocol::realtime::{decode_client_event, encode_server_event, ServerEvent};
use serde::Deserialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{error::RealtimeError, hub::HubHandle};
use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::bearer_token},
    error::{
        current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
        RelayError,
    },
    metrics,
    store::CanvasStore,
};

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Clone)]
pub struct RealtimeRouterState {
    pub hub: HubHandle,
    pub store: CanvasStore,
    pub jwt_service: Arc<JwtAccessTokenService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    token: Option<String>,
}

pub fn router(state: RealtimeRouterState) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Authenticates before upgrading; a failed handshake never reaches the hub.
pub async fn ws_upgrade(
    State(state): State<RealtimeRouterState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&state, &headers, query.token.as_deref()).await {
        Ok(identity) => identity,
        Err(error) => {
            warn!(%error, "realtime handshake rejected");
            return handshake_rejection(&error);
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(hub, identity, socket)).await;
    })
}

async fn authenticate(
    state: &RealtimeRouterState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<String, RealtimeError> {
    let token = bearer_token(headers)
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
        .ok_or(RealtimeError::AuthenticationFailure)?;

    let identity = state
        .jwt_service
        .validate_user_token(token)
        .map_err(|_| RealtimeError::AuthenticationFailure)?;

    match state.store.find_user_by_email(&identity.email).await {
        Ok(Some(user)) => Ok(user.email),
        Ok(None) => Err(RealtimeError::AuthenticationFailure),
        Err(error) => {
            error!(error = %error, "identity lookup failed during handshake");
            Err(RealtimeError::Unavailable)
        }
    }
}

fn handshake_rejection(error: &RealtimeError) -> Response {
    match error {
        RealtimeError::Unavailable => RelayError::from_code(ErrorCode::StoreUnavailable),
        _ => RelayError::new(ErrorCode::AuthInvalidToken, error.to_string()),
    }
    .into_response()
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|error| {
        error!(error = %error, "failed to encode realtime event");
    })?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

async fn send_invalid_request(socket: &mut WebSocket, message: &str) -> Result<(), ()> {
    let event = RealtimeError::InvalidRequest(message.to_owned()).to_event(None);
    send_event(socket, &event).await
}

async fn handle_socket(hub: HubHandle, identity: String, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let connection_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();

    if hub.connect(connection_id, identity.clone(), outbound_sender).await.is_err() {
        error!(connection_id = %connection_id, "realtime hub unavailable, closing connection");
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    info!(
        connection_id = %connection_id,
        identity = %identity,
        request_id = %request_id,
        "realtime connection opened"
    );

    // Ping every interval; a ping left unanswered past the timeout ends the connection.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
    let mut unanswered_ping: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if unanswered_ping.is_some_and(|sent_at| sent_at.elapsed() >= heartbeat_timeout) {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if unanswered_ping.is_none() {
                    unanswered_ping = Some(Instant::now());
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        match decode_client_event(&raw_message) {
                            Ok(event) => {
                                if hub.dispatch(connection_id, event).await.is_err() {
                                    error!(connection_id = %connection_id, "realtime hub stopped");
                                    break;
                                }
                            }
                            Err(error) => {
                                debug!(connection_id = %connection_id, %error, "undecodable frame");
                                metrics::record_realtime_event("invalidFrame", true, 0);
                                if send_invalid_request(&mut socket, "invalid realtime frame payload")
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        metrics::record_realtime_event("invalidFrame", true, 0);
                        if send_invalid_request(&mut socket, "binary frames are not supported")
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        unanswered_ping = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(connection_id).await;
    info!(connection_id = %connection_id, identity = %identity, "realtime connection closed");
}
