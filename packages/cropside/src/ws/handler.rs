//! WebSocket connection handler.
//!
//! One task group per connection: a sender draining the reply channel into
//! the socket, a pump forwarding session events from the registry outbox,
//! and the input loop dispatching client messages. The connection dies when
//! any of them ends; cleanup then unbinds the user from every session this
//! socket joined.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{sink::SinkExt, stream::StreamExt};
use std::collections::HashSet;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use cropside_core::{
    Outbox, Participant, Recommendation, Role, SessionEvent, WorkspaceEventKind, assess,
    new_session_id,
};

use super::protocol::{ClientMessage, NegotiationOutcome, ServerMessage, WsUser};
use crate::AppState;

/// Axum upgrade handler for `GET /ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one client connection from handshake to cleanup.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    state.metrics.connection_opened();
    let socket_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Handshake: the first frame must be hello. The token is issued and
    // verified upstream; the coordination server binds the identity it names.
    let user = match await_hello(&mut ws_receiver).await {
        Some(user) => user,
        None => {
            state.metrics.handshake_failed();
            state.metrics.connection_closed();
            let reject = ServerMessage::error("handshake-required", "first frame must be hello");
            if let Ok(json) = serde_json::to_string(&reject) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            return;
        }
    };
    info!(socket = %socket_id, user = %user.user_id, "connection identified");

    // Reply channel for this connection plus the registry-facing outbox.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(256);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<SessionEvent>(256);

    let _ = tx
        .send(ServerMessage::Welcome {
            socket_id: socket_id.clone(),
        })
        .await;

    // Sessions this socket has joined, for disconnect cleanup.
    let joined: Mutex<HashSet<String>> = Mutex::new(HashSet::new());

    let metrics_sender = state.metrics.clone();
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize server message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
            metrics_sender.message_sent();
        }
    };

    let tx_events = tx.clone();
    let event_pump_task = async move {
        while let Some(event) = outbox_rx.recv().await {
            if tx_events.send(ServerMessage::from(event)).await.is_err() {
                break;
            }
        }
    };

    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    state.metrics.message_received();
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => {
                            dispatch(
                                &state, &user, &socket_id, &tx, &outbox_tx, &joined, client_msg,
                            )
                            .await;
                        }
                        Err(e) => {
                            debug!(socket = %socket_id, "unparseable client message: {}", e);
                            let _ = tx
                                .send(ServerMessage::error("invalid-message", e.to_string()))
                                .await;
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(socket = %socket_id, "client closed connection");
                    break;
                }
                Err(e) => {
                    debug!(socket = %socket_id, "websocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("sender task ended"),
        _ = event_pump_task => debug!("event pump ended"),
        _ = input_task => debug!("input task ended"),
    }

    // Unbind from every joined session, but only where this socket still
    // holds the binding; a newer connection of the same user keeps its seat.
    let sessions: Vec<String> = joined.lock().await.drain().collect();
    for session_id in sessions {
        let still_bound = state
            .registry
            .get_session(&session_id)
            .await
            .map(|s| {
                s.participants
                    .iter()
                    .any(|p| p.user_id == user.user_id && p.socket_id == socket_id)
            })
            .unwrap_or(false);
        if still_bound {
            state
                .registry
                .remove_participant(&session_id, &user.user_id)
                .await;
        }
    }

    state.metrics.connection_closed();
    info!(socket = %socket_id, user = %user.user_id, "connection closed");
}

/// Read frames until the hello arrives. Anything else first, or a closed
/// socket, fails the handshake.
async fn await_hello(
    ws_receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<WsUser> {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Hello {
                        token,
                        user_id,
                        display_name,
                    }) if !token.is_empty() && !user_id.is_empty() => Some(WsUser {
                        user_id,
                        display_name,
                    }),
                    _ => None,
                };
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            // Ping/pong before the handshake is fine.
            _ => {}
        }
    }
    None
}

async fn dispatch(
    state: &AppState,
    user: &WsUser,
    socket_id: &str,
    tx: &mpsc::Sender<ServerMessage>,
    outbox: &Outbox,
    joined: &Mutex<HashSet<String>>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Hello { .. } => {
            let _ = tx
                .send(ServerMessage::error(
                    "already-identified",
                    "hello is only valid as the first frame",
                ))
                .await;
        }

        ClientMessage::CreateSession { title } => {
            let session_id = new_session_id();
            match state
                .registry
                .create_session(&session_id, &title, &user.user_id)
                .await
            {
                Ok(session) => {
                    let _ = tx.send(ServerMessage::SessionCreated { session }).await;
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
                }
            }
        }

        ClientMessage::JoinSession { session_id, role } => {
            let role = match role {
                Some(role) => role,
                None => match state.registry.get_session(&session_id).await {
                    Some(s) if s.creator_id == user.user_id => Role::Creator,
                    _ => Role::Expert,
                },
            };
            let participant = Participant {
                user_id: user.user_id.clone(),
                socket_id: socket_id.to_string(),
                role,
                joined_at: Utc::now(),
            };
            match state
                .registry
                .add_participant(&session_id, participant, outbox.clone())
                .await
            {
                Ok(session) => {
                    joined.lock().await.insert(session_id);
                    let _ = tx.send(ServerMessage::SessionState { session }).await;
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
                }
            }
        }

        ClientMessage::LeaveSession { session_id } => {
            joined.lock().await.remove(&session_id);
            state
                .registry
                .remove_participant(&session_id, &user.user_id)
                .await;
        }

        ClientMessage::WorkspaceUpdate {
            session_id,
            kind,
            data,
        } => {
            if !joined.lock().await.contains(&session_id) {
                let _ = tx
                    .send(ServerMessage::error(
                        "not-joined",
                        "join the session before updating the workspace",
                    ))
                    .await;
                return;
            }
            if let Err(e) = state
                .broadcaster
                .publish(&session_id, &user.user_id, kind, data)
                .await
            {
                let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
            }
        }

        ClientMessage::AddRecommendation {
            session_id,
            recommendation,
        } => {
            if recommendation.id.is_empty()
                || !(0.0..=1.0).contains(&recommendation.confidence)
            {
                let _ = tx
                    .send(ServerMessage::error(
                        "invalid-recommendation",
                        "recommendation needs a non-empty id and confidence in [0, 1]",
                    ))
                    .await;
                return;
            }
            let rec = Recommendation {
                id: recommendation.id,
                expert_id: user.user_id.clone(),
                title: recommendation.title,
                description: recommendation.description,
                confidence: recommendation.confidence,
                created_at: Utc::now(),
                metadata: recommendation.metadata,
            };
            match state.registry.add_recommendation(&session_id, &rec).await {
                Ok(stored) => {
                    // Share the stored copy with the rest of the workspace.
                    if let Ok(data) = serde_json::to_value(&stored) {
                        if let Err(e) = state
                            .broadcaster
                            .publish(
                                &session_id,
                                &user.user_id,
                                WorkspaceEventKind::Recommendation,
                                data,
                            )
                            .await
                        {
                            debug!(session = %session_id, "recommendation broadcast skipped: {}", e);
                        }
                    }
                    let _ = tx
                        .send(ServerMessage::RecommendationAdded {
                            session_id,
                            recommendation: stored,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
                }
            }
        }

        ClientMessage::Offer {
            session_id,
            target,
            payload,
            quality,
        } => {
            match state
                .coordinator
                .relay_offer(&session_id, &user.user_id, &target, payload, quality.as_ref())
                .await
            {
                Ok(Some(profile)) => {
                    let _ = tx.send(ServerMessage::MediaProfile { profile }).await;
                }
                Ok(None) => {}
                Err(e) => {
                    let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
                }
            }
        }

        ClientMessage::Answer {
            session_id,
            target,
            payload,
        } => {
            if let Err(e) = state
                .coordinator
                .relay_answer(&session_id, &user.user_id, &target, payload)
                .await
            {
                let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
            }
        }

        ClientMessage::IceCandidate {
            session_id,
            target,
            payload,
        } => {
            if let Err(e) = state
                .coordinator
                .relay_candidate(&session_id, &user.user_id, &target, payload)
                .await
            {
                let _ = tx.send(ServerMessage::error(e.code(), e.to_string())).await;
            }
        }

        ClientMessage::QualityCheck { metrics } => {
            let _ = tx
                .send(ServerMessage::MediaProfile {
                    profile: assess(&metrics),
                })
                .await;
        }

        ClientMessage::NegotiationResult {
            session_id,
            target,
            outcome,
            reason,
        } => match outcome {
            NegotiationOutcome::Connected => {
                state
                    .coordinator
                    .mark_connected(&session_id, &user.user_id, &target)
                    .await;
            }
            NegotiationOutcome::Failed => {
                let reason = reason.unwrap_or_else(|| "negotiation failed".to_string());
                let options = state
                    .coordinator
                    .mark_failed(&session_id, &user.user_id, &target, &reason)
                    .await;
                let _ = tx
                    .send(ServerMessage::FallbackOptions {
                        session_id,
                        peer: target,
                        options,
                        reason,
                    })
                    .await;
            }
        },
    }
}
