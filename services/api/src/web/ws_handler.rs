//! services/api/src/web/ws_handler.rs
//!
//! WebSocket entry point for live challenge leaderboards. A connection
//! watches at most one challenge at a time and receives a fresh ranking
//! whenever a member of that challenge changes.

use crate::web::{
    protocol::{ranked_entries, ClientMessage, ServerMessage},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use chrono::{DateTime, Utc};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use plantgo_core::domain::LeaderboardSnapshot;
use plantgo_core::error::GameError;
use plantgo_core::leaderboard::LeaderboardSubscription;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSender = SplitSink<WebSocket, Message>;

/// The challenge a connection is currently watching.
struct Watched {
    challenge_id: Uuid,
    end_at: DateTime<Utc>,
    subscription: LeaderboardSubscription,
}

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: Uuid) {
    info!(user_id = %user_id, "Leaderboard socket opened.");
    let (mut sender, mut receiver) = socket.split();
    let mut watched: Option<Watched> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_text_message(text.as_str(), &app_state, &mut watched).await;
                    if let Some(reply) = reply {
                        if !send(&mut sender, &reply).await {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(user_id = %user_id, "Client closed the socket.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(user_id = %user_id, "WebSocket receive failed: {}", e);
                    break;
                }
            },
            snapshot = next_snapshot(&mut watched), if watched.is_some() => match snapshot {
                Some(snapshot) => {
                    let Some(current) = watched.as_ref() else { continue };
                    let message = leaderboard_message(current, &snapshot);
                    if !send(&mut sender, &message).await {
                        break;
                    }
                }
                None => {
                    // Hub dropped the channel; the client may subscribe again.
                    watched = None;
                }
            },
        }
    }

    if let Some(current) = watched {
        current.subscription.unsubscribe();
    }
    info!(user_id = %user_id, "Leaderboard socket closed.");
}

async fn next_snapshot(watched: &mut Option<Watched>) -> Option<Arc<LeaderboardSnapshot>> {
    match watched {
        Some(current) => current.subscription.next().await,
        None => std::future::pending().await,
    }
}

fn leaderboard_message(current: &Watched, snapshot: &LeaderboardSnapshot) -> ServerMessage {
    ServerMessage::Leaderboard {
        challenge_id: current.challenge_id,
        end_at: current.end_at,
        ended: Utc::now() >= current.end_at,
        entries: ranked_entries(snapshot),
    }
}

/// Applies one client message and returns the reply to send, if any.
async fn handle_text_message(
    text: &str,
    app_state: &Arc<AppState>,
    watched: &mut Option<Watched>,
) -> Option<ServerMessage> {
    let client_msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Failed to deserialize client message: {}", e);
            return Some(ServerMessage::Error {
                message: "Unrecognised message.".to_string(),
            });
        }
    };

    match client_msg {
        ClientMessage::Subscribe { challenge_id } => {
            let challenge = match app_state.game.challenge(challenge_id).await {
                Ok(challenge) => challenge,
                Err(e) => {
                    if !matches!(e, GameError::NotFound) {
                        error!(challenge_id = %challenge_id, "Failed to load challenge: {}", e);
                    }
                    return Some(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            };
            let subscription = match app_state.game.leaderboards.subscribe(challenge_id).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(challenge_id = %challenge_id, "Failed to subscribe: {}", e);
                    return Some(ServerMessage::Error {
                        message: "Leaderboard unavailable. Try again.".to_string(),
                    });
                }
            };
            if let Some(previous) = watched.replace(Watched {
                challenge_id,
                end_at: challenge.end_at,
                subscription,
            }) {
                previous.subscription.unsubscribe();
            }
            debug!(challenge_id = %challenge_id, "Leaderboard subscription started.");
            // The first snapshot arrives through the select loop.
            None
        }
        ClientMessage::Unsubscribe => match watched.take() {
            Some(previous) => {
                previous.subscription.unsubscribe();
                Some(ServerMessage::Unsubscribed {
                    challenge_id: previous.challenge_id,
                })
            }
            None => None,
        },
    }
}

/// Serializes and sends one message. Returns `false` once the socket is gone.
async fn send(sender: &mut WsSender, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}
