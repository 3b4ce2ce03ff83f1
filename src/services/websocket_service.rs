//! WebSocket connection router.
//!
//! One task per connection. The first frame must identify the player; every
//! later frame is parsed, validated, and forwarded to the target room's
//! mailbox together with this connection's outbound sink. The router holds no
//! game state: rooms are the only writers, connections only carry frames.

use std::{collections::HashSet, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dto::ws::{ClientMessage, Envelope, ServerEvent},
    engine::{ClientAction, EventSink, RoomCommand, room::PlayerIdentity},
    error::GameError,
    state::SharedState,
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle the full lifecycle of one game WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Envelope>();

    // Dedicated writer task: serializes envelopes and keeps outbound frames
    // flowing even while we await inbound ones.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = event_rx.recv().await {
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound frame");
                    continue;
                }
            };
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, event_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            finalize(writer_task, event_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, event_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("websocket identification timed out");
            finalize(writer_task, event_tx).await;
            return;
        }
    };

    let identity = match identify(&initial_message) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "websocket identification failed");
            send_error(&event_tx, &err);
            finalize(writer_task, event_tx).await;
            return;
        }
    };

    info!(user = %identity.id, name = %identity.name, guest = identity.guest, "player connected");

    let mut joined_rooms: HashSet<String> = HashSet::new();

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::from_json_str(&text) {
                Ok(message) => {
                    route_message(&state, &identity, message, &event_tx, &mut joined_rooms);
                }
                Err(err) => {
                    send_error(&event_tx, &err);
                }
            },
            Ok(Message::Ping(_)) => {
                // axum replies to pings at the protocol level.
            }
            Ok(Message::Close(_)) => {
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(user = %identity.id, error = %err, "websocket error");
                break;
            }
        }
    }

    // The transport is gone: every joined room re-evaluates its roster.
    for room_id in &joined_rooms {
        if let Some(handle) = state.registry().get(room_id) {
            handle.send(RoomCommand::Disconnect {
                user_id: identity.id,
            });
        }
    }
    info!(user = %identity.id, "player disconnected");

    finalize(writer_task, event_tx).await;
}

/// Resolve the connection identity from the mandatory first frame.
fn identify(raw: &str) -> Result<PlayerIdentity, GameError> {
    match ClientMessage::from_json_str(raw)? {
        ClientMessage::Identify {
            name,
            user_id,
            avatar,
            guest,
        } => {
            let minted = user_id.is_none();
            Ok(PlayerIdentity {
                id: user_id.unwrap_or_else(Uuid::new_v4),
                name: name.trim().to_string(),
                avatar,
                guest: guest || minted,
            })
        }
        _ => Err(GameError::Validation(
            "first message must identify the player".to_string(),
        )),
    }
}

/// Dispatch one validated message to its target room.
fn route_message(
    state: &SharedState,
    identity: &PlayerIdentity,
    message: ClientMessage,
    sink: &EventSink,
    joined_rooms: &mut HashSet<String>,
) {
    match message {
        ClientMessage::Identify { .. } => {
            warn!(user = %identity.id, "ignoring duplicate identification message");
        }
        ClientMessage::JoinRoom {
            room_id,
            password,
            settings,
        } => {
            let settings = settings.unwrap_or_default().into_settings();
            // A handle goes stale if the actor shut down between lookup and
            // send; the actor deregisters before dropping its mailbox, so one
            // retry re-creates the room and reaches a live actor.
            let mut delivered = false;
            for _ in 0..2 {
                let handle = match state.registry().get_or_create(&room_id, settings.clone()) {
                    Ok(handle) => handle,
                    Err(err) => {
                        send_error(sink, &err);
                        return;
                    }
                };
                if handle.send(RoomCommand::Action {
                    actor: identity.clone(),
                    action: ClientAction::Join {
                        password: password.clone(),
                    },
                    sink: sink.clone(),
                }) {
                    delivered = true;
                    break;
                }
            }
            if delivered {
                joined_rooms.insert(room_id);
            } else {
                send_error(sink, &GameError::RoomNotFound(room_id));
            }
        }
        ClientMessage::LeaveRoom { room_id } => {
            joined_rooms.remove(&room_id);
            forward(state, identity, &room_id, ClientAction::Leave, sink);
        }
        ClientMessage::ToggleReady { room_id } => {
            forward(state, identity, &room_id, ClientAction::ToggleReady, sink);
        }
        ClientMessage::FlipCard { room_id, card_id } => {
            forward(state, identity, &room_id, ClientAction::Flip { card_id }, sink);
        }
        ClientMessage::UsePowerup {
            room_id,
            power_up,
            targets,
        } => {
            forward(
                state,
                identity,
                &room_id,
                ClientAction::UsePowerUp {
                    kind: power_up,
                    targets,
                },
                sink,
            );
        }
        ClientMessage::SendChat { room_id, text } => {
            forward(state, identity, &room_id, ClientAction::Chat { text }, sink);
        }
        ClientMessage::GetGameState { room_id } => {
            forward(state, identity, &room_id, ClientAction::Resync, sink);
        }
        // from_json_str already rejects unknown types.
        ClientMessage::Unknown => {}
    }
}

/// Forward an action to an existing room, or reject when it does not exist.
fn forward(
    state: &SharedState,
    identity: &PlayerIdentity,
    room_id: &str,
    action: ClientAction,
    sink: &EventSink,
) {
    match state.registry().get(room_id) {
        Some(handle) => {
            handle.send(RoomCommand::Action {
                actor: identity.clone(),
                action,
                sink: sink.clone(),
            });
        }
        None => {
            send_error(sink, &GameError::RoomNotFound(room_id.to_string()));
        }
    }
}

/// Connection-level rejection; carries seq 0 because no room is involved.
fn send_error(sink: &EventSink, err: &GameError) {
    let _ = sink.send(Envelope {
        seq: 0,
        event: ServerEvent::error(err),
    });
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, event_tx: mpsc::UnboundedSender<Envelope>) {
    drop(event_tx);
    let _ = writer_task.await;
}
