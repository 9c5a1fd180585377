use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::api::AppState;
use crate::auth;
use crate::error::{AppError, AppResult};
use crate::game::{GameCommand, GameEvent, GameHandle};
use crate::types::*;

type Sender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    match auth::authenticate(&state, &query.token) {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(socket, state, user)),
        Err(e) => e.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: User) {
    let (sender, mut receiver) = socket.split();
    let sender: Sender = Arc::new(Mutex::new(sender));
    let user_id = user.id;
    let conn_id = Uuid::new_v4();

    if state.hub.connect(user_id) {
        tracing::info!("{} is online", user.username);
    }
    tracing::debug!("WebSocket connected: {}", user.username);

    // Room event receivers are subscribed here, before any command reaches the
    // room, and handed to the forwarding task.
    let (room_tx, room_rx) = mpsc::channel::<Option<broadcast::Receiver<GameEvent>>>(8);
    let event_task = tokio::spawn(forward_events(sender.clone(), state.hub.subscribe(), room_rx, user_id));

    let mut current: Option<GameHandle> = None;

    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };

        let client_msg: ClientMsg = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid message from {}: {}", user.username, e);
                send_msg(&sender, &ServerMsg::ErrorMessage {
                    message: "Invalid message".to_string(),
                })
                .await;
                continue;
            }
        };

        if state.store.user(user_id).is_none_or(|u| u.banned) {
            tracing::info!("Closing socket of banned user {}", user.username);
            break;
        }

        match client_msg {
            ClientMsg::AttachRoom { room_id } => {
                let Some(handle) = state.registry.room(room_id) else {
                    send_msg(&sender, &ServerMsg::Reset {
                        message: "Room not found".to_string(),
                    })
                    .await;
                    continue;
                };
                // Subscribe first so nothing after the room's RoomState is missed;
                // the receiver is only handed over once the seat is confirmed.
                let events = handle.event_tx.subscribe();
                if let Err(e) = attach(&handle, user_id, conn_id).await {
                    send_msg(&sender, &ServerMsg::ErrorMessage { message: e.to_string() }).await;
                    continue;
                }
                if let Some(previous) = current.take() {
                    if previous.room_id != room_id {
                        let _ = previous.cmd_tx.send(GameCommand::Disconnect { user_id, conn_id }).await;
                    }
                }
                tracing::debug!("{} attached to {:?} room {}", user.username, handle.kind, room_id);
                let _ = room_tx.send(Some(events)).await;
                state.matchmaker.clear_pending(user_id);
                current = Some(handle);
            }

            ClientMsg::LeaveRoom => {
                if let Some(previous) = current.take() {
                    let _ = previous.cmd_tx.send(GameCommand::Disconnect { user_id, conn_id }).await;
                }
                let _ = room_tx.send(None).await;
            }

            ClientMsg::MakeMove { room_id, cell } => {
                room_command(&state, &sender, room_id, GameCommand::Move { user_id, cell }).await;
            }

            ClientMsg::Resign { room_id } => {
                room_command(&state, &sender, room_id, GameCommand::Resign { user_id }).await;
            }

            ClientMsg::RequestRematch { room_id } => {
                room_command(&state, &sender, room_id, GameCommand::Rematch { user_id }).await;
            }

            ClientMsg::RoomChat { room_id, text } => {
                room_command(&state, &sender, room_id, GameCommand::Chat { user_id, text }).await;
            }

            ClientMsg::Ping => send_msg(&sender, &ServerMsg::Pong).await,
        }
    }

    tracing::debug!("WebSocket disconnected: {}", user.username);
    event_task.abort();

    if state.hub.disconnect(user_id) {
        tracing::info!("{} is offline", user.username);
    }
    if let Some(handle) = current {
        let _ = handle.cmd_tx.send(GameCommand::Disconnect { user_id, conn_id }).await;
    }
}

async fn attach(handle: &GameHandle, user_id: Uuid, conn_id: Uuid) -> AppResult<()> {
    let (reply, rx) = oneshot::channel();
    handle
        .cmd_tx
        .send(GameCommand::Attach { user_id, conn_id, reply })
        .await
        .map_err(|_| AppError::not_found("Room not found"))?;
    rx.await.map_err(|_| AppError::not_found("Room not found"))?
}

async fn room_command(state: &AppState, sender: &Sender, room_id: Uuid, cmd: GameCommand) {
    match state.registry.room(room_id) {
        Some(handle) => {
            let _ = handle.cmd_tx.send(cmd).await;
        }
        None => {
            send_msg(sender, &ServerMsg::ErrorMessage {
                message: "Room not found".to_string(),
            })
            .await;
        }
    }
}

async fn next_room_event(rx: &mut Option<broadcast::Receiver<GameEvent>>) -> Result<GameEvent, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forward hub notifications and current-room events for `user_id`.
async fn forward_events(
    sender: Sender,
    mut hub_rx: broadcast::Receiver<crate::hub::UserEvent>,
    mut room_rx: mpsc::Receiver<Option<broadcast::Receiver<GameEvent>>>,
    user_id: Uuid,
) {
    let mut room_events: Option<broadcast::Receiver<GameEvent>> = None;

    loop {
        tokio::select! {
            event = hub_rx.recv() => match event {
                Ok(event) if event.user_id == user_id => {
                    if !try_send(&sender, &event.msg).await {
                        return;
                    }
                    if event.close {
                        let _ = sender.lock().await.close().await;
                        return;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            },
            next = room_rx.recv() => match next {
                Some(rx) => room_events = rx,
                None => return,
            },
            event = next_room_event(&mut room_events) => match event {
                Ok(event) => {
                    if let Some(msg) = event.message_for(user_id) {
                        if !try_send(&sender, msg).await {
                            return;
                        }
                    }
                    if matches!(event, GameEvent::Close { .. }) {
                        room_events = None;
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Socket for {} lagged {} room events", user_id, n),
                Err(RecvError::Closed) => room_events = None,
            },
        }
    }
}

async fn try_send(sender: &Sender, msg: &ServerMsg) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.lock().await.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode message: {}", e);
            true
        }
    }
}

async fn send_msg(sender: &Sender, msg: &ServerMsg) {
    let _ = try_send(sender, msg).await;
}
