use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::hub::RealtimeHub;
use crate::room::derive_room_id;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh connection gets to present a valid Identify token.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one WebSocket connection through its lifecycle:
/// Connecting -> Authenticated -> Subscribed -> Closed.
///
/// Authentication happens in-band: the first command must be Identify with a
/// token in the identity provider's format. Unauthenticated connections are
/// never admitted to any room.
pub async fn handle_connection(socket: WebSocket, hub: RealtimeHub, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let (user_id, username) = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            let err = GatewayEvent::Error {
                message: "Unauthorized: missing or invalid token".into(),
            };
            let _ = sender
                .send(Message::Text(serde_json::to_string(&err).unwrap().into()))
                .await;
            return;
        }
    };

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Presence snapshot: who is already online. Taken before we register so
    // the client never sees itself in the list.
    let existing = hub.online_users().await;
    for (uid, uname) in &existing {
        let event = GatewayEvent::UserOnline {
            user_id: *uid,
            username: uname.clone(),
        };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    // Admit: joins the personal room and announces userOnline to others
    let (conn_id, mut event_rx) = hub.register(user_id, &username).await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward hub events to the client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client
    let hub_recv = hub.clone();
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&hub_recv, conn_id, user_id, &username_recv, cmd).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            truncate_for_log(&text, 200)
                        );
                        hub_recv
                            .send_to_conn(
                                conn_id,
                                GatewayEvent::Error {
                                    message: format!("Unrecognized command: {}", e),
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever side finishes first tears the other down
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.unregister(user_id, conn_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use parley_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn handle_command(
    hub: &RealtimeHub,
    conn_id: Uuid,
    user_id: Uuid,
    username: &str,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled

        GatewayCommand::JoinRoom { room_id } => {
            info!("{} ({}) joined room {}", username, user_id, room_id);
            hub.join_room(&room_id, conn_id).await;
            hub.broadcast_to_room_except(
                &room_id,
                conn_id,
                GatewayEvent::UserJoined {
                    user_id,
                    username: username.to_string(),
                    room_id: room_id.clone(),
                },
            )
            .await;
        }

        GatewayCommand::LeaveRoom { room_id } => {
            info!("{} ({}) left room {}", username, user_id, room_id);
            hub.leave_room(&room_id, conn_id).await;
            hub.broadcast_to_room(
                &room_id,
                GatewayEvent::UserLeft {
                    user_id,
                    username: username.to_string(),
                    room_id: room_id.clone(),
                },
            )
            .await;
        }

        GatewayCommand::Typing { chat_id, to } => {
            let Some(room_id) = resolve_room(chat_id, to, user_id) else {
                warn!("{} ({}) typing with no address", username, user_id);
                return;
            };
            hub.broadcast_to_room_except(
                &room_id,
                conn_id,
                GatewayEvent::UserTyping {
                    user_id,
                    username: username.to_string(),
                    room_id: room_id.clone(),
                },
            )
            .await;
        }

        GatewayCommand::StopTyping { chat_id, to } => {
            let Some(room_id) = resolve_room(chat_id, to, user_id) else {
                warn!("{} ({}) stopTyping with no address", username, user_id);
                return;
            };
            hub.broadcast_to_room_except(
                &room_id,
                conn_id,
                GatewayEvent::UserStoppedTyping {
                    user_id,
                    username: username.to_string(),
                    room_id: room_id.clone(),
                },
            )
            .await;
        }
    }
}

/// Typing commands address either a conversation room or a peer user.
fn resolve_room(chat_id: Option<String>, to: Option<Uuid>, me: Uuid) -> Option<String> {
    match (chat_id, to) {
        (Some(id), _) => Some(id),
        (None, Some(other)) => Some(derive_room_id(None, me, other)),
        (None, None) => None,
    }
}

/// Cap client-supplied text for logging without splitting a UTF-8
/// character. A byte-range slice would panic when `max` lands inside a
/// multibyte character.
fn truncate_for_log(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_for_log("hello", 200), "hello");
    }

    #[test]
    fn truncation_backs_off_to_a_char_boundary() {
        // 199 ASCII bytes, then a 2-byte character straddling offset 200
        let mut raw = "x".repeat(199);
        raw.push('é');
        raw.push_str("tail");

        let cut = truncate_for_log(&raw, 200);
        assert_eq!(cut, "x".repeat(199));
        assert_eq!(cut.len(), 199);
    }

    #[test]
    fn exact_boundary_keeps_the_full_prefix() {
        let raw = "ab".repeat(100); // 200 bytes exactly
        assert_eq!(truncate_for_log(&raw, 200), raw);
    }
}
