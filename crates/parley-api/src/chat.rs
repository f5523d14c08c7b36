use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use parley_db::models::{ConversationSummaryRow, MessageRow};
use parley_types::api::{
    Claims, ConversationResponse, ConversationSummary, CreateConversationRequest,
    MessageResponse, SendMessageRequest, UnreadCountResponse,
};
use parley_types::events::GatewayEvent;

use crate::AppState;
use crate::error::ApiError;

/// Maximum message length in characters, after trimming.
const MAX_TEXT_LEN: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor-based pagination — pass the `created_at` of the oldest
    /// message from the previous page to fetch older messages.
    pub before: Option<String>,
}

/// POST /messages/send — durable write first, live delivery second.
///
/// The conversation is created lazily on first contact. The broadcast is
/// best-effort: by the time it runs the write has committed, so a client
/// that misses the event still finds the message on its next fetch.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let text = req.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::Validation("Message text cannot be empty".into()));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(ApiError::Validation(format!(
            "Message text exceeds {} characters",
            MAX_TEXT_LEN
        )));
    }
    if req.receiver_id == claims.sub {
        return Err(ApiError::Validation(
            "Cannot start a conversation with yourself".into(),
        ));
    }

    // Run the blocking transactional write off the async runtime
    let db = state.clone();
    let sender_id = claims.sub.to_string();
    let receiver_id = req.receiver_id.to_string();
    let stored_text = text.clone();
    let row = tokio::task::spawn_blocking(move || {
        db.db.store_direct_message(&sender_id, &receiver_id, &stored_text)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Store(anyhow::anyhow!("task join error: {}", e))
    })??;

    let message = message_response(row);

    // Live delivery: conversation room plus the receiver's personal room.
    // Clients may get the event twice; they dedupe by message id.
    let event = GatewayEvent::NewMessage {
        message: message.clone(),
    };
    state
        .hub
        .broadcast_to_room(&message.conversation_id.to_string(), event.clone())
        .await;
    state.hub.broadcast_to_user(req.receiver_id, event).await;

    Ok((StatusCode::CREATED, Json(message)))
}

/// GET /messages/{conversation_id} — full history, chronological.
/// Non-participants get 404: the conversation does not exist for them.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let limit = query.limit.map(|l| l.min(200));
    let before = query.before;

    let rows = tokio::task::spawn_blocking(move || {
        if db.db.conversation_for_participant(&cid, &uid)?.is_none() {
            return Ok(None);
        }
        db.db.list_messages(&cid, limit, before.as_deref()).map(Some)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Store(anyhow::anyhow!("task join error: {}", e))
    })??
    .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;

    let messages: Vec<MessageResponse> = rows.into_iter().map(message_response).collect();
    Ok(Json(messages))
}

/// POST /messages/read/{conversation_id} — mark everything from the other
/// participant as seen. Idempotent.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();

    let marked = tokio::task::spawn_blocking(move || {
        if db.db.conversation_for_participant(&cid, &uid)?.is_none() {
            return Ok(None);
        }
        db.db.mark_seen(&cid, &uid).map(Some)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ApiError::Store(anyhow::anyhow!("task join error: {}", e))
    })??
    .ok_or_else(|| ApiError::NotFound("Conversation not found".into()))?;

    tracing::debug!(
        "{} marked {} messages seen in {}",
        claims.sub,
        marked,
        conversation_id
    );
    Ok(Json(json!({})))
}

/// GET /messages/unread — derived aggregate, consistent with any
/// mark-as-read this user already performed.
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let uid = claims.sub.to_string();

    let count = tokio::task::spawn_blocking(move || db.db.unread_count(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Store(anyhow::anyhow!("task join error: {}", e))
        })??;

    Ok(Json(UnreadCountResponse { count }))
}

/// GET /conversations — inbox, most recently active first.
pub async fn get_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.clone();
    let uid = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.db.list_conversations(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Store(anyhow::anyhow!("task join error: {}", e))
        })??;

    let summaries: Vec<ConversationSummary> = rows.into_iter().map(summary_response).collect();
    Ok(Json(summaries))
}

/// POST /conversations — explicit find-or-create without sending anything.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.receiver_id == claims.sub {
        return Err(ApiError::Validation(
            "Cannot start a conversation with yourself".into(),
        ));
    }

    let db = state.clone();
    let a = claims.sub.to_string();
    let b = req.receiver_id.to_string();
    let row = tokio::task::spawn_blocking(move || db.db.get_or_create_conversation(&a, &b))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Store(anyhow::anyhow!("task join error: {}", e))
        })??;

    Ok(Json(ConversationResponse {
        id: parse_uuid(&row.id, "conversation id"),
        participants: [
            parse_uuid(&row.user_a, "participant"),
            parse_uuid(&row.user_b, "participant"),
        ],
        created_at: parse_ts(&row.created_at),
        updated_at: parse_ts(&row.updated_at),
    }))
}

// -- Read-side shaping --

fn message_response(row: MessageRow) -> MessageResponse {
    MessageResponse {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation id"),
        sender_id: parse_uuid(&row.sender_id, "sender id"),
        sender_username: row.sender_username,
        sender_avatar_url: row.sender_avatar_url,
        text: row.text,
        seen: row.seen,
        created_at: parse_ts(&row.created_at),
    }
}

fn summary_response(row: ConversationSummaryRow) -> ConversationSummary {
    ConversationSummary {
        id: parse_uuid(&row.id, "conversation id"),
        other_user_id: parse_uuid(&row.other_user_id, "user id"),
        other_username: row.other_username,
        other_avatar_url: row.other_avatar_url,
        last_message: row.last_message.map(message_response),
        updated_at: parse_ts(&row.updated_at),
    }
}

fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

fn parse_ts(raw: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') default is "YYYY-MM-DD HH:MM:SS"
            // without timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            chrono::DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppStateInner;
    use parley_db::Database;
    use parley_gateway::hub::RealtimeHub;
    use std::sync::Arc;

    fn test_state() -> AppState {
        Arc::new(AppStateInner {
            db: Database::open_in_memory().unwrap(),
            jwt_secret: "test-secret".into(),
            hub: RealtimeHub::new(),
        })
    }

    fn claims_for(id: Uuid, username: &str) -> Claims {
        Claims {
            sub: id,
            username: username.into(),
            avatar_url: None,
            exp: usize::MAX,
        }
    }

    fn send_req(receiver_id: Uuid, text: &str) -> SendMessageRequest {
        SendMessageRequest {
            receiver_id,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn whitespace_text_is_rejected_with_no_side_effects() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let result = send_message(
            State(state.clone()),
            Extension(claims_for(alice, "alice")),
            Json(send_req(bob, "   \n\t ")),
        )
        .await;

        assert!(matches!(result, Err(ApiError::Validation(_))));
        assert!(state.db.list_conversations(&alice.to_string()).unwrap().is_empty());
        assert_eq!(state.db.unread_count(&bob.to_string()).unwrap(), 0);
    }

    #[tokio::test]
    async fn oversized_text_is_rejected() {
        let state = test_state();
        let result = send_message(
            State(state),
            Extension(claims_for(Uuid::new_v4(), "alice")),
            Json(send_req(Uuid::new_v4(), &"x".repeat(MAX_TEXT_LEN + 1))),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn self_messaging_is_rejected() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let result = send_message(
            State(state),
            Extension(claims_for(alice, "alice")),
            Json(send_req(alice, "hi me")),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn first_send_creates_conversation_and_delivers_live() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        state.db.upsert_user(&alice.to_string(), "alice", None).unwrap();

        // Bob is connected; his personal room is joined on register
        let (_conn, mut bob_rx) = state.hub.register(bob, "bob").await;

        send_message(
            State(state.clone()),
            Extension(claims_for(alice, "alice")),
            Json(send_req(bob, "hi")),
        )
        .await
        .expect("send should succeed");

        // Durable effects
        let inbox = state.db.list_conversations(&alice.to_string()).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(state.db.unread_count(&bob.to_string()).unwrap(), 1);
        assert_eq!(state.db.unread_count(&alice.to_string()).unwrap(), 0);

        // Live delivery to the receiver's personal room
        match bob_rx.recv().await {
            Some(GatewayEvent::NewMessage { message }) => {
                assert_eq!(message.text, "hi");
                assert_eq!(message.sender_username, "alice");
                assert!(!message.seen);
            }
            other => panic!("expected newMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_participant_gets_not_found() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        let row = state
            .db
            .store_direct_message(&alice.to_string(), &bob.to_string(), "private")
            .unwrap();
        let conversation_id: Uuid = row.conversation_id.parse().unwrap();

        let result = get_messages(
            State(state.clone()),
            Path(conversation_id),
            Query(MessageQuery { limit: None, before: None }),
            Extension(claims_for(carol, "carol")),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));

        let result = mark_read(
            State(state),
            Path(conversation_id),
            Extension(claims_for(carol, "carol")),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn mark_read_clears_unread_through_the_api() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let row = state
            .db
            .store_direct_message(&alice.to_string(), &bob.to_string(), "hello")
            .unwrap();
        let conversation_id: Uuid = row.conversation_id.parse().unwrap();
        assert_eq!(state.db.unread_count(&bob.to_string()).unwrap(), 1);

        mark_read(
            State(state.clone()),
            Path(conversation_id),
            Extension(claims_for(bob, "bob")),
        )
        .await
        .expect("mark_read should succeed");

        assert_eq!(state.db.unread_count(&bob.to_string()).unwrap(), 0);
        let messages = state.db.list_messages(&row.conversation_id, None, None).unwrap();
        assert!(messages[0].seen);
    }

    #[tokio::test]
    async fn explicit_get_or_create_converges() {
        let state = test_state();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        create_conversation(
            State(state.clone()),
            Extension(claims_for(alice, "alice")),
            Json(CreateConversationRequest { receiver_id: bob }),
        )
        .await
        .expect("create should succeed");

        // Opposite direction resolves to the same conversation
        create_conversation(
            State(state.clone()),
            Extension(claims_for(bob, "bob")),
            Json(CreateConversationRequest { receiver_id: alice }),
        )
        .await
        .expect("create should succeed");

        assert_eq!(state.db.list_conversations(&alice.to_string()).unwrap().len(), 1);
    }
}
