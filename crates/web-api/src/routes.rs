use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use application::{
    ChatDto, MessageDto, MessagePage, SendTextRequest, SendVoiceRequest, SentMessage,
};
use domain::{ChatId, MessageId, UserId};

use crate::{auth::CurrentUser, error::ApiError, state::AppState, ws_connection};

/// multipart 编码本身占用的额外空间
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Deserialize, Validate)]
struct TextMessagePayload {
    #[validate(length(min = 1, max = 4000))]
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    message: &'static str,
    id: Uuid,
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.settings.max_upload_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_connection::websocket_upgrade))
        .nest("/api", api_routes(upload_limit))
        .with_state(state)
}

fn api_routes(upload_limit: usize) -> Router<AppState> {
    Router::new()
        .route("/chats", get(list_chats))
        .route("/chats/{id}/chat", get(get_or_create_chat))
        .route("/chats/{id}/messages", get(list_messages))
        .route("/chats/{id}/text", post(send_text))
        .route(
            "/chats/{id}/voice",
            post(send_voice).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/chats/messages/{message_id}", delete(delete_message))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_chats(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<ChatDto>>, ApiError> {
    let chats = state.chat_service.list_chats(user.user_id).await?;
    Ok(Json(chats.iter().map(ChatDto::from).collect()))
}

async fn get_or_create_chat(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(friend_id): Path<Uuid>,
) -> Result<Json<ChatDto>, ApiError> {
    let chat = state
        .chat_service
        .get_or_create_chat(user.user_id, UserId::from(friend_id))
        .await?;
    Ok(Json(ChatDto::from(&chat)))
}

async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageDto>>, ApiError> {
    let messages = state
        .chat_service
        .list_messages(
            ChatId::from(chat_id),
            user.user_id,
            MessagePage {
                page: query.page,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(messages.iter().map(MessageDto::from).collect()))
}

async fn send_text(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(chat_id): Path<Uuid>,
    Json(payload): Json<TextMessagePayload>,
) -> Result<(StatusCode, Json<MessageDto>), ApiError> {
    payload
        .validate()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let sent = state
        .chat_service
        .send_message(SendTextRequest {
            chat_id: ChatId::from(chat_id),
            sender_id: user.user_id,
            content: payload.content,
        })
        .await?;
    Ok(published(&state, sent).await)
}

async fn send_voice(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(chat_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MessageDto>), ApiError> {
    let mut audio = None;
    let mut duration_secs = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("voice") => {
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                audio = Some((bytes.to_vec(), mime_type));
            }
            Some("duration") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                // 前端上报的是秒数，可能带小数
                duration_secs = text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite() && *value >= 0.0)
                    .map(|value| value.round() as u32)
                    .ok_or_else(|| ApiError::bad_request("duration: must be a number of seconds"))?;
            }
            _ => {}
        }
    }

    let (audio, mime_type) =
        audio.ok_or_else(|| ApiError::bad_request("No audio file provided"))?;
    let sent = state
        .chat_service
        .send_voice_message(SendVoiceRequest {
            chat_id: ChatId::from(chat_id),
            sender_id: user.user_id,
            audio,
            mime_type,
            duration_secs,
        })
        .await?;
    Ok(published(&state, sent).await)
}

async fn delete_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<DeletedResponse>, ApiError> {
    let deleted = state
        .chat_service
        .delete_message(MessageId::from(message_id), user.user_id)
        .await?;
    Ok(Json(DeletedResponse {
        message: "Message deleted",
        id: deleted.id.into(),
    }))
}

/// REST 写入的消息和 socket 写入的一样扇出到实时通道。
async fn published(state: &AppState, sent: SentMessage) -> (StatusCode, Json<MessageDto>) {
    state.engine.publish_message(&sent).await;
    (StatusCode::CREATED, Json(MessageDto::from(&sent.message)))
}
