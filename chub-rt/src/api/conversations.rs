//! Conversation and message endpoints

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chub_common::db::models::{Conversation, ConversationSummary, Message};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{ApiResult, CurrentUser};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

/// Paging for message history: newest `limit` strictly before `before`
#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ConversationReadResponse {
    pub messages_marked: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageReadResponse {
    pub newly_read: bool,
}

#[derive(Debug, Serialize)]
pub struct UnreadCountResponse {
    pub unread: u64,
}

/// GET /api/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.messaging.list_conversations(&user).await?))
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(request): ApiJson<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state
        .messaging
        .create_conversation(&user, request.title, &request.participant_ids)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/conversations/:id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(conversation_id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<MessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state
        .messaging
        .list_messages(&user, conversation_id, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

/// POST /api/conversations/:id/messages
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(conversation_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state
        .messaging
        .send_message(&user, conversation_id, &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/conversations/:id/read
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(conversation_id): ApiPath<Uuid>,
) -> ApiResult<Json<ConversationReadResponse>> {
    let messages_marked = state
        .messaging
        .mark_conversation_read(&user, conversation_id)
        .await?;
    Ok(Json(ConversationReadResponse { messages_marked }))
}

/// POST /api/messages/:id/read
pub async fn mark_message_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(message_id): ApiPath<Uuid>,
) -> ApiResult<Json<MessageReadResponse>> {
    let newly_read = state.messaging.mark_message_read(&user, message_id).await?;
    Ok(Json(MessageReadResponse { newly_read }))
}

/// GET /api/messages/unread-count
pub async fn unread_message_count(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread = state.messaging.unread_count(&user).await?;
    Ok(Json(UnreadCountResponse { unread }))
}

pub fn conversation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/read", post(mark_conversation_read))
        .route("/api/messages/:id/read", post(mark_message_read))
        .route("/api/messages/unread-count", get(unread_message_count))
}
