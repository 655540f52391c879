//! Notification endpoints, including the polling fallback
//!
//! Clients without a live stream poll `unread-count` and the listing to
//! catch up on what they missed.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chub_common::db::models::{
    DeliveryRecord, Notification, NotificationKind, NotificationPreferences,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversations::UnreadCountResponse;
use super::extract::{ApiJson, ApiPath, ApiQuery};
use super::{AdminUser, ApiError, ApiResult, CurrentUser};
use crate::notifications::{NotificationOutcome, NotificationRequest, TemplateRef};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub limit: Option<usize>,
}

/// Admin announcement to a set of users
#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub user_ids: Vec<Uuid>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateRef>,
}

#[derive(Debug, Serialize)]
pub struct MarkAllReadResponse {
    pub marked: u64,
}

#[derive(Debug, Deserialize)]
pub struct PreferencesRequest {
    pub in_app: bool,
    pub email: bool,
    pub sms: bool,
}

/// GET /api/notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiQuery(query): ApiQuery<NotificationsQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let notifications = state
        .notifications
        .list(user.id, query.unread_only, query.limit)
        .await?;
    Ok(Json(notifications))
}

/// POST /api/notifications
pub async fn send_announcement(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
    ApiJson(request): ApiJson<AnnouncementRequest>,
) -> ApiResult<(StatusCode, Json<Vec<NotificationOutcome>>)> {
    if request.user_ids.is_empty() {
        return Err(ApiError::BadRequest("user_ids must not be empty".to_string()));
    }
    let outcomes = state
        .notifications
        .notify_many(
            &request.user_ids,
            NotificationRequest {
                user_id: Uuid::nil(),
                kind: NotificationKind::Announcement,
                title: request.title,
                body: request.body,
                link: request.link,
                template: request.template,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(outcomes)))
}

/// GET /api/notifications/unread-count
pub async fn unread_notification_count(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<UnreadCountResponse>> {
    let unread = state.notifications.unread_count(user.id).await?;
    Ok(Json(UnreadCountResponse { unread }))
}

/// POST /api/notifications/:id/read
pub async fn mark_notification_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(notification_id): ApiPath<Uuid>,
) -> ApiResult<Json<Notification>> {
    let notification = state
        .notifications
        .mark_read(user.id, notification_id)
        .await?;
    Ok(Json(notification))
}

/// POST /api/notifications/read-all
pub async fn mark_all_notifications_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<MarkAllReadResponse>> {
    let marked = state.notifications.mark_all_read(user.id).await?;
    Ok(Json(MarkAllReadResponse { marked }))
}

/// GET /api/notifications/:id/deliveries
pub async fn list_deliveries(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(notification_id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<DeliveryRecord>>> {
    Ok(Json(
        state.notifications.deliveries(&user, notification_id).await?,
    ))
}

/// GET /api/notification-preferences
pub async fn get_preferences(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<NotificationPreferences>> {
    Ok(Json(state.notifications.get_preferences(user.id).await?))
}

/// PUT /api/notification-preferences
pub async fn set_preferences(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(request): ApiJson<PreferencesRequest>,
) -> ApiResult<Json<NotificationPreferences>> {
    let preferences = state
        .notifications
        .set_preferences(NotificationPreferences {
            user_id: user.id,
            in_app: request.in_app,
            email: request.email,
            sms: request.sms,
        })
        .await?;
    Ok(Json(preferences))
}

pub fn notification_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notifications",
            get(list_notifications).post(send_announcement),
        )
        .route(
            "/api/notifications/unread-count",
            get(unread_notification_count),
        )
        .route(
            "/api/notifications/read-all",
            post(mark_all_notifications_read),
        )
        .route("/api/notifications/:id/read", post(mark_notification_read))
        .route("/api/notifications/:id/deliveries", get(list_deliveries))
        .route(
            "/api/notification-preferences",
            get(get_preferences).put(set_preferences),
        )
}
