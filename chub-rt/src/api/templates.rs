//! Admin management of communication templates

use axum::{
    extract::State,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use chub_common::db::models::{CommunicationTemplate, DeliveryChannel};
use serde::Deserialize;
use tracing::info;

use super::extract::{ApiJson, ApiPath};
use super::{AdminUser, ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TemplateRequest {
    pub channel: DeliveryChannel,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

/// GET /api/templates
pub async fn list_templates(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> ApiResult<Json<Vec<CommunicationTemplate>>> {
    Ok(Json(state.storage.list_templates().await?))
}

/// PUT /api/templates/:name
pub async fn put_template(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    ApiPath(name): ApiPath<String>,
    ApiJson(request): ApiJson<TemplateRequest>,
) -> ApiResult<Json<CommunicationTemplate>> {
    let name = name.trim();
    if name.is_empty() || request.body.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Template name and body must not be empty".to_string(),
        ));
    }

    let template = CommunicationTemplate {
        name: name.to_string(),
        channel: request.channel,
        subject: request.subject.filter(|s| !s.trim().is_empty()),
        body: request.body,
        updated_at: Utc::now(),
    };
    state.storage.upsert_template(&template).await?;

    info!("Template {} updated by {}", template.name, admin.username);
    Ok(Json(template))
}

pub fn template_routes() -> Router<AppState> {
    Router::new()
        .route("/api/templates", get(list_templates))
        .route("/api/templates/:name", put(put_template))
}
