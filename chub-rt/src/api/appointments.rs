//! Appointment endpoints

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chub_common::db::models::Appointment;
use serde::Deserialize;
use uuid::Uuid;

use super::extract::{ApiJson, ApiPath};
use super::{ApiResult, CurrentUser};
use crate::appointments::NewAppointment;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub accept: bool,
    #[serde(default)]
    pub note: Option<String>,
}

/// GET /api/appointments
pub async fn list_appointments(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<Appointment>>> {
    Ok(Json(state.appointments.list(&user).await?))
}

/// POST /api/appointments
pub async fn propose_appointment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiJson(request): ApiJson<NewAppointment>,
) -> ApiResult<(StatusCode, Json<Appointment>)> {
    let appointment = state.appointments.propose(&user, request).await?;
    Ok((StatusCode::CREATED, Json(appointment)))
}

/// POST /api/appointments/:id/respond
pub async fn respond_to_appointment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(appointment_id): ApiPath<Uuid>,
    ApiJson(request): ApiJson<RespondRequest>,
) -> ApiResult<Json<Appointment>> {
    let appointment = state
        .appointments
        .respond(&user, appointment_id, request.accept, request.note)
        .await?;
    Ok(Json(appointment))
}

/// POST /api/appointments/:id/cancel
pub async fn cancel_appointment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    ApiPath(appointment_id): ApiPath<Uuid>,
) -> ApiResult<Json<Appointment>> {
    Ok(Json(state.appointments.cancel(&user, appointment_id).await?))
}

pub fn appointment_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/appointments",
            get(list_appointments).post(propose_appointment),
        )
        .route("/api/appointments/:id/respond", post(respond_to_appointment))
        .route("/api/appointments/:id/cancel", post(cancel_appointment))
}
