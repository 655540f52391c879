//! Admin views over live connections

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AdminUser;
use crate::registry::UserPresence;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connection_count: usize,
    pub online_users: Vec<UserPresence>,
    /// Observers attached to the event bus (admin monitors)
    pub bus_subscribers: usize,
}

/// GET /api/admin/connections
pub async fn list_connections(
    State(state): State<AppState>,
    AdminUser(_admin): AdminUser,
) -> Json<ConnectionsResponse> {
    let registry = state.delivery.registry();
    Json(ConnectionsResponse {
        connection_count: registry.connection_count(),
        online_users: registry.online_users(),
        bus_subscribers: state.delivery.bus().subscriber_count(),
    })
}

pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/api/admin/connections", get(list_connections))
}
