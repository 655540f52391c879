//! Server-Sent Events endpoints
//!
//! `/api/events` is the per-user stream: a `Connected` snapshot first, then
//! every event delivered to the caller's connection queue. The connection
//! stays registered for as long as the response body is alive.

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
    Router,
};
use chrono::Utc;
use chub_common::events::ChubEvent;
use chub_common::sse::{create_heartbeat_sse_stream, event_to_sse, keep_alive};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::{AdminUser, ApiResult, CurrentUser};
use crate::AppState;

/// GET /api/events - SSE stream of the caller's events
pub async fn user_event_stream(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Register before taking the snapshot so nothing falls in between
    let (guard, mut rx) = state.delivery.open_stream(user.id);

    let snapshot = ChubEvent::Connected {
        user_id: user.id,
        unread_messages: state.messaging.unread_count(&user).await?,
        unread_notifications: state.notifications.unread_count(user.id).await?,
        timestamp: Utc::now(),
    };
    info!(
        "SSE stream {} opened for {}",
        guard.connection_id(),
        user.username
    );

    let stream = async_stream::stream! {
        let guard = guard;

        if let Some(frame) = event_to_sse(&snapshot) {
            yield Ok(frame);
        }

        while let Some(event) = rx.recv().await {
            debug!("SSE: {} -> connection {}", event.event_type(), guard.connection_id());
            if let Some(frame) = event_to_sse(&event) {
                yield Ok(frame);
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(keep_alive(state.heartbeat_secs)))
}

/// GET /api/admin/events - every event on the bus, for monitoring
pub async fn admin_event_stream(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("Admin {} attached to the event monitor", admin.username);

    let stream = BroadcastStream::new(state.delivery.bus().subscribe()).filter_map(|received| {
        match received {
            Ok(event) => event_to_sse(&event).map(Ok),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Event monitor lagged, skipped {} event(s)", skipped);
                None
            }
        }
    });

    Sse::new(stream).keep_alive(keep_alive(state.heartbeat_secs))
}

/// GET /api/status/events - heartbeat-only reachability stream
pub async fn status_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    create_heartbeat_sse_stream("chub-rt", state.heartbeat_secs)
}

pub fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events", get(user_event_stream))
        .route("/api/admin/events", get(admin_event_stream))
        .route("/api/status/events", get(status_stream))
}
