//! Server-Sent Events (SSE) utilities

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::events::ChubEvent;

/// Convert a domain event to an SSE frame named after its event type
///
/// Returns `None` (and logs) if the event cannot be serialized.
pub fn event_to_sse(event: &ChubEvent) -> Option<Event> {
    match Event::default().event(event.event_type()).json_data(event) {
        Ok(sse_event) => Some(sse_event),
        Err(e) => {
            warn!("Failed to serialize {} event: {}", event.event_type(), e);
            None
        }
    }
}

/// Keep-alive configuration shared by every stream endpoint
pub fn keep_alive(interval_secs: u64) -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(interval_secs.max(1)))
        .text("heartbeat")
}

/// Create a simple heartbeat-only SSE stream for connection status monitoring
///
/// Used by clients that only need to know whether the service is reachable.
pub fn create_heartbeat_sse_stream(
    service_name: &'static str,
    interval_secs: u64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} status stream", service_name);

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("ConnectionStatus")
            .data("connected"));

        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs.max(1))).await;
            debug!("SSE: {} status heartbeat", service_name);
            yield Ok(Event::default().comment("heartbeat"));
        }
    };

    Sse::new(stream).keep_alive(keep_alive(interval_secs))
}
