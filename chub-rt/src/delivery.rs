//! Event delivery to connected recipients
//!
//! The service boundary the rest of the application calls after persisting
//! something: "deliver this event to these users". Recipients without a live
//! connection are reported as offline; they catch up through the REST
//! polling endpoints.

use chub_common::events::{ChubEvent, EventBus};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::registry::{ConnectionGuard, ConnectionRegistry};

/// What happened to one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Recipients with at least one connection that accepted the event
    pub delivered_to: Vec<Uuid>,
    /// Recipients with no connection that accepted it (offline or all queues full)
    pub offline: Vec<Uuid>,
    pub connections_reached: usize,
    /// Connections skipped because their queue was full
    pub dropped: usize,
}

impl DeliveryReport {
    pub fn reached(&self, user_id: Uuid) -> bool {
        self.delivered_to.contains(&user_id)
    }
}

/// Fans events out over the connection registry and mirrors them on the bus
pub struct DeliveryService {
    registry: Arc<ConnectionRegistry>,
    bus: EventBus,
}

impl DeliveryService {
    pub fn new(registry: Arc<ConnectionRegistry>, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    /// Deliver `event` to every open connection of every recipient
    ///
    /// Duplicate recipient ids are delivered to once.
    pub fn deliver(&self, recipients: &[Uuid], event: ChubEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut seen = HashSet::with_capacity(recipients.len());

        for &user_id in recipients {
            if !seen.insert(user_id) {
                continue;
            }
            let outcome = self.registry.send_to_user(user_id, &event);
            report.connections_reached += outcome.delivered;
            report.dropped += outcome.dropped;
            if outcome.delivered > 0 {
                report.delivered_to.push(user_id);
            } else {
                report.offline.push(user_id);
            }
        }

        debug!(
            "{}: reached {} connection(s), {} recipient(s) offline",
            event.event_type(),
            report.connections_reached,
            report.offline.len()
        );

        self.bus.emit_lossy(event);
        report
    }

    /// Register a new stream connection for `user_id`
    pub fn open_stream(&self, user_id: Uuid) -> (ConnectionGuard, mpsc::Receiver<ChubEvent>) {
        self.registry.register(user_id)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}
