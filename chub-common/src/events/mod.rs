//! Event types for the Creator Hub event system
//!
//! Provides the shared event definitions pushed to connected clients and the
//! EventBus observers subscribe to.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::models::{Appointment, Message, Notification};

/// Creator Hub event types
///
/// Events are fanned out to recipients' open connections and broadcast on the
/// EventBus. They serialize with a `type` tag for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChubEvent {
    /// Snapshot sent first on every new stream
    ///
    /// Lets a client that was offline reconcile its badges without polling.
    Connected {
        user_id: Uuid,
        unread_messages: u64,
        unread_notifications: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// New message posted to a conversation
    ///
    /// Recipients: every participant, the sender included (multi-device echo)
    MessageCreated {
        message: Message,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A participant read a single message
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A participant read everything in a conversation
    ConversationRead {
        conversation_id: Uuid,
        reader_id: Uuid,
        /// Number of messages newly marked read
        messages_marked: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Admin proposed an appointment to a client
    AppointmentProposed {
        appointment: Appointment,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Client accepted or declined a proposal
    AppointmentResponded {
        appointment: Appointment,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    AppointmentCancelled {
        appointment: Appointment,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Notification persisted for a user
    NotificationCreated {
        notification: Notification,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Notification marked read (syncs badges across the user's devices)
    NotificationRead {
        notification_id: Uuid,
        user_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// All of a user's notifications marked read
    NotificationsCleared {
        user_id: Uuid,
        count: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ChubEvent {
    /// Event type name, used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            ChubEvent::Connected { .. } => "Connected",
            ChubEvent::MessageCreated { .. } => "MessageCreated",
            ChubEvent::MessageRead { .. } => "MessageRead",
            ChubEvent::ConversationRead { .. } => "ConversationRead",
            ChubEvent::AppointmentProposed { .. } => "AppointmentProposed",
            ChubEvent::AppointmentResponded { .. } => "AppointmentResponded",
            ChubEvent::AppointmentCancelled { .. } => "AppointmentCancelled",
            ChubEvent::NotificationCreated { .. } => "NotificationCreated",
            ChubEvent::NotificationRead { .. } => "NotificationRead",
            ChubEvent::NotificationsCleared { .. } => "NotificationsCleared",
        }
    }

    pub fn timestamp(&self) -> chrono::DateTime<chrono::Utc> {
        match self {
            ChubEvent::Connected { timestamp, .. }
            | ChubEvent::MessageCreated { timestamp, .. }
            | ChubEvent::MessageRead { timestamp, .. }
            | ChubEvent::ConversationRead { timestamp, .. }
            | ChubEvent::AppointmentProposed { timestamp, .. }
            | ChubEvent::AppointmentResponded { timestamp, .. }
            | ChubEvent::AppointmentCancelled { timestamp, .. }
            | ChubEvent::NotificationCreated { timestamp, .. }
            | ChubEvent::NotificationRead { timestamp, .. }
            | ChubEvent::NotificationsCleared { timestamp, .. } => *timestamp,
        }
    }
}

/// Central event distribution bus
///
/// Carries every domain event, independent of who the recipients are. Used by
/// observers such as the admin monitor stream. Per-user fan-out goes through
/// the connection registry instead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChubEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with specified channel capacity
    ///
    /// Slow subscribers that fall more than `capacity` events behind observe
    /// a `Lagged` error and skip ahead.
    ///
    /// # Examples
    ///
    /// ```
    /// use chub_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(1000);
    /// assert_eq!(event_bus.capacity(), 1000);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ChubEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ChubEvent,
    ) -> Result<usize, broadcast::error::SendError<ChubEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ChubEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
