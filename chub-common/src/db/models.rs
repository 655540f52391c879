//! Domain models shared by the storage backends and the event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Implements `as_str` / `FromStr` for a snake_case string enum stored as TEXT
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Client,
    Admin,
}

text_enum!(UserRole { Client => "client", Admin => "admin" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Conversation listing row with per-user read state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participants: Vec<Uuid>,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

impl ConversationSummary {
    /// Timestamp used to order conversations by most recent activity
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.conversation.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    AppointmentProposed,
    AppointmentResponded,
    AppointmentCancelled,
    Announcement,
    System,
}

text_enum!(NotificationKind {
    Message => "message",
    AppointmentProposed => "appointment_proposed",
    AppointmentResponded => "appointment_responded",
    AppointmentCancelled => "appointment_cancelled",
    Announcement => "announcement",
    System => "system",
});

impl NotificationKind {
    /// Title used when a template renders no subject
    pub fn default_title(self) -> &'static str {
        match self {
            NotificationKind::Message => "New message",
            NotificationKind::AppointmentProposed => "New appointment",
            NotificationKind::AppointmentResponded => "Appointment updated",
            NotificationKind::AppointmentCancelled => "Appointment cancelled",
            NotificationKind::Announcement => "Announcement",
            NotificationKind::System => "Notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Accepted,
    Declined,
    Cancelled,
}

text_enum!(AppointmentStatus {
    Pending => "pending",
    Accepted => "accepted",
    Declined => "declined",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub client_id: Uuid,
    pub proposed_by: Uuid,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub response_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl Appointment {
    /// The party on the other side of the appointment from `user_id`
    pub fn counterpart(&self, user_id: Uuid) -> Uuid {
        if user_id == self.client_id {
            self.proposed_by
        } else {
            self.client_id
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    InApp,
    Email,
    Sms,
}

text_enum!(DeliveryChannel { InApp => "in_app", Email => "email", Sms => "sms" });

/// Reusable parametrized body for email/SMS/in-app notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationTemplate {
    pub name: String,
    pub channel: DeliveryChannel,
    pub subject: Option<String>,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    pub in_app: bool,
    pub email: bool,
    pub sms: bool,
}

impl NotificationPreferences {
    /// Every channel enabled
    pub fn defaults_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            in_app: true,
            email: true,
            sms: true,
        }
    }

    pub fn allows(&self, channel: DeliveryChannel) -> bool {
        match channel {
            DeliveryChannel::InApp => self.in_app,
            DeliveryChannel::Email => self.email,
            DeliveryChannel::Sms => self.sms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Pushed to at least one live connection
    Delivered,
    /// Recipient offline; persisted for polling
    Queued,
    /// Accepted by the external provider
    Sent,
    Failed,
    Skipped,
}

text_enum!(DeliveryStatus {
    Delivered => "delivered",
    Queued => "queued",
    Sent => "sent",
    Failed => "failed",
    Skipped => "skipped",
});

/// One per-channel outcome of a notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: DeliveryChannel,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
