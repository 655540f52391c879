//! Conversations and messages
//!
//! Every write is persisted before it is delivered, so a client that misses
//! the live event can always catch up through the listing endpoints.

use chrono::{DateTime, Utc};
use chub_common::db::models::{
    Conversation, ConversationSummary, Message, NotificationKind, User,
};
use chub_common::events::ChubEvent;
use chub_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryService;
use crate::notifications::{NotificationRequest, NotificationService, TemplateRef};
use crate::storage::{clamp_limit, Storage};
use crate::templates::{params, preview};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Characters of the message body quoted in offline notifications
const PREVIEW_CHARS: usize = 80;

const NEW_MESSAGE_TEMPLATE: &str = "new_message";

pub struct MessagingService {
    storage: Arc<dyn Storage>,
    delivery: Arc<DeliveryService>,
    notifications: Arc<NotificationService>,
    max_message_length: usize,
}

impl MessagingService {
    pub fn new(
        storage: Arc<dyn Storage>,
        delivery: Arc<DeliveryService>,
        notifications: Arc<NotificationService>,
        max_message_length: usize,
    ) -> Self {
        Self {
            storage,
            delivery,
            notifications,
            max_message_length,
        }
    }

    /// Create a conversation between `creator` and `participants`
    ///
    /// The creator is always a participant. Duplicates are ignored.
    pub async fn create_conversation(
        &self,
        creator: &User,
        title: Option<String>,
        participants: &[Uuid],
    ) -> Result<Conversation> {
        let mut members = vec![creator.id];
        for &id in participants {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        if members.len() < 2 {
            return Err(Error::InvalidInput(
                "A conversation needs at least two participants".to_string(),
            ));
        }
        for &id in &members[1..] {
            if self.storage.get_user(id).await?.is_none() {
                return Err(Error::NotFound(format!("User {}", id)));
            }
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            created_at: Utc::now(),
        };
        self.storage
            .create_conversation(&conversation, &members)
            .await?;

        info!(
            "Conversation {} created by {} with {} participants",
            conversation.id,
            creator.id,
            members.len()
        );
        Ok(conversation)
    }

    /// Persist a message and fan it out to the conversation
    pub async fn send_message(
        &self,
        sender: &User,
        conversation_id: Uuid,
        body: &str,
    ) -> Result<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(Error::InvalidInput("Message body must not be empty".to_string()));
        }
        if body.chars().count() > self.max_message_length {
            return Err(Error::InvalidInput(format!(
                "Message body exceeds {} characters",
                self.max_message_length
            )));
        }

        let participants = self.participants_for(sender.id, conversation_id).await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: sender.id,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        self.storage.insert_message(&message).await?;

        let report = self.delivery.deliver(
            &participants,
            ChubEvent::MessageCreated {
                message: message.clone(),
                timestamp: message.created_at,
            },
        );

        // Online recipients see the message live; only the rest get a notification
        let message_preview = preview(&message.body, PREVIEW_CHARS);
        for &recipient in report.offline.iter().filter(|&&id| id != sender.id) {
            let request = NotificationRequest {
                user_id: recipient,
                kind: NotificationKind::Message,
                title: String::new(),
                body: String::new(),
                link: Some(format!("/conversations/{}", conversation_id)),
                template: Some(TemplateRef {
                    name: NEW_MESSAGE_TEMPLATE.to_string(),
                    params: params([
                        ("sender", sender.username.clone()),
                        ("preview", message_preview.clone()),
                    ]),
                }),
            };
            if let Err(e) = self.notifications.notify(request).await {
                warn!(
                    "Failed to notify {} of message {}: {}",
                    recipient, message.id, e
                );
            }
        }

        debug!(
            "Message {} in conversation {}: {} live, {} offline",
            message.id,
            conversation_id,
            report.delivered_to.len(),
            report.offline.len()
        );
        Ok(message)
    }

    /// Write a read receipt; returns whether it was new
    pub async fn mark_message_read(&self, user: &User, message_id: Uuid) -> Result<bool> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;
        let participants = self
            .participants_for(user.id, message.conversation_id)
            .await?;

        let now = Utc::now();
        let newly_read = self
            .storage
            .mark_message_read(message_id, user.id, now)
            .await?;
        if newly_read {
            self.delivery.deliver(
                &participants,
                ChubEvent::MessageRead {
                    conversation_id: message.conversation_id,
                    message_id,
                    reader_id: user.id,
                    timestamp: now,
                },
            );
        }
        Ok(newly_read)
    }

    /// Mark everything in a conversation read; returns the number newly marked
    pub async fn mark_conversation_read(&self, user: &User, conversation_id: Uuid) -> Result<u64> {
        let participants = self.participants_for(user.id, conversation_id).await?;

        let now = Utc::now();
        let marked = self
            .storage
            .mark_conversation_read(conversation_id, user.id, now)
            .await?;
        if marked > 0 {
            self.delivery.deliver(
                &participants,
                ChubEvent::ConversationRead {
                    conversation_id,
                    reader_id: user.id,
                    messages_marked: marked,
                    timestamp: now,
                },
            );
        }
        Ok(marked)
    }

    pub async fn list_conversations(&self, user: &User) -> Result<Vec<ConversationSummary>> {
        self.storage.list_conversations(user.id).await
    }

    pub async fn list_messages(
        &self,
        user: &User,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.ensure_participant(user.id, conversation_id).await?;
        let limit = clamp_limit(limit, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE);
        self.storage
            .list_messages(conversation_id, before, limit)
            .await
    }

    pub async fn unread_count(&self, user: &User) -> Result<u64> {
        self.storage.unread_message_count(user.id).await
    }

    /// Fails unless the conversation exists and the user belongs to it
    async fn ensure_participant(&self, user_id: Uuid, conversation_id: Uuid) -> Result<()> {
        if self.storage.get_conversation(conversation_id).await?.is_none() {
            return Err(Error::NotFound(format!("Conversation {}", conversation_id)));
        }
        if !self.storage.is_participant(conversation_id, user_id).await? {
            return Err(Error::Forbidden(format!(
                "Not a participant of conversation {}",
                conversation_id
            )));
        }
        Ok(())
    }

    /// Participants of an existing conversation the user belongs to
    async fn participants_for(&self, user_id: Uuid, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        self.ensure_participant(user_id, conversation_id).await?;
        self.storage.conversation_participants(conversation_id).await
    }
}
