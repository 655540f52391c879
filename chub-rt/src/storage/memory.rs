//! In-memory storage backend
//!
//! Map-based implementation of [`Storage`]. Nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chub_common::db::models::{
    Appointment, AppointmentStatus, CommunicationTemplate, Conversation, ConversationSummary,
    DeliveryRecord, Message, Notification, NotificationPreferences, User,
};
use chub_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Storage;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    conversations: HashMap<Uuid, Conversation>,
    /// conversation id -> participants in join order
    participants: HashMap<Uuid, Vec<Uuid>>,
    /// Insertion order breaks created_at ties
    messages: Vec<Message>,
    /// (message id, reader id)
    reads: HashSet<(Uuid, Uuid)>,
    notifications: Vec<Notification>,
    appointments: HashMap<Uuid, Appointment>,
    templates: HashMap<String, CommunicationTemplate>,
    preferences: HashMap<Uuid, NotificationPreferences>,
    deliveries: Vec<DeliveryRecord>,
}

impl Tables {
    fn is_unread(&self, message: &Message, user_id: Uuid) -> bool {
        message.sender_id != user_id && !self.reads.contains(&(message.id, user_id))
    }

    fn user_conversations(&self, user_id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.participants
            .iter()
            .filter(move |(_, members)| members.contains(&user_id))
            .map(|(conversation_id, _)| *conversation_id)
    }
}

/// In-memory [`Storage`] backend
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage preloaded with the default communication templates
    pub fn with_default_templates() -> Self {
        let mut tables = Tables::default();
        let now = Utc::now();
        for (name, channel, subject, body) in chub_common::db::DEFAULT_TEMPLATES {
            if let Ok(channel) = channel.parse() {
                tables.templates.insert(
                    name.to_string(),
                    CommunicationTemplate {
                        name: name.to_string(),
                        channel,
                        subject: Some(subject.to_string()),
                        body: body.to_string(),
                        updated_at: now,
                    },
                );
            }
        }
        Self {
            tables: RwLock::new(tables),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        self.tables.write().await.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Uuid],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.conversations.contains_key(&conversation.id) {
            return Err(Error::Conflict(format!(
                "Conversation {} already exists",
                conversation.id
            )));
        }
        tables.conversations.insert(conversation.id, conversation.clone());
        tables.participants.insert(conversation.id, participants.to_vec());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.tables.read().await.conversations.get(&id).cloned())
    }

    async fn conversation_participants(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .get(&conversation_id)
            .is_some_and(|members| members.contains(&user_id)))
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let tables = self.tables.read().await;
        let mut summaries: Vec<ConversationSummary> = tables
            .user_conversations(user_id)
            .filter_map(|conversation_id| {
                let conversation = tables.conversations.get(&conversation_id)?.clone();
                let in_conversation = || {
                    tables
                        .messages
                        .iter()
                        .filter(move |m| m.conversation_id == conversation_id)
                };
                // max_by_key keeps the last maximum, i.e. the latest insert on ties
                let last_message = in_conversation().max_by_key(|m| m.created_at).cloned();
                let unread_count =
                    in_conversation().filter(|m| tables.is_unread(m, user_id)).count() as u64;
                Some(ConversationSummary {
                    conversation,
                    participants: tables
                        .participants
                        .get(&conversation_id)
                        .cloned()
                        .unwrap_or_default(),
                    last_message,
                    unread_count,
                })
            })
            .collect();

        summaries.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        Ok(summaries)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(Error::NotFound(format!(
                "Conversation {}",
                message.conversation_id
            )));
        }
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .tables
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&Message> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.map_or(true, |cutoff| m.created_at < cutoff))
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        matching.sort_by_key(|m| m.created_at);

        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let message = tables
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;
        if message.sender_id == user_id {
            return Ok(false);
        }
        Ok(tables.reads.insert((message_id, user_id)))
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        _at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let unread: Vec<Uuid> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && tables.is_unread(m, user_id))
            .map(|m| m.id)
            .collect();
        for message_id in &unread {
            tables.reads.insert((*message_id, user_id));
        }
        Ok(unread.len() as u64)
    }

    async fn unread_message_count(&self, user_id: Uuid) -> Result<u64> {
        let tables = self.tables.read().await;
        let conversations: HashSet<Uuid> = tables.user_conversations(user_id).collect();
        Ok(tables
            .messages
            .iter()
            .filter(|m| conversations.contains(&m.conversation_id) && tables.is_unread(m, user_id))
            .count() as u64)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        self.tables
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&Notification> = tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.read))
            .collect();
        matching.sort_by_key(|n| n.created_at);
        Ok(matching.into_iter().rev().take(limit).cloned().collect())
    }

    async fn mark_notification_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Notification> {
        let mut tables = self.tables.write().await;
        let notification = tables
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("Notification {}", id)))?;
        if !notification.read {
            notification.read = true;
            notification.read_at = Some(at);
        }
        Ok(notification.clone())
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut count = 0;
        for notification in tables
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read)
        {
            notification.read = true;
            notification.read_at = Some(at);
            count += 1;
        }
        Ok(count)
    }

    async fn unread_notification_count(&self, user_id: Uuid) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.read)
            .count() as u64)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self
            .tables
            .read()
            .await
            .notifications
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<()> {
        self.tables
            .write()
            .await
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>> {
        Ok(self.tables.read().await.appointments.get(&id).cloned())
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected: &[AppointmentStatus],
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .appointments
            .get_mut(&appointment.id)
            .ok_or_else(|| Error::NotFound(format!("Appointment {}", appointment.id)))?;
        if !expected.contains(&existing.status) {
            return Err(Error::Conflict(format!(
                "Appointment is already {}",
                existing.status
            )));
        }
        *existing = appointment.clone();
        Ok(())
    }

    async fn list_appointments(&self, user_id: Uuid) -> Result<Vec<Appointment>> {
        let tables = self.tables.read().await;
        let mut matching: Vec<Appointment> = tables
            .appointments
            .values()
            .filter(|a| a.client_id == user_id || a.proposed_by == user_id)
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.starts_at);
        Ok(matching)
    }

    async fn get_template(&self, name: &str) -> Result<Option<CommunicationTemplate>> {
        Ok(self.tables.read().await.templates.get(name).cloned())
    }

    async fn upsert_template(&self, template: &CommunicationTemplate) -> Result<()> {
        self.tables
            .write()
            .await
            .templates
            .insert(template.name.clone(), template.clone());
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<CommunicationTemplate>> {
        let mut templates: Vec<CommunicationTemplate> =
            self.tables.read().await.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences> {
        Ok(self
            .tables
            .read()
            .await
            .preferences
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| NotificationPreferences::defaults_for(user_id)))
    }

    async fn set_preferences(&self, preferences: &NotificationPreferences) -> Result<()> {
        self.tables
            .write()
            .await
            .preferences
            .insert(preferences.user_id, preferences.clone());
        Ok(())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.tables.write().await.deliveries.push(record.clone());
        Ok(())
    }

    async fn list_deliveries(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .deliveries
            .iter()
            .filter(|d| d.notification_id == notification_id)
            .cloned()
            .collect())
    }
}
