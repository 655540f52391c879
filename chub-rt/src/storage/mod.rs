//! Persistence seam for the delivery core
//!
//! The delivery core treats persistence as opaque operations ("create
//! notification", "mark message read", "fetch conversation participants").
//! Two interchangeable backends implement them: [`MemoryStorage`] for
//! development and tests, [`SqliteStorage`] for deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chub_common::db::models::{
    Appointment, AppointmentStatus, CommunicationTemplate, Conversation, ConversationSummary,
    DeliveryRecord, Message, Notification, NotificationPreferences, User,
};
use chub_common::Result;
use uuid::Uuid;

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

/// Persistence operations consumed by the messaging, appointment and
/// notification services
#[async_trait]
pub trait Storage: Send + Sync {
    // ---- users (provisioned by the surrounding application) ----

    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Insert or replace a user; used for seeding only
    async fn upsert_user(&self, user: &User) -> Result<()>;

    // ---- conversations ----

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Uuid],
    ) -> Result<()>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    /// Participant user ids in join order
    async fn conversation_participants(&self, conversation_id: Uuid) -> Result<Vec<Uuid>>;

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;

    /// Conversations the user participates in, most recent activity first
    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>>;

    // ---- messages ----

    async fn insert_message(&self, message: &Message) -> Result<()>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Newest `limit` messages strictly older than `before`, oldest first
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Write a read receipt; `true` only if the receipt is new
    ///
    /// A sender's own message is never unread to them and returns `false`.
    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark every unread message in the conversation; returns the count marked
    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Unread messages across all of the user's conversations
    async fn unread_message_count(&self, user_id: Uuid) -> Result<u64>;

    // ---- notifications ----

    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    /// Newest first
    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>>;

    /// Mark read; NotFound if absent or owned by another user
    ///
    /// Idempotent: `read_at` keeps its first value.
    async fn mark_notification_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Notification>;

    async fn mark_all_notifications_read(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<u64>;

    async fn unread_notification_count(&self, user_id: Uuid) -> Result<u64>;

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>>;

    // ---- appointments ----

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<()>;

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>>;

    /// Persist status/response changes, provided the stored status is still
    /// one of `expected`
    ///
    /// The status check and the write are atomic. NotFound if the appointment
    /// is absent, Conflict if its status has already moved on.
    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected: &[AppointmentStatus],
    ) -> Result<()>;

    /// Appointments where the user is client or proposer, by start time
    async fn list_appointments(&self, user_id: Uuid) -> Result<Vec<Appointment>>;

    // ---- templates ----

    async fn get_template(&self, name: &str) -> Result<Option<CommunicationTemplate>>;

    async fn upsert_template(&self, template: &CommunicationTemplate) -> Result<()>;

    async fn list_templates(&self) -> Result<Vec<CommunicationTemplate>>;

    // ---- preferences ----

    /// Stored preferences, or every channel enabled if none stored
    async fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences>;

    async fn set_preferences(&self, preferences: &NotificationPreferences) -> Result<()>;

    // ---- delivery log ----

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Oldest first
    async fn list_deliveries(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>>;
}

/// Clamp a caller-supplied page size to `1..=max`, using `default` when absent
pub fn clamp_limit(limit: Option<usize>, default: usize, max: usize) -> usize {
    limit.unwrap_or(default).clamp(1, max)
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share; run against both implementations.

    use super::*;
    use chrono::Duration;
    use chub_common::db::models::{DeliveryChannel, DeliveryStatus, NotificationKind, UserRole};
    use std::sync::Arc;
    use chub_common::Error;

    pub async fn user(storage: &dyn Storage, name: &str, role: UserRole) -> User {
        let user = User {
            id: Uuid::new_v4(),
            username: name.to_string(),
            role,
            email: Some(format!("{}@example.com", name)),
            phone: None,
            created_at: Utc::now(),
        };
        storage.upsert_user(&user).await.unwrap();
        user
    }

    fn message(conversation_id: Uuid, sender_id: Uuid, body: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            body: body.to_string(),
            created_at: at,
        }
    }

    fn notification(user_id: Uuid, title: &str, at: DateTime<Utc>) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            user_id,
            kind: NotificationKind::System,
            title: title.to_string(),
            body: String::new(),
            link: None,
            read: false,
            created_at: at,
            read_at: None,
        }
    }

    pub async fn conversation_read_state(storage: &dyn Storage) {
        let alice = user(storage, "alice", UserRole::Client).await;
        let bob = user(storage, "bob", UserRole::Admin).await;
        let base = Utc::now();

        let conv = Conversation {
            id: Uuid::new_v4(),
            title: Some("Onboarding".to_string()),
            created_at: base,
        };
        storage.create_conversation(&conv, &[alice.id, bob.id]).await.unwrap();

        assert!(storage.is_participant(conv.id, alice.id).await.unwrap());
        assert_eq!(
            storage.conversation_participants(conv.id).await.unwrap(),
            vec![alice.id, bob.id]
        );

        let m1 = message(conv.id, alice.id, "hi", base + Duration::seconds(1));
        let m2 = message(conv.id, bob.id, "hello", base + Duration::seconds(2));
        let m3 = message(conv.id, bob.id, "welcome", base + Duration::seconds(3));
        for m in [&m1, &m2, &m3] {
            storage.insert_message(m).await.unwrap();
        }

        // Own messages never count as unread
        assert_eq!(storage.unread_message_count(alice.id).await.unwrap(), 2);
        assert_eq!(storage.unread_message_count(bob.id).await.unwrap(), 1);
        assert!(!storage.mark_message_read(m1.id, alice.id, base).await.unwrap());

        assert!(storage.mark_message_read(m2.id, alice.id, base).await.unwrap());
        assert!(!storage.mark_message_read(m2.id, alice.id, base).await.unwrap());
        assert_eq!(storage.unread_message_count(alice.id).await.unwrap(), 1);

        assert_eq!(
            storage.mark_conversation_read(conv.id, alice.id, base).await.unwrap(),
            1
        );
        assert_eq!(
            storage.mark_conversation_read(conv.id, alice.id, base).await.unwrap(),
            0
        );
        assert_eq!(storage.unread_message_count(alice.id).await.unwrap(), 0);

        let summaries = storage.list_conversations(bob.id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread_count, 1);
        assert_eq!(summaries[0].last_message.as_ref().unwrap().id, m3.id);
    }

    pub async fn message_paging(storage: &dyn Storage) {
        let alice = user(storage, "alice", UserRole::Client).await;
        let bob = user(storage, "bob", UserRole::Client).await;
        let base = Utc::now();
        let conv = Conversation {
            id: Uuid::new_v4(),
            title: None,
            created_at: base,
        };
        storage.create_conversation(&conv, &[alice.id, bob.id]).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let m = message(conv.id, alice.id, &format!("m{}", i), base + Duration::seconds(i));
            storage.insert_message(&m).await.unwrap();
            ids.push(m.id);
        }

        let latest = storage.list_messages(conv.id, None, 2).await.unwrap();
        assert_eq!(latest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..5].to_vec());

        let older = storage
            .list_messages(conv.id, Some(latest[0].created_at), 10)
            .await
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[0..3].to_vec());
    }

    pub async fn conversations_ordered_by_activity(storage: &dyn Storage) {
        let alice = user(storage, "alice", UserRole::Client).await;
        let bob = user(storage, "bob", UserRole::Client).await;
        let base = Utc::now();

        let older = Conversation {
            id: Uuid::new_v4(),
            title: Some("older".to_string()),
            created_at: base,
        };
        let newer = Conversation {
            id: Uuid::new_v4(),
            title: Some("newer".to_string()),
            created_at: base + Duration::seconds(1),
        };
        storage.create_conversation(&older, &[alice.id, bob.id]).await.unwrap();
        storage.create_conversation(&newer, &[alice.id, bob.id]).await.unwrap();

        // A message revives the older conversation
        let m = message(older.id, bob.id, "ping", base + Duration::seconds(5));
        storage.insert_message(&m).await.unwrap();

        let summaries = storage.list_conversations(alice.id).await.unwrap();
        let order: Vec<Uuid> = summaries.iter().map(|s| s.conversation.id).collect();
        assert_eq!(order, vec![older.id, newer.id]);
    }

    pub async fn notification_lifecycle(storage: &dyn Storage) {
        let alice = user(storage, "alice", UserRole::Client).await;
        let mallory = user(storage, "mallory", UserRole::Client).await;
        let base = Utc::now();

        let n1 = notification(alice.id, "first", base);
        let n2 = notification(alice.id, "second", base + Duration::seconds(1));
        storage.insert_notification(&n1).await.unwrap();
        storage.insert_notification(&n2).await.unwrap();

        let listed = storage.list_notifications(alice.id, false, 10).await.unwrap();
        assert_eq!(listed[0].id, n2.id, "newest first");
        assert_eq!(storage.unread_notification_count(alice.id).await.unwrap(), 2);

        // Someone else's notification looks absent
        let err = storage
            .mark_notification_read(n1.id, mallory.id, base)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let first_read = base + Duration::seconds(10);
        let read = storage.mark_notification_read(n1.id, alice.id, first_read).await.unwrap();
        assert!(read.read);
        assert_eq!(read.read_at, Some(first_read));

        let again = storage
            .mark_notification_read(n1.id, alice.id, first_read + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(again.read_at, Some(first_read));

        let unread = storage.list_notifications(alice.id, true, 10).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, n2.id);

        assert_eq!(storage.mark_all_notifications_read(alice.id, base).await.unwrap(), 1);
        assert_eq!(storage.unread_notification_count(alice.id).await.unwrap(), 0);
    }

    pub async fn appointments_and_preferences(storage: &dyn Storage) {
        let client = user(storage, "client", UserRole::Client).await;
        let admin = user(storage, "admin", UserRole::Admin).await;
        let base = Utc::now();

        let later = Appointment {
            id: Uuid::new_v4(),
            client_id: client.id,
            proposed_by: admin.id,
            title: "Later".to_string(),
            description: String::new(),
            location: None,
            starts_at: base + Duration::days(2),
            ends_at: base + Duration::days(2) + Duration::hours(1),
            status: AppointmentStatus::Pending,
            response_note: None,
            created_at: base,
            responded_at: None,
        };
        let mut sooner = later.clone();
        sooner.id = Uuid::new_v4();
        sooner.title = "Sooner".to_string();
        sooner.starts_at = base + Duration::days(1);
        sooner.ends_at = base + Duration::days(1) + Duration::hours(1);

        storage.insert_appointment(&later).await.unwrap();
        storage.insert_appointment(&sooner).await.unwrap();

        let listed = storage.list_appointments(admin.id).await.unwrap();
        assert_eq!(
            listed.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![sooner.id, later.id]
        );

        let mut accepted = sooner.clone();
        accepted.status = AppointmentStatus::Accepted;
        accepted.response_note = Some("see you".to_string());
        accepted.responded_at = Some(base);
        storage
            .update_appointment(&accepted, &[AppointmentStatus::Pending])
            .await
            .unwrap();
        assert_eq!(
            storage.get_appointment(sooner.id).await.unwrap().unwrap(),
            accepted
        );

        let mut missing = accepted.clone();
        missing.id = Uuid::new_v4();
        assert!(matches!(
            storage
                .update_appointment(&missing, &[AppointmentStatus::Pending])
                .await,
            Err(Error::NotFound(_))
        ));

        let mut declined = accepted.clone();
        declined.status = AppointmentStatus::Declined;
        assert!(matches!(
            storage
                .update_appointment(&declined, &[AppointmentStatus::Pending])
                .await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(
            storage.get_appointment(sooner.id).await.unwrap().unwrap().status,
            AppointmentStatus::Accepted
        );

        let prefs = storage.get_preferences(client.id).await.unwrap();
        assert_eq!(prefs, NotificationPreferences::defaults_for(client.id));
        let custom = NotificationPreferences {
            user_id: client.id,
            in_app: true,
            email: false,
            sms: false,
        };
        storage.set_preferences(&custom).await.unwrap();
        assert_eq!(storage.get_preferences(client.id).await.unwrap(), custom);
    }

    /// Racing transitions out of `pending`: exactly one wins per appointment
    pub async fn concurrent_appointment_transitions(storage: Arc<dyn Storage>) {
        let client = user(storage.as_ref(), "client", UserRole::Client).await;
        let admin = user(storage.as_ref(), "admin", UserRole::Admin).await;
        let base = Utc::now();

        for round in 0..20 {
            let pending = Appointment {
                id: Uuid::new_v4(),
                client_id: client.id,
                proposed_by: admin.id,
                title: format!("Session {}", round),
                description: String::new(),
                location: None,
                starts_at: base + Duration::days(1),
                ends_at: base + Duration::days(1) + Duration::hours(1),
                status: AppointmentStatus::Pending,
                response_note: None,
                created_at: base,
                responded_at: None,
            };
            storage.insert_appointment(&pending).await.unwrap();

            let tasks: Vec<_> = [AppointmentStatus::Accepted, AppointmentStatus::Declined]
                .into_iter()
                .map(|status| {
                    let storage = Arc::clone(&storage);
                    let mut next = pending.clone();
                    next.status = status;
                    next.responded_at = Some(base);
                    tokio::spawn(async move {
                        let result = storage
                            .update_appointment(&next, &[AppointmentStatus::Pending])
                            .await;
                        (status, result)
                    })
                })
                .collect();

            let mut winners = Vec::new();
            for task in tasks {
                match task.await.unwrap() {
                    (status, Ok(())) => winners.push(status),
                    (_, Err(Error::Conflict(_))) => {}
                    (_, Err(e)) => panic!("unexpected error {:?}", e),
                }
            }
            assert_eq!(winners.len(), 1, "round {}", round);
            assert_eq!(
                storage.get_appointment(pending.id).await.unwrap().unwrap().status,
                winners[0]
            );

            // A late cancel must not resurrect a declined appointment
            let mut cancelled = pending.clone();
            cancelled.status = AppointmentStatus::Cancelled;
            let result = storage
                .update_appointment(
                    &cancelled,
                    &[AppointmentStatus::Pending, AppointmentStatus::Accepted],
                )
                .await;
            match winners[0] {
                AppointmentStatus::Accepted => assert!(result.is_ok()),
                _ => assert!(matches!(result, Err(Error::Conflict(_)))),
            }
        }
    }

    pub async fn templates_and_delivery_log(storage: &dyn Storage) {
        let alice = user(storage, "alice", UserRole::Client).await;
        let base = Utc::now();

        let template = CommunicationTemplate {
            name: "welcome".to_string(),
            channel: DeliveryChannel::Email,
            subject: Some("Welcome {{name}}".to_string()),
            body: "Hi {{name}}".to_string(),
            updated_at: base,
        };
        storage.upsert_template(&template).await.unwrap();
        assert_eq!(storage.get_template("welcome").await.unwrap(), Some(template.clone()));
        assert!(storage.get_template("missing").await.unwrap().is_none());
        assert!(storage
            .list_templates()
            .await
            .unwrap()
            .iter()
            .any(|t| t.name == "welcome"));

        let n = notification(alice.id, "n", base);
        storage.insert_notification(&n).await.unwrap();
        let in_app = DeliveryRecord {
            id: Uuid::new_v4(),
            notification_id: n.id,
            channel: DeliveryChannel::InApp,
            status: DeliveryStatus::Queued,
            attempts: 1,
            detail: None,
            recorded_at: base,
        };
        let email = DeliveryRecord {
            id: Uuid::new_v4(),
            notification_id: n.id,
            channel: DeliveryChannel::Email,
            status: DeliveryStatus::Failed,
            attempts: 2,
            detail: Some("503".to_string()),
            recorded_at: base + Duration::seconds(1),
        };
        storage.record_delivery(&in_app).await.unwrap();
        storage.record_delivery(&email).await.unwrap();

        assert_eq!(storage.list_deliveries(n.id).await.unwrap(), vec![in_app, email]);
    }
}
