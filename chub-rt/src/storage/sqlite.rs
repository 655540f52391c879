//! SQLite storage backend
//!
//! Implements [`Storage`] over the schema created by
//! `chub_common::db::init`. Ids are stored as TEXT, timestamps as RFC 3339
//! TEXT (lexically ordered, so `<` and `ORDER BY` work on them directly).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chub_common::db::models::{
    Appointment, AppointmentStatus, CommunicationTemplate, Conversation, ConversationSummary,
    DeliveryRecord, Message, Notification, NotificationPreferences, User,
};
use chub_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::Storage;

const USER_COLUMNS: &str = "id, username, role, email, phone, created_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, body, created_at";
const NOTIFICATION_COLUMNS: &str =
    "id, user_id, kind, title, body, link, read, created_at, read_at";
const APPOINTMENT_COLUMNS: &str = "id, client_id, proposed_by, title, description, location, \
     starts_at, ends_at, status, response_note, created_at, responded_at";

/// SQLite-backed [`Storage`]
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap a pool whose schema is already initialized
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn uuid_column(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let text: String = row.try_get(column)?;
    Uuid::parse_str(&text)
        .map_err(|e| Error::Internal(format!("Corrupt uuid in column {}: {}", column, e)))
}

fn user_from_row(row: &SqliteRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: uuid_column(row, "id")?,
        username: row.try_get("username")?,
        role: role.parse()?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: uuid_column(row, "id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: uuid_column(row, "id")?,
        conversation_id: uuid_column(row, "conversation_id")?,
        sender_id: uuid_column(row, "sender_id")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let kind: String = row.try_get("kind")?;
    Ok(Notification {
        id: uuid_column(row, "id")?,
        user_id: uuid_column(row, "user_id")?,
        kind: kind.parse()?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        link: row.try_get("link")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

fn appointment_from_row(row: &SqliteRow) -> Result<Appointment> {
    let status: String = row.try_get("status")?;
    Ok(Appointment {
        id: uuid_column(row, "id")?,
        client_id: uuid_column(row, "client_id")?,
        proposed_by: uuid_column(row, "proposed_by")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        status: status.parse()?,
        response_note: row.try_get("response_note")?,
        created_at: row.try_get("created_at")?,
        responded_at: row.try_get("responded_at")?,
    })
}

fn template_from_row(row: &SqliteRow) -> Result<CommunicationTemplate> {
    let channel: String = row.try_get("channel")?;
    Ok(CommunicationTemplate {
        name: row.try_get("name")?,
        channel: channel.parse()?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delivery_from_row(row: &SqliteRow) -> Result<DeliveryRecord> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(DeliveryRecord {
        id: uuid_column(row, "id")?,
        notification_id: uuid_column(row, "notification_id")?,
        channel: channel.parse()?,
        status: status.parse()?,
        attempts: attempts.max(0) as u32,
        detail: row.try_get("detail")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, role, email, phone, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                role = excluded.role,
                email = excluded.email,
                phone = excluded.phone
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(user.role.as_str())
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Uuid],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
            .bind(conversation.id.to_string())
            .bind(&conversation.title)
            .bind(conversation.created_at)
            .execute(&mut *tx)
            .await?;

        for user_id in participants {
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(conversation.id.to_string())
            .bind(user_id.to_string())
            .bind(conversation.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT id, title, created_at FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn conversation_participants(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ? ORDER BY rowid",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| uuid_column(row, "user_id")).collect()
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.title, c.created_at
            FROM conversations c
            JOIN conversation_participants p ON p.conversation_id = c.id
            WHERE p.user_id = ?
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let conversation = conversation_from_row(row)?;
            let conversation_key = conversation.id.to_string();

            let participants = self.conversation_participants(conversation.id).await?;

            let last_row = sqlx::query(&format!(
                "SELECT {} FROM messages WHERE conversation_id = ? \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                MESSAGE_COLUMNS
            ))
            .bind(&conversation_key)
            .fetch_optional(&self.pool)
            .await?;
            let last_message = last_row.as_ref().map(message_from_row).transpose()?;

            let unread: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM messages m
                WHERE m.conversation_id = ?
                  AND m.sender_id != ?
                  AND NOT EXISTS (
                      SELECT 1 FROM message_reads r
                      WHERE r.message_id = m.id AND r.user_id = ?
                  )
                "#,
            )
            .bind(&conversation_key)
            .bind(user_id.to_string())
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;

            summaries.push(ConversationSummary {
                conversation,
                participants,
                last_message,
                unread_count: unread.max(0) as u64,
            });
        }

        summaries.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        Ok(summaries)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
            SELECT ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(message.sender_id.to_string())
        .bind(&message.body)
        .bind(message.created_at)
        .bind(message.conversation_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "Conversation {}",
                message.conversation_id
            )));
        }
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages \
             WHERE conversation_id = ? AND (? IS NULL OR created_at < ?) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id.to_string())
        .bind(before)
        .bind(before)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn mark_message_read(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let message = self
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Message {}", message_id)))?;
        if message.sender_id == user_id {
            return Ok(false);
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(user_id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
            SELECT m.id, ?, ? FROM messages m
            WHERE m.conversation_id = ? AND m.sender_id != ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(at)
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE conversation_participants SET last_read_at = ?
            WHERE conversation_id = ? AND user_id = ?
            "#,
        )
        .bind(at)
        .bind(conversation_id.to_string())
        .bind(user_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn unread_message_count(&self, user_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages m
            JOIN conversation_participants p
              ON p.conversation_id = m.conversation_id AND p.user_id = ?
            WHERE m.sender_id != ?
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r
                  WHERE r.message_id = m.id AND r.user_id = ?
              )
            "#,
        )
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO notifications ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            NOTIFICATION_COLUMNS
        ))
        .bind(notification.id.to_string())
        .bind(notification.user_id.to_string())
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&notification.link)
        .bind(notification.read)
        .bind(notification.created_at)
        .bind(notification.read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notifications \
             WHERE user_id = ? AND (? = 0 OR read = 0) \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id.to_string())
        .bind(unread_only)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_notification_read(
        &self,
        id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Notification> {
        sqlx::query(
            "UPDATE notifications SET read = 1, read_at = ? WHERE id = ? AND user_id = ? AND read = 0",
        )
        .bind(at)
        .bind(id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE id = ? AND user_id = ?",
            NOTIFICATION_COLUMNS
        ))
        .bind(id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Notification {}", id)))?;
        notification_from_row(&row)
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE notifications SET read = 1, read_at = ? WHERE user_id = ? AND read = 0",
        )
        .bind(at)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn unread_notification_count(&self, user_id: Uuid) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE id = ?",
            NOTIFICATION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO appointments ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            APPOINTMENT_COLUMNS
        ))
        .bind(appointment.id.to_string())
        .bind(appointment.client_id.to_string())
        .bind(appointment.proposed_by.to_string())
        .bind(&appointment.title)
        .bind(&appointment.description)
        .bind(&appointment.location)
        .bind(appointment.starts_at)
        .bind(appointment.ends_at)
        .bind(appointment.status.as_str())
        .bind(&appointment.response_note)
        .bind(appointment.created_at)
        .bind(appointment.responded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<Appointment>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM appointments WHERE id = ?",
            APPOINTMENT_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn update_appointment(
        &self,
        appointment: &Appointment,
        expected: &[AppointmentStatus],
    ) -> Result<()> {
        let placeholders = vec!["?"; expected.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE appointments SET
                title = ?, description = ?, location = ?, starts_at = ?, ends_at = ?,
                status = ?, response_note = ?, responded_at = ?
            WHERE id = ? AND status IN ({})
            "#,
            placeholders
        );
        let mut query = sqlx::query(&sql)
            .bind(&appointment.title)
            .bind(&appointment.description)
            .bind(&appointment.location)
            .bind(appointment.starts_at)
            .bind(appointment.ends_at)
            .bind(appointment.status.as_str())
            .bind(&appointment.response_note)
            .bind(appointment.responded_at)
            .bind(appointment.id.to_string());
        for status in expected {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return match self.get_appointment(appointment.id).await? {
                Some(current) => Err(Error::Conflict(format!(
                    "Appointment is already {}",
                    current.status
                ))),
                None => Err(Error::NotFound(format!("Appointment {}", appointment.id))),
            };
        }
        Ok(())
    }

    async fn list_appointments(&self, user_id: Uuid) -> Result<Vec<Appointment>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM appointments WHERE client_id = ? OR proposed_by = ? \
             ORDER BY starts_at, rowid",
            APPOINTMENT_COLUMNS
        ))
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn get_template(&self, name: &str) -> Result<Option<CommunicationTemplate>> {
        let row = sqlx::query(
            "SELECT name, channel, subject, body, updated_at FROM communication_templates WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn upsert_template(&self, template: &CommunicationTemplate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO communication_templates (name, channel, subject, body, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                channel = excluded.channel,
                subject = excluded.subject,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&template.name)
        .bind(template.channel.as_str())
        .bind(&template.subject)
        .bind(&template.body)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<CommunicationTemplate>> {
        let rows = sqlx::query(
            "SELECT name, channel, subject, body, updated_at FROM communication_templates ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(template_from_row).collect()
    }

    async fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences> {
        let row = sqlx::query(
            "SELECT in_app, email, sms FROM notification_preferences WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(NotificationPreferences {
                user_id,
                in_app: row.try_get("in_app")?,
                email: row.try_get("email")?,
                sms: row.try_get("sms")?,
            }),
            None => Ok(NotificationPreferences::defaults_for(user_id)),
        }
    }

    async fn set_preferences(&self, preferences: &NotificationPreferences) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_preferences (user_id, in_app, email, sms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                in_app = excluded.in_app,
                email = excluded.email,
                sms = excluded.sms
            "#,
        )
        .bind(preferences.user_id.to_string())
        .bind(preferences.in_app)
        .bind(preferences.email)
        .bind(preferences.sms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_log (id, notification_id, channel, status, attempts, detail, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.notification_id.to_string())
        .bind(record.channel.as_str())
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(&record.detail)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_deliveries(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, notification_id, channel, status, attempts, detail, recorded_at
            FROM delivery_log WHERE notification_id = ?
            ORDER BY recorded_at, rowid
            "#,
        )
        .bind(notification_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}
