//! Multi-channel notification delivery
//!
//! Every notification is persisted first (that row is the polling fallback),
//! then pushed in-app to live connections, then sent over email/SMS according
//! to the user's preferences. Each channel's outcome lands in the delivery log.

use chrono::Utc;
use chub_common::config::DeliveryConfig;
use chub_common::db::models::{
    DeliveryChannel, DeliveryRecord, DeliveryStatus, Notification, NotificationKind,
    NotificationPreferences, User,
};
use chub_common::events::ChubEvent;
use chub_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::{send_with_retry, ChannelRecipient, ChannelSet, OutboundMessage};
use crate::delivery::DeliveryService;
use crate::storage::{clamp_limit, Storage};
use crate::templates::{render_template, TemplateParams};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// Named template plus its parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    #[serde(default)]
    pub params: TemplateParams,
}

/// What to notify a user about
///
/// When `template` is set, its rendered subject and body replace `title`
/// and `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationOutcome {
    pub notification: Notification,
    pub in_app: DeliveryStatus,
    /// Email/SMS records; empty when side channels run in the background
    pub side_channels: Vec<DeliveryRecord>,
}

pub struct NotificationService {
    storage: Arc<dyn Storage>,
    delivery: Arc<DeliveryService>,
    channels: ChannelSet,
    config: DeliveryConfig,
}

impl NotificationService {
    pub fn new(
        storage: Arc<dyn Storage>,
        delivery: Arc<DeliveryService>,
        channels: ChannelSet,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            storage,
            delivery,
            channels,
            config,
        }
    }

    /// Persist a notification and deliver it over every allowed channel
    ///
    /// Side-channel failures are logged and recorded, never returned.
    pub async fn notify(&self, request: NotificationRequest) -> Result<NotificationOutcome> {
        let user = self
            .storage
            .get_user(request.user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User {}", request.user_id)))?;
        let preferences = self.storage.get_preferences(user.id).await?;

        let (title, body) = match &request.template {
            Some(template_ref) => {
                let template = self
                    .storage
                    .get_template(&template_ref.name)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("Template {}", template_ref.name))
                    })?;
                let rendered = render_template(&template, &template_ref.params)?;
                // An admin may clear a subject; templated notifications still need a title
                let title = rendered
                    .subject
                    .filter(|subject| !subject.trim().is_empty())
                    .or_else(|| Some(request.title).filter(|title| !title.trim().is_empty()))
                    .unwrap_or_else(|| request.kind.default_title().to_string());
                (title, rendered.body)
            }
            None => (request.title, request.body),
        };
        if title.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Notification title must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: user.id,
            kind: request.kind,
            title,
            body,
            link: request.link,
            read: false,
            created_at: now,
            read_at: None,
        };
        self.storage.insert_notification(&notification).await?;

        let in_app = if preferences.in_app {
            let report = self.delivery.deliver(
                &[user.id],
                ChubEvent::NotificationCreated {
                    notification: notification.clone(),
                    timestamp: now,
                },
            );
            if report.reached(user.id) {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Queued
            }
        } else {
            DeliveryStatus::Skipped
        };
        let in_app_record = delivery_record(
            notification.id,
            DeliveryChannel::InApp,
            in_app,
            u32::from(in_app != DeliveryStatus::Skipped),
            (in_app == DeliveryStatus::Skipped).then(|| "disabled by preference".to_string()),
        );
        self.storage.record_delivery(&in_app_record).await?;

        let job = SideChannelJob {
            storage: Arc::clone(&self.storage),
            channels: self.channels.clone(),
            recipient: ChannelRecipient::from(&user),
            preferences,
            message: OutboundMessage {
                subject: notification.title.clone(),
                body: notification.body.clone(),
            },
            notification_id: notification.id,
            max_attempts: self.config.side_channel_max_attempts,
            backoff: Duration::from_millis(self.config.retry_backoff_ms),
        };

        let side_channels = if self.config.async_side_channels {
            tokio::spawn(job.run());
            Vec::new()
        } else {
            job.run().await
        };

        info!(
            "Notification {} ({}) for user {}: in-app {}",
            notification.id, notification.kind, user.id, in_app
        );

        Ok(NotificationOutcome {
            notification,
            in_app,
            side_channels,
        })
    }

    /// Send the same notification to several users
    ///
    /// Unknown user ids are skipped; any other failure aborts.
    pub async fn notify_many(
        &self,
        user_ids: &[Uuid],
        request: NotificationRequest,
    ) -> Result<Vec<NotificationOutcome>> {
        let mut outcomes = Vec::with_capacity(user_ids.len());
        for &user_id in user_ids {
            let mut single = request.clone();
            single.user_id = user_id;
            if self.storage.get_user(user_id).await?.is_none() {
                warn!("Skipping notification for unknown user {}", user_id);
                continue;
            }
            outcomes.push(self.notify(single).await?);
        }
        Ok(outcomes)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Notification>> {
        let limit = clamp_limit(limit, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE);
        self.storage.list_notifications(user_id, unread_only, limit).await
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64> {
        self.storage.unread_notification_count(user_id).await
    }

    /// Mark one notification read and sync the user's other devices
    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<Notification> {
        let now = Utc::now();
        let notification = self
            .storage
            .mark_notification_read(notification_id, user_id, now)
            .await?;
        self.delivery.deliver(
            &[user_id],
            ChubEvent::NotificationRead {
                notification_id,
                user_id,
                timestamp: now,
            },
        );
        Ok(notification)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64> {
        let now = Utc::now();
        let count = self.storage.mark_all_notifications_read(user_id, now).await?;
        if count > 0 {
            self.delivery.deliver(
                &[user_id],
                ChubEvent::NotificationsCleared {
                    user_id,
                    count,
                    timestamp: now,
                },
            );
        }
        Ok(count)
    }

    /// Delivery log of a notification; visible to its owner and to admins
    pub async fn deliveries(&self, actor: &User, notification_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        let notification = self
            .storage
            .get_notification(notification_id)
            .await?
            .filter(|n| n.user_id == actor.id || actor.is_admin())
            .ok_or_else(|| Error::NotFound(format!("Notification {}", notification_id)))?;
        self.storage.list_deliveries(notification.id).await
    }

    pub async fn get_preferences(&self, user_id: Uuid) -> Result<NotificationPreferences> {
        self.storage.get_preferences(user_id).await
    }

    pub async fn set_preferences(&self, preferences: NotificationPreferences) -> Result<NotificationPreferences> {
        self.storage.set_preferences(&preferences).await?;
        Ok(preferences)
    }
}

fn delivery_record(
    notification_id: Uuid,
    channel: DeliveryChannel,
    status: DeliveryStatus,
    attempts: u32,
    detail: Option<String>,
) -> DeliveryRecord {
    DeliveryRecord {
        id: Uuid::new_v4(),
        notification_id,
        channel,
        status,
        attempts,
        detail,
        recorded_at: Utc::now(),
    }
}

/// Email/SMS fan-out for one notification, runnable inline or spawned
struct SideChannelJob {
    storage: Arc<dyn Storage>,
    channels: ChannelSet,
    recipient: ChannelRecipient,
    preferences: NotificationPreferences,
    message: OutboundMessage,
    notification_id: Uuid,
    max_attempts: u32,
    backoff: Duration,
}

impl SideChannelJob {
    async fn run(self) -> Vec<DeliveryRecord> {
        let mut records = Vec::with_capacity(2);

        for channel in [DeliveryChannel::Email, DeliveryChannel::Sms] {
            let record = self.deliver_over(channel).await;
            if let Err(e) = self.storage.record_delivery(&record).await {
                warn!(
                    "Failed to record {} delivery for notification {}: {}",
                    channel, self.notification_id, e
                );
            }
            records.push(record);
        }
        records
    }

    async fn deliver_over(&self, channel: DeliveryChannel) -> DeliveryRecord {
        let skipped = |reason: &str| {
            delivery_record(
                self.notification_id,
                channel,
                DeliveryStatus::Skipped,
                0,
                Some(reason.to_string()),
            )
        };

        if !self.preferences.allows(channel) {
            return skipped("disabled by preference");
        }
        if self.recipient.address(channel).is_none() {
            return skipped("no address on file");
        }
        let Some(sender) = self.channels.sender(channel) else {
            return skipped("channel not configured");
        };

        let (attempts, result) = send_with_retry(
            sender.as_ref(),
            &self.recipient,
            &self.message,
            self.max_attempts,
            self.backoff,
        )
        .await;

        match result {
            Ok(()) => delivery_record(
                self.notification_id,
                channel,
                DeliveryStatus::Sent,
                attempts,
                None,
            ),
            Err(e) => {
                warn!(
                    "{} delivery for notification {} failed after {} attempt(s): {}",
                    channel, self.notification_id, attempts, e
                );
                delivery_record(
                    self.notification_id,
                    channel,
                    DeliveryStatus::Failed,
                    attempts,
                    Some(e.to_string()),
                )
            }
        }
    }
}
