//! Appointment proposals between admins and clients

use chrono::{DateTime, Utc};
use chub_common::db::models::{Appointment, AppointmentStatus, NotificationKind, User, UserRole};
use chub_common::events::ChubEvent;
use chub_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryService;
use crate::notifications::{NotificationRequest, NotificationService, TemplateRef};
use crate::storage::Storage;
use crate::templates::{params, TemplateParams};

/// States an appointment can be cancelled from
const CANCELLABLE: &[AppointmentStatus] =
    &[AppointmentStatus::Pending, AppointmentStatus::Accepted];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub client_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

pub struct AppointmentService {
    storage: Arc<dyn Storage>,
    delivery: Arc<DeliveryService>,
    notifications: Arc<NotificationService>,
}

impl AppointmentService {
    pub fn new(
        storage: Arc<dyn Storage>,
        delivery: Arc<DeliveryService>,
        notifications: Arc<NotificationService>,
    ) -> Self {
        Self {
            storage,
            delivery,
            notifications,
        }
    }

    /// Propose an appointment to a client; admins only
    pub async fn propose(&self, actor: &User, new: NewAppointment) -> Result<Appointment> {
        if !actor.is_admin() {
            return Err(Error::Forbidden(
                "Only admins can propose appointments".to_string(),
            ));
        }
        let client = self
            .storage
            .get_user(new.client_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("User {}", new.client_id)))?;
        if client.role != UserRole::Client {
            return Err(Error::InvalidInput(format!(
                "User {} is not a client",
                client.id
            )));
        }
        let title = new.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidInput(
                "Appointment title must not be empty".to_string(),
            ));
        }
        if new.ends_at <= new.starts_at {
            return Err(Error::InvalidInput(
                "Appointment must end after it starts".to_string(),
            ));
        }

        let now = Utc::now();
        let appointment = Appointment {
            id: Uuid::new_v4(),
            client_id: client.id,
            proposed_by: actor.id,
            title: title.to_string(),
            description: new.description.trim().to_string(),
            location: new.location.filter(|l| !l.trim().is_empty()),
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            status: AppointmentStatus::Pending,
            response_note: None,
            created_at: now,
            responded_at: None,
        };
        self.storage.insert_appointment(&appointment).await?;

        self.delivery.deliver(
            &[client.id, actor.id],
            ChubEvent::AppointmentProposed {
                appointment: appointment.clone(),
                timestamp: now,
            },
        );
        self.notify_party(
            client.id,
            &appointment,
            NotificationKind::AppointmentProposed,
            params([
                ("title", appointment.title.clone()),
                ("proposer", actor.username.clone()),
                ("starts_at", format_start(appointment.starts_at)),
            ]),
        )
        .await;

        info!(
            "Appointment {} proposed by {} to {}",
            appointment.id, actor.id, client.id
        );
        Ok(appointment)
    }

    /// Accept or decline a pending proposal; only its client may respond
    pub async fn respond(
        &self,
        actor: &User,
        appointment_id: Uuid,
        accept: bool,
        note: Option<String>,
    ) -> Result<Appointment> {
        let mut appointment = self.load(appointment_id).await?;
        if appointment.client_id != actor.id {
            return Err(Error::Forbidden(
                "Only the client can respond to this appointment".to_string(),
            ));
        }
        if appointment.status != AppointmentStatus::Pending {
            return Err(Error::Conflict(format!(
                "Appointment is already {}",
                appointment.status
            )));
        }

        let now = Utc::now();
        appointment.status = if accept {
            AppointmentStatus::Accepted
        } else {
            AppointmentStatus::Declined
        };
        appointment.response_note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        appointment.responded_at = Some(now);
        self.storage
            .update_appointment(&appointment, &[AppointmentStatus::Pending])
            .await?;

        self.delivery.deliver(
            &[appointment.client_id, appointment.proposed_by],
            ChubEvent::AppointmentResponded {
                appointment: appointment.clone(),
                timestamp: now,
            },
        );
        self.notify_party(
            appointment.proposed_by,
            &appointment,
            NotificationKind::AppointmentResponded,
            params([
                ("status", appointment.status.to_string()),
                ("title", appointment.title.clone()),
                ("client", actor.username.clone()),
            ]),
        )
        .await;

        info!("Appointment {} {} by {}", appointment.id, appointment.status, actor.id);
        Ok(appointment)
    }

    /// Cancel a pending or accepted appointment; the proposer or any admin may
    pub async fn cancel(&self, actor: &User, appointment_id: Uuid) -> Result<Appointment> {
        let mut appointment = self.load(appointment_id).await?;
        if appointment.proposed_by != actor.id && !actor.is_admin() {
            return Err(Error::Forbidden(
                "Only the proposer or an admin can cancel this appointment".to_string(),
            ));
        }
        if !CANCELLABLE.contains(&appointment.status) {
            return Err(Error::Conflict(format!(
                "Appointment is already {}",
                appointment.status
            )));
        }

        let now = Utc::now();
        appointment.status = AppointmentStatus::Cancelled;
        self.storage
            .update_appointment(&appointment, CANCELLABLE)
            .await?;

        self.delivery.deliver(
            &[appointment.client_id, appointment.proposed_by],
            ChubEvent::AppointmentCancelled {
                appointment: appointment.clone(),
                timestamp: now,
            },
        );
        self.notify_party(
            appointment.counterpart(actor.id),
            &appointment,
            NotificationKind::AppointmentCancelled,
            params([
                ("title", appointment.title.clone()),
                ("starts_at", format_start(appointment.starts_at)),
            ]),
        )
        .await;

        info!("Appointment {} cancelled by {}", appointment.id, actor.id);
        Ok(appointment)
    }

    pub async fn list(&self, user: &User) -> Result<Vec<Appointment>> {
        self.storage.list_appointments(user.id).await
    }

    async fn load(&self, appointment_id: Uuid) -> Result<Appointment> {
        self.storage
            .get_appointment(appointment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Appointment {}", appointment_id)))
    }

    /// Templated notification; failures are logged, the state change stands
    async fn notify_party(
        &self,
        user_id: Uuid,
        appointment: &Appointment,
        kind: NotificationKind,
        template_params: TemplateParams,
    ) {
        let request = NotificationRequest {
            user_id,
            kind,
            title: String::new(),
            body: String::new(),
            link: Some(format!("/appointments/{}", appointment.id)),
            template: Some(TemplateRef {
                name: kind.to_string(),
                params: template_params,
            }),
        };
        if let Err(e) = self.notifications.notify(request).await {
            warn!(
                "Failed to notify {} about appointment {}: {}",
                user_id, appointment.id, e
            );
        }
    }
}

fn format_start(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}
