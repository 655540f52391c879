//! chub-rt library - real-time delivery core for the Creator Hub
//!
//! Messaging, appointment proposals and multi-channel notifications, pushed
//! to connected clients over per-user SSE streams.

use axum::Router;
use chrono::Utc;
use chub_common::config::{DeliveryConfig, SeedUser};
use chub_common::db::models::User;
use chub_common::events::EventBus;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod api;
pub mod appointments;
pub mod channels;
pub mod delivery;
pub mod messaging;
pub mod notifications;
pub mod registry;
pub mod storage;
pub mod templates;

use appointments::AppointmentService;
use channels::ChannelSet;
use delivery::DeliveryService;
use messaging::MessagingService;
use notifications::NotificationService;
use registry::ConnectionRegistry;
use storage::Storage;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub delivery: Arc<DeliveryService>,
    pub notifications: Arc<NotificationService>,
    pub messaging: Arc<MessagingService>,
    pub appointments: Arc<AppointmentService>,
    /// SSE keep-alive interval
    pub heartbeat_secs: u64,
}

impl AppState {
    /// Wire the services over one storage backend
    pub fn new(storage: Arc<dyn Storage>, channels: ChannelSet, config: &DeliveryConfig) -> Self {
        let delivery = Arc::new(DeliveryService::new(
            Arc::new(ConnectionRegistry::new(config.connection_queue_capacity)),
            EventBus::new(config.event_bus_capacity),
        ));
        let notifications = Arc::new(NotificationService::new(
            Arc::clone(&storage),
            Arc::clone(&delivery),
            channels,
            config.clone(),
        ));
        let messaging = Arc::new(MessagingService::new(
            Arc::clone(&storage),
            Arc::clone(&delivery),
            Arc::clone(&notifications),
            config.max_message_length,
        ));
        let appointments = Arc::new(AppointmentService::new(
            Arc::clone(&storage),
            Arc::clone(&delivery),
            Arc::clone(&notifications),
        ));

        Self {
            storage,
            delivery,
            notifications,
            messaging,
            appointments,
            heartbeat_secs: config.heartbeat_secs,
        }
    }
}

/// Insert or refresh users provisioned from config
///
/// An existing user keeps its original `created_at`.
pub async fn seed_users(storage: &dyn Storage, seeds: &[SeedUser]) -> chub_common::Result<usize> {
    for seed in seeds {
        let created_at = storage
            .get_user(seed.id)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);
        storage
            .upsert_user(&User {
                id: seed.id,
                username: seed.username.clone(),
                role: seed.role,
                email: seed.email.clone(),
                phone: seed.phone.clone(),
                created_at,
            })
            .await?;
    }
    if !seeds.is_empty() {
        info!("Seeded {} user(s) from config", seeds.len());
    }
    Ok(seeds.len())
}

/// Build application router
///
/// `/health` and `/api/status/events` need no identity; everything else
/// resolves the caller through [`api::CurrentUser`].
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::event_routes())
        .merge(api::conversation_routes())
        .merge(api::notification_routes())
        .merge(api::appointment_routes())
        .merge(api::template_routes())
        .merge(api::admin_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Services wired over in-memory storage, side channels run inline

    use super::*;
    use chub_common::db::models::UserRole;
    use storage::MemoryStorage;

    pub struct Harness {
        pub storage: Arc<MemoryStorage>,
        pub delivery: Arc<DeliveryService>,
        pub notifications: Arc<NotificationService>,
        pub messaging: Arc<MessagingService>,
        pub appointments: Arc<AppointmentService>,
    }

    impl Harness {
        pub fn new() -> Self {
            let storage = Arc::new(MemoryStorage::with_default_templates());
            let config = DeliveryConfig {
                async_side_channels: false,
                ..DeliveryConfig::default()
            };
            let state = AppState::new(
                Arc::clone(&storage) as Arc<dyn Storage>,
                ChannelSet::default(),
                &config,
            );
            Self {
                storage,
                delivery: state.delivery,
                notifications: state.notifications,
                messaging: state.messaging,
                appointments: state.appointments,
            }
        }

        pub async fn user(&self, name: &str, role: UserRole) -> User {
            storage::contract::user(self.storage.as_ref(), name, role).await
        }
    }

    #[tokio::test]
    async fn test_seed_users_preserves_created_at() {
        let storage = MemoryStorage::new();
        let seed = SeedUser {
            id: uuid::Uuid::new_v4(),
            username: "manager".to_string(),
            role: UserRole::Admin,
            email: None,
            phone: None,
        };
        assert_eq!(seed_users(&storage, &[seed.clone()]).await.unwrap(), 1);
        let first = storage.get_user(seed.id).await.unwrap().unwrap();

        let renamed = SeedUser {
            username: "owner".to_string(),
            ..seed
        };
        seed_users(&storage, &[renamed]).await.unwrap();
        let second = storage.get_user(first.id).await.unwrap().unwrap();
        assert_eq!(second.username, "owner");
        assert_eq!(second.created_at, first.created_at);
    }
}
