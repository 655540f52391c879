//! HTTP API handlers for chub-rt

pub mod admin;
pub mod appointments;
pub mod conversations;
pub mod error;
pub mod events;
pub mod extract;
pub mod health;
pub mod identity;
pub mod notifications;
pub mod templates;

pub use admin::admin_routes;
pub use appointments::appointment_routes;
pub use conversations::conversation_routes;
pub use error::{ApiError, ApiResult};
pub use events::event_routes;
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use health::health_routes;
pub use identity::{AdminUser, CurrentUser, USER_ID_HEADER};
pub use notifications::notification_routes;
pub use templates::template_routes;
