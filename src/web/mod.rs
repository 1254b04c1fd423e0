pub mod auth;
pub mod data;
pub mod models;
pub mod responses;
pub mod router;
pub mod state;
pub mod status;
pub mod storage;

pub use auth::{AuthUser, SESSION_COOKIE, SESSION_TTL_DAYS};
pub use responses::{ApiMessage, json_error};
pub use state::AppState;
pub use status::ExportStatus;
