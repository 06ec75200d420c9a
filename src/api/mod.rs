//! HTTP surface: REST endpoints for session CRUD and chat, SSE streaming.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
