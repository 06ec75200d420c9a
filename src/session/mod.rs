//! Session management: the live agent fleet and its metadata.

pub mod error;
pub mod manager;
pub mod models;

pub use error::{SessionError, SessionResult};
pub use manager::SessionManager;
pub use models::{
    ChatRequest, ChatResponse, CreateSessionRequest, HealthInfo, SessionInfo, SessionRecord,
    SessionStatus, ToolCallRecord,
};
