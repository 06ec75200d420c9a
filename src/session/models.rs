//! Session data models and wire DTOs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::agent::AgentOptions;
use crate::settings::{McpServerConfig, PluginConfig};

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "closed" => Ok(SessionStatus::Closed),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// Timestamps cross the wire as ISO-8601 UTC with microsecond precision.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Serde adapter for microsecond-precision RFC 3339 timestamps.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// The persisted session entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub cwd: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_active_at: DateTime<Utc>,
    pub message_count: u64,
    pub status: SessionStatus,
    /// Caller-supplied metadata, stored verbatim.
    pub metadata: Value,
    /// Agent option set the session was started with; replayed on resume.
    pub options: AgentOptions,
}

impl SessionRecord {
    pub fn new(
        session_id: String,
        user_id: String,
        cwd: String,
        metadata: Value,
        options: AgentOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            cwd,
            created_at: now,
            last_active_at: now,
            message_count: 0,
            status: SessionStatus::Active,
            metadata,
            options,
        }
    }
}

/// Public view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub cwd: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub last_active_at: DateTime<Utc>,
    pub message_count: u64,
    pub status: SessionStatus,
    pub metadata: Value,
}

impl From<&SessionRecord> for SessionInfo {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            cwd: record.cwd.clone(),
            created_at: record.created_at,
            last_active_at: record.last_active_at,
            message_count: record.message_count,
            status: record.status,
            metadata: record.metadata.clone(),
        }
    }
}

/// Request to create a new session. Option fields override the configured
/// defaults for this session only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,

    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub add_dirs: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub mcp_servers: Option<HashMap<String, McpServerConfig>>,
    #[serde(default)]
    pub plugins: Option<Vec<PluginConfig>>,
}

/// Request to send a chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// A tool invocation in a completed chat turn, output filled in when the
/// matching result arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Response for the synchronous chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Health check payload.
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    pub status: String,
    pub version: String,
    /// Non-closed session records in the metadata store.
    pub active_sessions: u64,
    /// Agent clients currently live in memory.
    pub live_clients: u64,
    pub storage_type: String,
    pub uptime_seconds: u64,
    pub rss_mb: u64,
}
