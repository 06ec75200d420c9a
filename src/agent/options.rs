//! Per-session agent option set and CLI argument construction.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::{AgentDefaults, McpServerConfig, PluginConfig};

/// The resolved option set an agent subprocess is started with. Persisted
/// with the session record so resume replays the same configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    pub cwd: PathBuf,
    pub system_prompt: Option<String>,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    /// Absolute extra directories the agent may access.
    pub add_dirs: Vec<PathBuf>,
    pub setting_sources: Vec<String>,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub mcp_servers: HashMap<String, McpServerConfig>,
    pub plugins: Vec<PluginConfig>,
    /// Session id to assign to a fresh subprocess.
    pub session_id: Option<String>,
    /// Prior-session token; the subprocess restores its own conversation
    /// log from disk when set.
    pub resume: Option<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            cwd: PathBuf::from("."),
            system_prompt: None,
            permission_mode: "bypassPermissions".to_string(),
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            add_dirs: Vec::new(),
            setting_sources: Vec::new(),
            model: None,
            max_turns: None,
            max_budget_usd: None,
            mcp_servers: HashMap::new(),
            plugins: Vec::new(),
            session_id: None,
            resume: None,
        }
    }
}

impl AgentOptions {
    /// Start from the configured defaults with a session working directory.
    pub fn from_defaults(defaults: &AgentDefaults, cwd: PathBuf) -> Self {
        Self {
            cwd,
            system_prompt: defaults.system_prompt.clone(),
            permission_mode: defaults.permission_mode.clone(),
            allowed_tools: defaults.allowed_tools.clone(),
            disallowed_tools: defaults.disallowed_tools.clone(),
            add_dirs: Vec::new(),
            setting_sources: defaults.setting_sources.clone(),
            model: defaults.model.clone(),
            max_turns: defaults.max_turns,
            max_budget_usd: defaults.max_budget_usd,
            mcp_servers: defaults.mcp_servers.clone(),
            plugins: defaults.plugins.clone(),
            session_id: None,
            resume: None,
        }
    }

    /// Build the CLI argument vector for the agent process.
    ///
    /// The process runs in print mode with stream-json on both ends so it
    /// stays alive across turns, reading user messages from stdin.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--include-partial-messages".to_string(),
        ];

        if let Some(ref session_id) = self.session_id {
            args.push("--session-id".to_string());
            args.push(session_id.clone());
        }
        if let Some(ref resume) = self.resume {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }

        args.push("--permission-mode".to_string());
        args.push(self.permission_mode.clone());

        if let Some(ref prompt) = self.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if !self.disallowed_tools.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(self.disallowed_tools.join(","));
        }
        for dir in &self.add_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        if !self.setting_sources.is_empty() {
            args.push("--setting-sources".to_string());
            args.push(self.setting_sources.join(","));
        }
        if let Some(max_turns) = self.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(budget) = self.max_budget_usd {
            args.push("--max-budget-usd".to_string());
            args.push(budget.to_string());
        }
        if !self.mcp_servers.is_empty() {
            args.push("--mcp-config".to_string());
            args.push(self.mcp_config_json());
        }
        // Plugins ride in the settings payload. Passed after setting
        // sources, so plugin-provided capabilities win on conflict.
        if !self.plugins.is_empty() {
            args.push("--settings".to_string());
            args.push(
                serde_json::json!({ "plugins": self.plugins })
                    .to_string(),
            );
        }

        args
    }

    /// Serialized `{"mcpServers": {...}}` payload for `--mcp-config`.
    fn mcp_config_json(&self) -> String {
        let servers: serde_json::Map<String, serde_json::Value> = self
            .mcp_servers
            .iter()
            .map(|(name, server)| {
                let value = match server {
                    McpServerConfig::Stdio { command, args, env } => serde_json::json!({
                        "command": command,
                        "args": args,
                        "env": env,
                    }),
                    McpServerConfig::Sse { url } => serde_json::json!({
                        "type": "sse",
                        "url": url,
                    }),
                };
                (name.clone(), value)
            })
            .collect();

        serde_json::json!({ "mcpServers": servers }).to_string()
    }
}
