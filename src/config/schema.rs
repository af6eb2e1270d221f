use crate::errors::TaskmateError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

fn default_workspace() -> String {
    "~/taskmate".to_string()
}

fn default_max_iterations() -> usize {
    20
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_max_command_lines() -> usize {
    25
}

fn default_compaction_threshold() -> usize {
    12000
}

fn default_keep_recent() -> usize {
    6
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Commands that are never executed, regardless of configuration.
/// A command matches an entry when it equals it or starts with it followed
/// by whitespace or a shell separator (boundary-safe, case-insensitive).
pub const DEFAULT_FORBIDDEN_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -rf ~/",
    "mkfs",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    ":(){ :|:& };:",
    "chmod -R 777 /",
    "chown -R",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default, rename = "loop")]
    pub task_loop: LoopConfig,
    /// Named agent roster: id → role definition. The id `root` is implicit
    /// and falls back to a built-in prompt when absent.
    #[serde(default)]
    pub agents: HashMap<String, AgentDef>,
}

// Serde field defaults only apply when deserializing; the no-config-file
// path relies on this impl.
impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            provider: ProviderConfig::default(),
            sandbox: SandboxConfig::default(),
            task_loop: LoopConfig::default(),
            agents: HashMap::new(),
        }
    }
}

impl Config {
    pub fn workspace_path(&self) -> PathBuf {
        crate::utils::expand_workspace_path(&self.workspace)
    }

    /// Validate cross-field constraints. Called by the loader after parsing.
    pub fn validate(&self) -> Result<(), TaskmateError> {
        if self.task_loop.max_iterations == 0 {
            return Err(TaskmateError::Config(
                "loop.maxIterations must be at least 1".into(),
            ));
        }
        if self.sandbox.max_command_lines == 0 {
            return Err(TaskmateError::Config(
                "sandbox.maxCommandLines must be at least 1".into(),
            ));
        }
        if self.sandbox.exec_timeout == 0 {
            return Err(TaskmateError::Config(
                "sandbox.execTimeout must be at least 1 second".into(),
            ));
        }
        for (id, def) in &self.agents {
            if id.trim().is_empty() {
                return Err(TaskmateError::Config("agent id must not be empty".into()));
            }
            if def.system_prompt.is_none() && def.system_prompt_file.is_none() {
                return Err(TaskmateError::Config(format!(
                    "agent '{}' needs systemPrompt or systemPromptFile",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url", rename = "baseUrl")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout", rename = "requestTimeout")]
    pub request_timeout: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Extra forbidden entries appended to the built-in deny-list.
    #[serde(default, rename = "forbiddenCommands")]
    pub forbidden_commands: Vec<String>,
    /// Maximum number of lines a single command block may contain.
    #[serde(default = "default_max_command_lines", rename = "maxCommandLines")]
    pub max_command_lines: usize,
    /// Wall-clock timeout for one execution, in seconds.
    #[serde(default = "default_exec_timeout", rename = "execTimeout")]
    pub exec_timeout: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            forbidden_commands: Vec::new(),
            max_command_lines: default_max_command_lines(),
            exec_timeout: default_exec_timeout(),
        }
    }
}

impl SandboxConfig {
    /// The effective deny-list: built-in defaults plus configured additions.
    pub fn effective_forbidden(&self) -> Vec<String> {
        let mut entries: Vec<String> = DEFAULT_FORBIDDEN_COMMANDS
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        entries.extend(self.forbidden_commands.iter().cloned());
        entries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations", rename = "maxIterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            compaction: CompactionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Estimated-token threshold above which history is compacted.
    #[serde(default = "default_compaction_threshold", rename = "thresholdTokens")]
    pub threshold_tokens: usize,
    /// Messages preserved verbatim at the tail when falling back to
    /// deterministic truncation.
    #[serde(default = "default_keep_recent", rename = "keepRecent")]
    pub keep_recent: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_tokens: default_compaction_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentDef {
    /// Inline system prompt text.
    #[serde(default, rename = "systemPrompt")]
    pub system_prompt: Option<String>,
    /// Path to a file holding the system prompt (read at push time).
    #[serde(default, rename = "systemPromptFile")]
    pub system_prompt_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().expect("default config valid");
        assert_eq!(config.workspace, "~/taskmate");
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(config.task_loop.max_iterations, 20);
        assert_eq!(config.sandbox.max_command_lines, 25);
        assert_eq!(config.sandbox.exec_timeout, 60);
        assert!(config.task_loop.compaction.enabled);
    }

    #[test]
    fn agent_without_prompt_rejected() {
        let mut config = Config::default();
        config.agents.insert("ops".into(), AgentDef::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn camel_case_keys_parse() {
        let json = r#"{
            "sandbox": {"maxCommandLines": 10, "forbiddenCommands": ["curl evil"]},
            "loop": {"maxIterations": 5},
            "agents": {"researcher": {"systemPrompt": "You research things."}}
        }"#;
        let config: Config = serde_json::from_str(json).expect("parse config");
        assert_eq!(config.sandbox.max_command_lines, 10);
        assert_eq!(config.task_loop.max_iterations, 5);
        let forbidden = config.sandbox.effective_forbidden();
        assert!(forbidden.iter().any(|f| f == "curl evil"));
        assert!(forbidden.iter().any(|f| f == "rm -rf /"));
        config.validate().expect("config valid");
    }
}
