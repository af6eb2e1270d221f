//! Agent roster and the context stack. The root context sits at the bottom
//! and is never popped; delegation pushes a child context with its own
//! system prompt, session key, and sandbox, and pops it when the child
//! finishes.

use crate::config::{AgentDef, Config};
use crate::errors::TaskmateError;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::sandbox::CommandSandbox;

pub const ROOT_AGENT_ID: &str = "root";

const ROOT_SYSTEM_PROMPT: &str = "You are a command-line assistant operating in \
a workspace directory. To run a shell command, put it between >>> and <<< \
markers on their own lines. To delegate a subtask to a named agent, write a \
line 'agent <id>: <instructions>'. Reply 'done' when the task is complete, or \
'pause' to hand control back to the user. Keep commands short and verify \
results before moving on.";

/// The configured agent roster. Resolves an agent id to its system prompt.
pub struct AgentRegistry {
    agents: HashMap<String, AgentDef>,
}

impl AgentRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            agents: config.agents.clone(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        id == ROOT_AGENT_ID || self.agents.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve an agent's system prompt, reading the prompt file if the
    /// definition points at one.
    pub fn system_prompt(&self, id: &str) -> Result<String> {
        if id == ROOT_AGENT_ID && !self.agents.contains_key(ROOT_AGENT_ID) {
            return Ok(ROOT_SYSTEM_PROMPT.to_string());
        }
        let def = self
            .agents
            .get(id)
            .ok_or_else(|| TaskmateError::AgentNotFound(id.to_string()))?;
        if let Some(ref prompt) = def.system_prompt {
            return Ok(prompt.clone());
        }
        if let Some(ref path) = def.system_prompt_file {
            let expanded = crate::utils::expand_workspace_path(path);
            return std::fs::read_to_string(&expanded).with_context(|| {
                format!("Failed to read system prompt file: {}", expanded.display())
            });
        }
        // validate() rejects definitions with neither field
        Err(TaskmateError::AgentNotFound(id.to_string()).into())
    }
}

/// One live agent context: identity, prompt, isolated session, own sandbox.
pub struct AgentContext {
    pub agent_id: String,
    pub system_prompt: String,
    /// Session key, unique per push so parallel delegations to the same
    /// agent never share history.
    pub session_key: String,
    pub sandbox: Arc<CommandSandbox>,
    pub depth: usize,
    /// Pushed by delegation rather than by the user; popped automatically
    /// when its task completes.
    pub auto_pop_on_complete: bool,
}

/// Stack of agent contexts. Always non-empty: the root context is created
/// at construction and cannot be removed.
pub struct AgentStack {
    registry: AgentRegistry,
    contexts: Vec<AgentContext>,
    config: Config,
}

impl AgentStack {
    pub fn new(config: Config) -> Result<Self> {
        let registry = AgentRegistry::new(&config);
        let root_prompt = registry.system_prompt(ROOT_AGENT_ID)?;
        let root = AgentContext {
            agent_id: ROOT_AGENT_ID.to_string(),
            system_prompt: root_prompt,
            session_key: format!("{}:main", ROOT_AGENT_ID),
            sandbox: Arc::new(Self::build_sandbox(&config)),
            depth: 0,
            auto_pop_on_complete: false,
        };
        Ok(Self {
            registry,
            contexts: vec![root],
            config,
        })
    }

    fn build_sandbox(config: &Config) -> CommandSandbox {
        CommandSandbox::new(
            config.workspace_path(),
            &config.sandbox.effective_forbidden(),
            config.sandbox.max_command_lines,
            config.sandbox.exec_timeout,
        )
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn current(&self) -> &AgentContext {
        self.contexts.last().expect("stack is never empty")
    }

    pub fn depth(&self) -> usize {
        self.contexts.len() - 1
    }

    /// Ids from root to the active context.
    pub fn trail(&self) -> Vec<&str> {
        self.contexts.iter().map(|c| c.agent_id.as_str()).collect()
    }

    /// Push a context for `agent_id`. Fails without modifying the stack
    /// when the agent is unknown or its prompt file is unreadable.
    pub fn push(&mut self, agent_id: &str, auto_pop: bool) -> Result<()> {
        if !self.registry.contains(agent_id) {
            return Err(TaskmateError::AgentNotFound(agent_id.to_string()).into());
        }
        let system_prompt = self.registry.system_prompt(agent_id)?;
        let session_key = format!("{}:{}", agent_id, Uuid::new_v4());
        let context = AgentContext {
            agent_id: agent_id.to_string(),
            system_prompt,
            session_key,
            sandbox: Arc::new(Self::build_sandbox(&self.config)),
            depth: self.contexts.len(),
            auto_pop_on_complete: auto_pop,
        };
        info!(
            "pushed agent context '{}' (depth {})",
            agent_id,
            self.contexts.len()
        );
        self.contexts.push(context);
        Ok(())
    }

    /// Pop the active context. Refuses to pop the root.
    pub fn pop(&mut self) -> Result<AgentContext> {
        if self.contexts.len() == 1 {
            anyhow::bail!("cannot pop the root agent context");
        }
        let context = self.contexts.pop().expect("checked non-root");
        debug!("popped agent context '{}'", context.agent_id);
        Ok(context)
    }

    /// Pop every non-root context. Used by the interrupt unwind.
    pub fn unwind(&mut self) -> Vec<AgentContext> {
        let mut popped = Vec::new();
        while self.contexts.len() > 1 {
            popped.push(self.contexts.pop().expect("checked non-root"));
        }
        if !popped.is_empty() {
            info!("unwound {} agent context(s) to root", popped.len());
        }
        popped
    }
}
