// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;

use taskmate::agent::interrupt::InterruptFlag;
use taskmate::agent::stack::AgentStack;
use taskmate::agent::task_loop::{TaskEvent, TaskRunner};
use taskmate::config::{AgentDef, Config};
use taskmate::providers::base::{ChatProvider, ChatRequest, Message};
use taskmate::session::SessionManager;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub messages: Vec<Message>,
}

impl RecordedCall {
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Scripted chat provider: pops one reply per call, records every request.
/// Falls back to `done` when the script runs out so loops terminate.
pub struct MockProvider {
    responses: std::sync::Mutex<VecDeque<String>>,
    pub calls: Arc<std::sync::Mutex<Vec<RecordedCall>>>,
}

impl MockProvider {
    pub fn with_responses(responses: &[&str]) -> Self {
        Self {
            responses: std::sync::Mutex::new(
                responses.iter().map(|r| r.to_string()).collect(),
            ),
            calls: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: req.system_prompt.to_string(),
            messages: req.messages,
        });
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "done".to_string()))
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }
}

/// Builder for a shell command block as the model would emit one.
pub fn command_block(command: &str) -> String {
    format!(">>>\n{}\n<<<", command)
}

#[derive(Default)]
pub struct TestOverrides {
    pub max_iterations: Option<usize>,
    pub max_command_lines: Option<usize>,
    pub exec_timeout: Option<u64>,
    pub agents: Vec<(String, String)>,
}

pub struct TestHarness {
    pub runner: TaskRunner,
    pub store: Arc<SessionManager>,
    pub events: Arc<std::sync::Mutex<Vec<TaskEvent>>>,
}

pub fn create_test_runner(
    provider: impl ChatProvider + 'static,
    workspace: &TempDir,
    home: &TempDir,
    overrides: TestOverrides,
) -> TestHarness {
    let mut config = Config {
        workspace: workspace.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    if let Some(v) = overrides.max_iterations {
        config.task_loop.max_iterations = v;
    }
    if let Some(v) = overrides.max_command_lines {
        config.sandbox.max_command_lines = v;
    }
    if let Some(v) = overrides.exec_timeout {
        config.sandbox.exec_timeout = v;
    }
    for (id, prompt) in overrides.agents {
        config.agents.insert(
            id,
            AgentDef {
                system_prompt: Some(prompt),
                system_prompt_file: None,
            },
        );
    }

    let stack = AgentStack::new(config).expect("stack builds");
    let store = Arc::new(SessionManager::new(home.path()).expect("session manager builds"));
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let runner = TaskRunner::new(
        stack,
        Arc::new(provider),
        store.clone(),
        InterruptFlag::new(),
    )
    .with_sink(Box::new(move |e| {
        sink_events.lock().unwrap().push(e.clone());
    }));

    TestHarness {
        runner,
        store,
        events,
    }
}
