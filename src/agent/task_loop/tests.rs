use super::*;
use crate::config::{AgentDef, Config};
use crate::errors::TaskmateError;
use crate::session::manager::SessionManager;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct RecordedCall {
    system_prompt: String,
    messages: Vec<Message>,
}

impl RecordedCall {
    fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

struct MockProvider {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<RecordedCall>>,
    fail_first: Mutex<usize>,
}

impl MockProvider {
    fn scripted(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
            fail_first: Mutex::new(0),
        })
    }

    fn failing_first(n: usize, replies: &[&str]) -> Arc<Self> {
        let provider = Self::scripted(replies);
        *provider.fail_first.lock().unwrap() = n;
        provider
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn chat(&self, req: ChatRequest<'_>) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: req.system_prompt.to_string(),
            messages: req.messages.clone(),
        });
        {
            let mut failures = self.fail_first.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TaskmateError::ModelCallFailed {
                    message: "scripted failure".to_string(),
                    retryable: false,
                }
                .into());
            }
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("mock provider ran out of scripted replies"))
    }

    fn default_model(&self) -> &str {
        "mock"
    }
}

struct Fixture {
    runner: TaskRunner,
    provider: Arc<MockProvider>,
    store: Arc<SessionManager>,
    events: Arc<Mutex<Vec<TaskEvent>>>,
    _workspace: TempDir,
    _home: TempDir,
}

fn fixture(provider: Arc<MockProvider>, tweak: impl FnOnce(&mut Config)) -> Fixture {
    let workspace = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();

    let mut config = Config {
        workspace: workspace.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    config.agents.insert(
        "helper".to_string(),
        AgentDef {
            system_prompt: Some("You are helper.".to_string()),
            system_prompt_file: None,
        },
    );
    tweak(&mut config);

    let stack = AgentStack::new(config).unwrap();
    let store = Arc::new(SessionManager::new(home.path()).unwrap());
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let runner = TaskRunner::new(
        stack,
        provider.clone(),
        store.clone(),
        InterruptFlag::new(),
    )
    .with_sink(Box::new(move |e| {
        sink_events.lock().unwrap().push(e.clone());
    }));

    Fixture {
        runner,
        provider,
        store,
        events,
        _workspace: workspace,
        _home: home,
    }
}

#[tokio::test]
async fn chat_only_reply_reprompts_for_an_action() {
    let mut fx = fixture(
        MockProvider::scripted(&["Just prose, no command.", "done"]),
        |_| {},
    );
    let outcome = fx.runner.run_task("say hi").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            summary: "Just prose, no command.".to_string()
        }
    );

    // Prose alone never ends a task; the loop asks for the next action.
    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].last_user_content().contains("chat only"));

    let events = fx.events.lock().unwrap();
    assert!(matches!(&events[0], TaskEvent::Chat(t) if t == "Just prose, no command."));
}

#[tokio::test]
async fn done_sentinel_completes() {
    let mut fx = fixture(MockProvider::scripted(&["done"]), |_| {});
    let outcome = fx.runner.run_task("finish up").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(fx.provider.calls().len(), 1);
}

#[tokio::test]
async fn command_feedback_flows_into_next_prompt() {
    let mut fx = fixture(
        MockProvider::scripted(&[">>>\necho hi-there\n<<<", "done"]),
        |_| {},
    );
    let outcome = fx.runner.run_task("greet").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));

    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 2);
    let feedback = calls[1].last_user_content();
    assert!(feedback.contains("echo hi-there"));
    assert!(feedback.contains("success"));
    assert!(feedback.contains("hi-there"));

    use crate::session::store::SessionStore;
    let session = fx.store.get_or_create("root:main").await.unwrap();
    assert_eq!(session.history.len(), 1);
    assert!(session.history[0].success);
}

#[tokio::test]
async fn state_settles_with_the_outcome() {
    let mut fx = fixture(MockProvider::scripted(&["pause"]), |_| {});
    assert_eq!(fx.runner.state(), LoopState::Completed); // idle
    fx.runner.run_task("wait for me").await.unwrap();
    assert_eq!(fx.runner.state(), LoopState::AwaitingUser);

    fx.runner.interrupt().trigger();
    fx.runner.run_task("anything").await.unwrap();
    assert_eq!(fx.runner.state(), LoopState::Interrupted);
}

#[tokio::test]
async fn pause_sentinel_awaits_user() {
    let mut fx = fixture(MockProvider::scripted(&["pause"]), |_| {});
    let outcome = fx.runner.run_task("wait for me").await.unwrap();
    assert_eq!(outcome, TaskOutcome::AwaitingUser);
}

#[tokio::test]
async fn pause_inside_command_block_awaits_user() {
    let mut fx = fixture(MockProvider::scripted(&[">>>\npause\n<<<"]), |_| {});
    let outcome = fx.runner.run_task("hold on").await.unwrap();
    assert_eq!(outcome, TaskOutcome::AwaitingUser);
}

#[tokio::test]
async fn done_inside_command_block_completes() {
    let mut fx = fixture(
        MockProvider::scripted(&["Wrapping up.\n\n>>>\ndone\n<<<"]),
        |_| {},
    );
    let outcome = fx.runner.run_task("finish").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            summary: "Wrapping up.".to_string()
        }
    );
    assert_eq!(fx.provider.calls().len(), 1);
}

#[tokio::test]
async fn empty_reply_reprompts() {
    let mut fx = fixture(MockProvider::scripted(&["", "done"]), |_| {});
    let outcome = fx.runner.run_task("do the thing").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].last_user_content().contains("no message"));
}

#[tokio::test]
async fn iteration_cap_stops_the_loop() {
    let mut fx = fixture(
        MockProvider::scripted(&[">>>\necho a\n<<<", ">>>\necho b\n<<<"]),
        |c| c.task_loop.max_iterations = 2,
    );
    let outcome = fx.runner.run_task("loop forever").await.unwrap();
    match outcome {
        TaskOutcome::Completed { summary } => assert!(summary.contains("2 iterations")),
        other => panic!("expected Completed, got {:?}", other),
    }
    let events = fx.events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, TaskEvent::IterationCapReached { iterations: 2 }))
    );
}

#[tokio::test]
async fn forbidden_command_becomes_feedback() {
    let mut fx = fixture(MockProvider::scripted(&[">>>\nrm -rf /\n<<<", "done"]), |_| {});
    let outcome = fx.runner.run_task("clean up").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    let calls = fx.provider.calls();
    assert!(calls[1].last_user_content().contains("Forbidden command"));
}

#[tokio::test]
async fn oversized_command_gets_corrective_note() {
    let big = format!(">>>\n{}\n<<<", vec!["echo x"; 30].join("\n"));
    let mut fx = fixture(MockProvider::scripted(&[&big, "done"]), |_| {});
    fx.runner.run_task("write a script").await.unwrap();
    let calls = fx.provider.calls();
    let feedback = calls[1].last_user_content();
    assert!(feedback.contains("too long"));
    assert!(feedback.contains("limited to 25 lines"));

    // The constraint also lands in history as a system message.
    use crate::session::store::SessionStore;
    let session = fx.store.get_or_create("root:main").await.unwrap();
    assert!(
        session
            .messages
            .iter()
            .any(|m| m.role == "system" && m.content.contains("limited to 25 lines"))
    );
}

#[tokio::test]
async fn delegation_runs_child_and_returns_to_parent() {
    let mut fx = fixture(
        MockProvider::scripted(&[
            "agent helper: say hello",
            "Hello from the helper.",
            "done",
            "done",
        ]),
        |_| {},
    );
    let outcome = fx.runner.run_task("get a greeting").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(fx.runner.stack().depth(), 0);

    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 4);
    // Child turn ran under the helper's prompt with the delegated message.
    assert_eq!(calls[1].system_prompt, "You are helper.");
    assert_eq!(calls[1].last_user_content(), "say hello");
    // The parent's prompt after the child's sentinel carries its result.
    let feedback = calls[3].last_user_content();
    assert!(feedback.contains("helper"));
    assert!(feedback.contains("Hello from the helper."));

    let events = fx.events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, TaskEvent::DelegationStart { agent_id } if agent_id == "helper"))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, TaskEvent::DelegationFinished { agent_id } if agent_id == "helper"))
    );
}

#[tokio::test]
async fn delegation_archives_child_session() {
    let mut fx = fixture(
        MockProvider::scripted(&["agent helper: say hello", "Hello.", "done", "done"]),
        |_| {},
    );
    fx.runner.run_task("get a greeting").await.unwrap();

    use crate::session::store::SessionStore;
    let archives = fx.store.list_archives().await.unwrap();
    assert_eq!(archives.len(), 1);
    assert!(archives[0].contains("helper"));
}

#[tokio::test]
async fn delegated_pause_leaves_child_context_pushed() {
    let mut fx = fixture(
        MockProvider::scripted(&["agent helper: wait here", "pause"]),
        |_| {},
    );
    let outcome = fx.runner.run_task("hand off and wait").await.unwrap();
    assert_eq!(outcome, TaskOutcome::AwaitingUser);
    // The paused child stays active so the user can inspect or resume it.
    assert_eq!(fx.runner.stack().depth(), 1);
    assert_eq!(fx.runner.stack().current().agent_id, "helper");

    use crate::session::store::SessionStore;
    let archives = fx.store.list_archives().await.unwrap();
    assert!(archives.is_empty());
}

#[tokio::test]
async fn unknown_agent_reported_without_stack_change() {
    let mut fx = fixture(MockProvider::scripted(&["agent ghost: do it", "done"]), |_| {});
    let outcome = fx.runner.run_task("delegate badly").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(fx.runner.stack().depth(), 0);

    let calls = fx.provider.calls();
    let feedback = calls[1].last_user_content();
    assert!(feedback.contains("Delegation failed"));
    assert!(feedback.contains("helper")); // roster listed
}

#[tokio::test]
async fn pre_triggered_interrupt_short_circuits() {
    let mut fx = fixture(MockProvider::scripted(&["done"]), |_| {});
    fx.runner.interrupt().trigger();
    let outcome = fx.runner.run_task("anything").await.unwrap();
    assert_eq!(outcome, TaskOutcome::Interrupted);
    assert!(fx.provider.calls().is_empty());
}

#[tokio::test]
async fn interrupt_during_command_unwinds() {
    let mut fx = fixture(MockProvider::scripted(&[">>>\nsleep 30\n<<<"]), |_| {});
    let interrupt = fx.runner.interrupt();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        interrupt.trigger();
    });
    let start = std::time::Instant::now();
    let outcome = fx.runner.run_task("sleep a while").await.unwrap();
    assert_eq!(outcome, TaskOutcome::Interrupted);
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn interrupt_cancels_in_flight_model_call() {
    struct StalledProvider;

    #[async_trait]
    impl ChatProvider for StalledProvider {
        async fn chat(&self, _req: ChatRequest<'_>) -> anyhow::Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok("done".to_string())
        }

        fn default_model(&self) -> &str {
            "stalled"
        }
    }

    let workspace = tempfile::tempdir().unwrap();
    let home = tempfile::tempdir().unwrap();
    let config = Config {
        workspace: workspace.path().to_string_lossy().into_owned(),
        ..Config::default()
    };
    let stack = AgentStack::new(config).unwrap();
    let store = Arc::new(SessionManager::new(home.path()).unwrap());
    let mut runner = TaskRunner::new(
        stack,
        Arc::new(StalledProvider),
        store,
        InterruptFlag::new(),
    );

    let interrupt = runner.interrupt();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        interrupt.trigger();
    });
    let start = std::time::Instant::now();
    let outcome = runner.run_task("never answers").await.unwrap();
    assert_eq!(outcome, TaskOutcome::Interrupted);
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn recover_from_interrupt_returns_to_root() {
    let mut fx = fixture(MockProvider::scripted(&[]), |_| {});
    fx.runner.stack_mut().push("helper", false).unwrap();
    fx.runner.interrupt().trigger();

    fx.runner.recover_from_interrupt().await.unwrap();
    assert_eq!(fx.runner.stack().depth(), 0);
    assert!(!fx.runner.interrupt().is_interrupted());
}

#[tokio::test]
async fn model_failure_is_folded_into_next_prompt() {
    let mut fx = fixture(MockProvider::failing_first(1, &["done"]), |_| {});
    let outcome = fx.runner.run_task("carry on").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].last_user_content().contains("model call failed"));

    use crate::session::store::SessionStore;
    let session = fx.store.get_or_create("root:main").await.unwrap();
    assert!(
        session
            .messages
            .iter()
            .any(|m| m.role == "system" && m.content.contains("Model call failed"))
    );
}

#[tokio::test]
async fn unclosed_block_notes_surface_in_feedback() {
    let mut fx = fixture(
        MockProvider::scripted(&["here goes\n>>>\necho never closed", "done"]),
        |_| {},
    );
    fx.runner.run_task("try a command").await.unwrap();
    let calls = fx.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].last_user_content().contains("never closed with <<<"));
}
