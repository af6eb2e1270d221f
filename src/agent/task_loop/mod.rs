//! The task loop: feeds a task to the model, executes the actions it
//! replies with, folds the results back into the next prompt, and repeats
//! until a sentinel, a pause, an interrupt, or the iteration cap.

use crate::providers::base::{ChatProvider, ChatRequest, Message, RetryConfig};
use crate::session::store::SessionStore;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::agent::compaction;
use crate::agent::interrupt::InterruptFlag;
use crate::agent::parser::{self, Action, Sentinel};
use crate::agent::sandbox::{CommandSandbox, ExecutionStatus};
use crate::agent::stack::AgentStack;

const NO_ACTION_REPROMPT: &str = "Your reply contained no message, command, or \
delegation. Reply with the next shell command in >>> <<< markers, delegate \
with 'agent <id>: <message>', or 'done' if the task is complete.";

const CHAT_ONLY_REPROMPT: &str = "That reply was chat only. Continue the task \
with a shell command in >>> <<< markers, delegate with 'agent <id>: <message>', \
or reply 'done' if the task is complete.";

const UNCLOSED_BLOCK_NOTE: &str = "Note: your reply opened a >>> command block \
that was never closed with <<<. That text was treated as plain chat. Close \
every command block.";

/// Lifecycle of a task. `Running` and `AwaitingModel` alternate while the
/// loop is live; the other three are where a `run_task` call settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    AwaitingModel,
    AwaitingUser,
    Interrupted,
    Completed,
}

/// How one `run_task` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task finished (sentinel or iteration cap).
    Completed { summary: String },
    /// The model asked to hand control back to the user.
    AwaitingUser,
    /// A global interrupt fired; the caller unwinds the stack.
    Interrupted,
}

/// Progress notifications surfaced while a task runs. The CLI renders
/// them; tests collect them.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Chat(String),
    CommandStart(String),
    CommandFinished {
        command: String,
        success: bool,
        output: String,
    },
    DelegationStart {
        agent_id: String,
    },
    DelegationFinished {
        agent_id: String,
    },
    IterationCapReached {
        iterations: usize,
    },
}

pub type EventSink = Box<dyn Fn(&TaskEvent) + Send + Sync>;

/// Owns the agent stack and drives tasks through the model. One runner per
/// REPL or `task` invocation; delegation recurses through the same runner.
pub struct TaskRunner {
    stack: AgentStack,
    provider: Arc<dyn ChatProvider>,
    store: Arc<dyn SessionStore>,
    interrupt: InterruptFlag,
    retry: RetryConfig,
    state: LoopState,
    sink: EventSink,
}

impl TaskRunner {
    pub fn new(
        stack: AgentStack,
        provider: Arc<dyn ChatProvider>,
        store: Arc<dyn SessionStore>,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            stack,
            provider,
            store,
            interrupt,
            retry: RetryConfig::default(),
            state: LoopState::Completed,
            sink: Box::new(|_| {}),
        }
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn stack(&self) -> &AgentStack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut AgentStack {
        &mut self.stack
    }

    pub fn interrupt(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Where the most recent task settled (or what the loop is doing now,
    /// for observers on another task).
    pub fn state(&self) -> LoopState {
        self.state
    }

    fn emit(&self, event: TaskEvent) {
        (self.sink)(&event);
    }

    fn settle(&mut self, outcome: TaskOutcome) -> TaskOutcome {
        self.state = match &outcome {
            TaskOutcome::Completed { .. } => LoopState::Completed,
            TaskOutcome::AwaitingUser => LoopState::AwaitingUser,
            TaskOutcome::Interrupted => LoopState::Interrupted,
        };
        outcome
    }

    /// Unwind to the root context after an interrupt and clear the flag.
    /// Non-empty child sessions are archived on the way down.
    pub async fn recover_from_interrupt(&mut self) -> Result<()> {
        for context in self.stack.unwind() {
            let session = self.store.get_or_create(&context.session_key).await?;
            if !session.is_empty() {
                self.store.archive(&context.session_key).await?;
            }
        }
        self.interrupt.clear();
        Ok(())
    }

    /// Run one task against the active agent context. Returns when the
    /// model signals completion or pause, an interrupt fires, or the
    /// iteration cap is hit.
    pub async fn run_task(&mut self, task: &str) -> Result<TaskOutcome> {
        let session_key = self.stack.current().session_key.clone();
        let system_prompt = self.stack.current().system_prompt.clone();
        let max_iterations = self.stack.config().task_loop.max_iterations;
        let compaction_config = self.stack.config().task_loop.compaction.clone();

        let mut session = self.store.get_or_create(&session_key).await?;
        let mut pending_input = task.to_string();
        let mut last_chat = String::new();

        for iteration in 1..=max_iterations {
            self.state = LoopState::Running;
            if self.interrupt.is_interrupted() {
                return Ok(self.settle(TaskOutcome::Interrupted));
            }
            debug!(
                "iteration {}/{} for agent '{}'",
                iteration,
                max_iterations,
                self.stack.current().agent_id
            );

            session.add_message("user", &pending_input);
            compaction::compact(
                &compaction_config,
                self.provider.as_ref(),
                &mut session.messages,
            )
            .await;

            let request = ChatRequest {
                messages: session
                    .messages
                    .iter()
                    .map(|m| Message {
                        role: m.role.clone(),
                        content: m.content.clone(),
                    })
                    .collect(),
                system_prompt: &system_prompt,
                model: None,
            };
            self.state = LoopState::AwaitingModel;
            let provider = Arc::clone(&self.provider);
            let interrupt = self.interrupt.clone();
            let call = tokio::select! {
                reply = provider.chat_with_retry(request, Some(self.retry.clone())) => Some(reply),
                _ = interrupt.cancelled() => None,
            };
            let Some(result) = call else {
                debug!("model call cancelled by interrupt");
                self.store.save(&session).await?;
                return Ok(self.settle(TaskOutcome::Interrupted));
            };
            let reply = match result {
                Ok(reply) => {
                    self.state = LoopState::Running;
                    reply
                }
                Err(e) => {
                    if self.interrupt.is_interrupted() {
                        return Ok(self.settle(TaskOutcome::Interrupted));
                    }
                    self.state = LoopState::Running;
                    warn!("model call failed, folding into next prompt: {:#}", e);
                    session.add_message("system", format!("Model call failed: {:#}", e));
                    self.store.save(&session).await?;
                    pending_input =
                        "The previous model call failed. Continue the task.".to_string();
                    continue;
                }
            };

            session.add_message("assistant", &reply);
            self.store.save(&session).await?;

            if let Some(sentinel) = parser::detect_sentinel(&reply) {
                let outcome = match sentinel {
                    Sentinel::Pause => TaskOutcome::AwaitingUser,
                    Sentinel::Exit | Sentinel::Done => {
                        info!("task completed by sentinel");
                        TaskOutcome::Completed { summary: last_chat }
                    }
                };
                return Ok(self.settle(outcome));
            }

            let parsed = parser::parse(&reply);
            if parsed.actions.is_empty() {
                debug!("reply contained no actions, re-prompting");
                pending_input = NO_ACTION_REPROMPT.to_string();
                continue;
            }

            let mut feedback: Vec<String> = Vec::new();
            if parsed.has_warnings() {
                feedback.push(UNCLOSED_BLOCK_NOTE.to_string());
            }
            let mut acted = false;

            for action in &parsed.actions {
                if self.interrupt.is_interrupted() {
                    self.store.save(&session).await?;
                    return Ok(self.settle(TaskOutcome::Interrupted));
                }
                match action {
                    Action::Chat { text } => {
                        self.emit(TaskEvent::Chat(text.clone()));
                        last_chat = text.clone();
                    }
                    Action::Shell { content } => {
                        acted = true;
                        // `pause`/`exit` in a block short-circuit inside the
                        // sandbox; `done` ends the task here.
                        if parser::detect_sentinel(content) == Some(Sentinel::Done) {
                            self.store.save(&session).await?;
                            info!("task completed by sentinel");
                            return Ok(self.settle(TaskOutcome::Completed { summary: last_chat }));
                        }
                        let sandbox = Arc::clone(&self.stack.current().sandbox);
                        self.emit(TaskEvent::CommandStart(content.clone()));
                        let result = sandbox.execute(content, &self.interrupt).await;
                        if result.interrupted {
                            self.store.save(&session).await?;
                            return Ok(self.settle(TaskOutcome::Interrupted));
                        }
                        session.add_history_entry(content, result.success, &result.output);
                        self.emit(TaskEvent::CommandFinished {
                            command: content.clone(),
                            success: result.success,
                            output: result.output.clone(),
                        });
                        if result.paused {
                            self.store.save(&session).await?;
                            return Ok(self.settle(TaskOutcome::AwaitingUser));
                        }
                        feedback.push(CommandSandbox::build_feedback(content, &result));
                        if let Some(note) = correction_for(&result.status, &sandbox) {
                            session.add_message("system", &note);
                            feedback.push(note);
                        }
                    }
                    Action::Delegate { agent_id, message } => {
                        acted = true;
                        match self.delegate(agent_id, message, &mut session).await? {
                            DelegateOutcome::Feedback(summary) => feedback.push(summary),
                            DelegateOutcome::Suspend(outcome) => {
                                self.store.save(&session).await?;
                                return Ok(self.settle(outcome));
                            }
                        }
                        self.state = LoopState::Running;
                    }
                }
            }

            self.store.save(&session).await?;

            if !acted {
                if parsed.has_warnings() {
                    // The model tried to issue a command but never closed the
                    // block; re-prompt with the corrective note.
                    pending_input = feedback.join("\n\n");
                    continue;
                }
                // Chat-only reply. Only a sentinel (or the cap) ends a task,
                // so ask for the next actionable instruction.
                debug!("chat-only reply, re-prompting for an action");
                pending_input = CHAT_ONLY_REPROMPT.to_string();
                continue;
            }
            pending_input = feedback.join("\n\n");
        }

        warn!(
            "iteration cap ({}) reached for agent '{}', stopping",
            max_iterations,
            self.stack.current().agent_id
        );
        self.emit(TaskEvent::IterationCapReached {
            iterations: max_iterations,
        });
        Ok(self.settle(TaskOutcome::Completed {
            summary: format!(
                "Stopped after {} iterations without a completion signal.",
                max_iterations
            ),
        }))
    }

    /// Run a delegated subtask in a pushed child context. On normal
    /// completion the context is popped, its session archived, and the
    /// result summarized for the parent's next prompt. On pause or
    /// interrupt the context stays pushed for inspection and the outcome
    /// suspends the parent loop.
    async fn delegate(
        &mut self,
        agent_id: &str,
        message: &str,
        parent_session: &mut crate::session::manager::Session,
    ) -> Result<DelegateOutcome> {
        if let Err(e) = self.stack.push(agent_id, true) {
            warn!("delegation to '{}' failed: {:#}", agent_id, e);
            let roster = self.stack.registry().ids();
            return Ok(DelegateOutcome::Feedback(format!(
                "Delegation failed: {:#}. Available agents: {}",
                e,
                if roster.is_empty() {
                    "(none configured)".to_string()
                } else {
                    roster.join(", ")
                }
            )));
        }
        self.emit(TaskEvent::DelegationStart {
            agent_id: agent_id.to_string(),
        });
        info!("delegating to '{}': {}", agent_id, message);

        let outcome = Box::pin(self.run_task(message)).await?;
        match outcome {
            TaskOutcome::Completed { summary } => {
                let child = self.stack.pop()?;
                let child_session = self.store.get_or_create(&child.session_key).await?;
                if !child_session.is_empty() {
                    self.store.archive(&child.session_key).await?;
                }
                self.emit(TaskEvent::DelegationFinished {
                    agent_id: agent_id.to_string(),
                });
                let summary = if summary.is_empty() {
                    format!("Agent '{}' finished the subtask.", agent_id)
                } else {
                    format!("Agent '{}' finished: {}", agent_id, summary)
                };
                parent_session.add_history_entry(
                    format!("agent {}: {}", agent_id, message),
                    true,
                    &summary,
                );
                Ok(DelegateOutcome::Feedback(summary))
            }
            // Paused or interrupted children stay on the stack; the user
            // (or the interrupt unwind) decides what happens to them.
            other => {
                debug!("delegated agent '{}' suspended: {:?}", agent_id, other);
                Ok(DelegateOutcome::Suspend(other))
            }
        }
    }
}

enum DelegateOutcome {
    Feedback(String),
    Suspend(TaskOutcome),
}

/// Extra guidance appended after validation failures the model can fix
/// by reformatting its next command.
fn correction_for(status: &ExecutionStatus, sandbox: &CommandSandbox) -> Option<String> {
    match status {
        ExecutionStatus::TooLong => Some(format!(
            "Commands are limited to {} lines. Break the work into smaller \
             sequential command blocks.",
            sandbox.max_lines()
        )),
        ExecutionStatus::UnterminatedHeredoc => Some(
            "Every heredoc must be closed by a line containing only its \
             delimiter before the block ends."
                .to_string(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
