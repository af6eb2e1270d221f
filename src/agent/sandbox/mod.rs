//! Command validation and execution under safety constraints: a deny-list of
//! forbidden prefixes, heredoc integrity, a line-count budget, a wall-clock
//! timeout, and interrupt-driven termination.

use crate::errors::{TaskmateError, TaskmateResult};
use crate::utils::subprocess::scrubbed_command;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::agent::interrupt::InterruptFlag;

/// Maximum combined stdout+stderr size before truncation.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1 MB

/// Output characters included in the feedback prompt for the next model turn.
const FEEDBACK_OUTPUT_CHARS: usize = 6000;

const PAUSED_MESSAGE: &str = "Task paused. Waiting for user input.";

/// How one `execute()` call ended. Exactly one status holds per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Paused,
    Empty,
    Forbidden,
    UnterminatedHeredoc,
    TooLong,
    Timeout,
    RuntimeError,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub paused: bool,
    pub interrupted: bool,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    fn failure(status: ExecutionStatus, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            paused: false,
            interrupted: false,
            status,
        }
    }
}

/// Executes one shell command at a time in a working directory, guarded by
/// pre-flight checks. Holds a kill handle so a concurrent interrupt can
/// terminate the in-flight process.
pub struct CommandSandbox {
    working_dir: PathBuf,
    /// Lower-cased deny-list entries.
    forbidden: Vec<String>,
    max_lines: usize,
    timeout_secs: u64,
    kill_signal: Notify,
}

impl CommandSandbox {
    pub fn new(
        working_dir: PathBuf,
        forbidden_commands: &[String],
        max_lines: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            working_dir,
            forbidden: forbidden_commands
                .iter()
                .map(|f| f.trim().to_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
            max_lines,
            timeout_secs,
            kill_signal: Notify::new(),
        }
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines
    }

    /// Terminate the in-flight execution, if any. Safe to call from another
    /// task; a no-op when nothing is running.
    pub fn kill(&self) {
        self.kill_signal.notify_waiters();
    }

    /// Whether the command matches the deny-list. The match is
    /// case-insensitive against the command with its first-line inline
    /// comment stripped: equal to an entry, or starting with an entry
    /// immediately followed by a boundary (whitespace, `;`, `|`, `&`).
    /// `rm -rf /etc` must not match the entry `rm -rf /`; `rm -rf / extra`
    /// and `rm -rf /; echo hi` must.
    pub fn is_forbidden(&self, command: &str) -> bool {
        let cleaned = strip_first_line_comment(command).trim().to_lowercase();
        for entry in &self.forbidden {
            if cleaned == *entry {
                return true;
            }
            if let Some(rest) = cleaned.strip_prefix(entry.as_str())
                && rest
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_whitespace() || matches!(c, ';' | '|' | '&'))
            {
                return true;
            }
        }
        false
    }

    /// Check a command against the sandbox rules without executing it.
    /// Checks run in a fixed order; the first violation wins.
    pub fn validate(&self, command: &str) -> TaskmateResult<()> {
        if command.trim().is_empty() {
            return Err(TaskmateError::EmptyCommand);
        }
        if self.is_forbidden(command) {
            return Err(TaskmateError::ForbiddenCommand(
                first_line(command).to_string(),
            ));
        }
        // Must be caught before spawning: an unterminated heredoc handed to
        // a real shell would wait on stdin indefinitely.
        if let Some(delimiter) = find_unterminated_heredoc(command) {
            return Err(TaskmateError::UnterminatedHeredoc { delimiter });
        }
        let line_count = command.lines().count();
        if line_count > self.max_lines {
            return Err(TaskmateError::CommandTooLong {
                line_count,
                max_lines: self.max_lines,
            });
        }
        Ok(())
    }

    /// Validate and execute one command. The shell is only spawned when
    /// every pre-flight check passes.
    pub async fn execute(&self, command: &str, interrupt: &InterruptFlag) -> ExecutionResult {
        // Comment strip applies to the checks only, never to what executes.
        let cleaned = strip_first_line_comment(command);
        let normalized = cleaned.trim().to_lowercase();

        if normalized == "pause" || normalized == "exit" {
            return ExecutionResult {
                success: true,
                output: PAUSED_MESSAGE.to_string(),
                error: None,
                paused: true,
                interrupted: false,
                status: ExecutionStatus::Paused,
            };
        }

        if let Err(e) = self.validate(command) {
            warn!("rejected command: {}", e);
            return ExecutionResult::failure(status_for(&e), e.to_string());
        }

        if interrupt.is_interrupted() {
            return ExecutionResult {
                interrupted: true,
                ..ExecutionResult::failure(ExecutionStatus::Interrupted, "interrupted")
            };
        }

        debug!("executing command ({} lines)", command.lines().count());
        match self.spawn_and_wait(command, interrupt).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::failure(
                ExecutionStatus::RuntimeError,
                format!("error executing command: {}", e),
            ),
        }
    }

    async fn spawn_and_wait(
        &self,
        command: &str,
        interrupt: &InterruptFlag,
    ) -> Result<ExecutionResult> {
        let mut cmd = scrubbed_command("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&self.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Dropping the wait future (interrupt/kill paths) must take the
        // process down with it.
        cmd.kill_on_drop(true);

        let child = cmd.spawn().context("Failed to spawn shell")?;
        let timeout = Duration::from_secs(self.timeout_secs);

        tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait_with_output()) => {
                match waited {
                    Ok(Ok(output)) => Ok(self.collect_output(&output)),
                    Ok(Err(e)) => Ok(ExecutionResult::failure(
                        ExecutionStatus::RuntimeError,
                        format!("error executing command: {}", e),
                    )),
                    Err(_) => {
                        warn!("command timed out after {}s", self.timeout_secs);
                        Ok(ExecutionResult::failure(
                            ExecutionStatus::Timeout,
                            TaskmateError::ExecutionTimeout {
                                timeout_secs: self.timeout_secs,
                            }
                            .to_string(),
                        ))
                    }
                }
            }
            _ = interrupt.cancelled() => {
                warn!("command terminated by interrupt");
                Ok(ExecutionResult {
                    interrupted: true,
                    ..ExecutionResult::failure(ExecutionStatus::Interrupted, "interrupted")
                })
            }
            _ = self.kill_signal.notified() => {
                warn!("command terminated by kill()");
                Ok(ExecutionResult {
                    interrupted: true,
                    ..ExecutionResult::failure(ExecutionStatus::Interrupted, "killed")
                })
            }
        }
    }

    fn collect_output(&self, output: &std::process::Output) -> ExecutionResult {
        let combined_len = output.stdout.len() + output.stderr.len();
        let truncated = combined_len > MAX_OUTPUT_BYTES;

        // Truncate raw bytes before UTF-8 conversion to bound memory.
        // Reserve at least 25% for stderr so error messages aren't lost.
        let stderr_reserve = MAX_OUTPUT_BYTES / 4;
        let stdout_max = MAX_OUTPUT_BYTES - stderr_reserve.min(output.stderr.len());
        let stdout_bytes = if output.stdout.len() > stdout_max {
            truncate_at_utf8_boundary(&output.stdout, stdout_max)
        } else {
            &output.stdout
        };
        let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout_bytes.len());
        let stderr_bytes = if output.stderr.len() > remaining {
            truncate_at_utf8_boundary(&output.stderr, remaining)
        } else {
            &output.stderr
        };

        let stdout = String::from_utf8_lossy(stdout_bytes);
        let stderr = String::from_utf8_lossy(stderr_bytes);

        let mut combined = String::new();
        if !stdout.is_empty() {
            combined.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push_str("\n--- stderr ---\n");
            }
            combined.push_str(&stderr);
        }
        if truncated {
            combined.push_str("\n[output truncated at 1MB]");
        }

        if output.status.success() {
            ExecutionResult {
                success: true,
                output: combined,
                error: None,
                paused: false,
                interrupted: false,
                status: ExecutionStatus::Success,
            }
        } else {
            ExecutionResult {
                success: false,
                output: combined.clone(),
                error: Some(
                    TaskmateError::ExecutionRuntime(format!(
                        "exited with {}",
                        output
                            .status
                            .code()
                            .map_or_else(|| "signal".to_string(), |c| c.to_string())
                    ))
                    .to_string(),
                ),
                paused: false,
                interrupted: false,
                status: ExecutionStatus::RuntimeError,
            }
        }
    }

    /// Build the deterministic feedback prompt fed back to the model after an
    /// execution. The model always sees structured, bounded text rather than
    /// raw unbounded output.
    pub fn build_feedback(command: &str, result: &ExecutionResult) -> String {
        let mut feedback = String::new();
        feedback.push_str("Executed command:\n");
        feedback.push_str(command);
        feedback.push_str("\n\nResult: ");
        feedback.push_str(if result.success { "success" } else { "failed" });
        feedback.push('\n');

        if !result.output.is_empty() {
            feedback.push_str("Output:\n");
            feedback.push_str(&bounded_chars(&result.output, FEEDBACK_OUTPUT_CHARS));
            feedback.push('\n');
        }
        if let Some(ref error) = result.error {
            feedback.push_str("Error: ");
            feedback.push_str(error);
            feedback.push('\n');
        }
        feedback.push_str(
            "\nContinue with the task. Reply with the next command in >>> <<< markers, \
             or 'done' if the task is complete.",
        );
        feedback
    }
}

fn status_for(err: &TaskmateError) -> ExecutionStatus {
    match err {
        TaskmateError::EmptyCommand => ExecutionStatus::Empty,
        TaskmateError::ForbiddenCommand(_) => ExecutionStatus::Forbidden,
        TaskmateError::UnterminatedHeredoc { .. } => ExecutionStatus::UnterminatedHeredoc,
        TaskmateError::CommandTooLong { .. } => ExecutionStatus::TooLong,
        TaskmateError::ExecutionTimeout { .. } => ExecutionStatus::Timeout,
        _ => ExecutionStatus::RuntimeError,
    }
}

/// Strip a trailing inline comment from the first line (text after the first
/// `#`). Used for validation only; the executed text is never mutated.
fn strip_first_line_comment(command: &str) -> String {
    match command.split_once('\n') {
        Some((first, rest)) => {
            let first = first.split('#').next().unwrap_or(first);
            format!("{}\n{}", first, rest)
        }
        None => command.split('#').next().unwrap_or(command).to_string(),
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or(command)
}

/// Find a heredoc opener (`<< [quote]IDENT[quote]`) with no later line
/// consisting solely of the identifier. Returns the unmatched delimiter.
/// `<<<` herestrings are not heredocs and are skipped.
fn find_unterminated_heredoc(command: &str) -> Option<String> {
    let lines: Vec<&str> = command.lines().collect();
    for (idx, line) in lines.iter().enumerate() {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i + 1 < bytes.len() {
            if bytes[i] == b'<' && bytes[i + 1] == b'<' {
                // Skip herestrings (<<<)
                if bytes.get(i + 2) == Some(&b'<') {
                    i += 3;
                    continue;
                }
                let mut j = i + 2;
                // <<- allows leading tabs on the closing line
                let dash_form = bytes.get(j) == Some(&b'-');
                if dash_form {
                    j += 1;
                }
                while bytes.get(j).is_some_and(u8::is_ascii_whitespace) {
                    j += 1;
                }
                let quote = match bytes.get(j) {
                    Some(&q @ (b'"' | b'\'')) => {
                        j += 1;
                        Some(q)
                    }
                    _ => None,
                };
                let start = j;
                while bytes
                    .get(j)
                    .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
                {
                    j += 1;
                }
                if j > start {
                    if let Some(q) = quote
                        && bytes.get(j) != Some(&q)
                    {
                        // Unclosed quote around the delimiter; not an opener
                        i = j;
                        continue;
                    }
                    let delimiter = &line[start..j];
                    let closed = lines[idx + 1..].iter().any(|l| {
                        if dash_form {
                            l.trim_start_matches('\t') == delimiter
                        } else {
                            *l == delimiter
                        }
                    });
                    if !closed {
                        return Some(delimiter.to_string());
                    }
                }
                i = j;
            } else {
                i += 1;
            }
        }
    }
    None
}

/// Truncate a byte slice at a UTF-8 character boundary, never splitting
/// a multi-byte character.
fn truncate_at_utf8_boundary(data: &[u8], max: usize) -> &[u8] {
    if max >= data.len() {
        return data;
    }
    let mut end = max;
    while end > 0 && (data[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    &data[..end]
}

fn bounded_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{}\n[output truncated]", truncated)
}
