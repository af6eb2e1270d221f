use crate::agent::interrupt::InterruptFlag;
use crate::agent::stack::AgentStack;
use crate::agent::task_loop::{TaskEvent, TaskOutcome, TaskRunner};
use crate::config::{Config, get_config_path, load_config};
use crate::providers::OpenAIProvider;
use crate::session::{SessionManager, SessionStore};
use crate::utils::{ensure_dir, get_taskmate_home};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::debug;

fn render_event(event: &TaskEvent) {
    match event {
        TaskEvent::Chat(text) => println!("\u{1f916} {}", text),
        TaskEvent::CommandStart(command) => {
            for line in command.lines() {
                println!("  $ {}", line);
            }
        }
        TaskEvent::CommandFinished {
            success, output, ..
        } => {
            for line in output.lines() {
                println!("  {}", line);
            }
            if !success {
                println!("  (command failed)");
            }
        }
        TaskEvent::DelegationStart { agent_id } => {
            println!("\u{2192} delegating to '{}'", agent_id);
        }
        TaskEvent::DelegationFinished { agent_id } => {
            println!("\u{2190} agent '{}' returned", agent_id);
        }
        TaskEvent::IterationCapReached { iterations } => {
            println!("Stopped after {} iterations without completion.", iterations);
        }
    }
}

fn build_runner(config: Config) -> Result<(TaskRunner, Arc<SessionManager>)> {
    ensure_dir(config.workspace_path())?;
    let home = get_taskmate_home()?;
    let store = Arc::new(SessionManager::new(&home)?);
    let provider = Arc::new(OpenAIProvider::new(&config.provider));
    let stack = AgentStack::new(config)?;
    let runner = TaskRunner::new(stack, provider, store.clone(), InterruptFlag::new())
        .with_sink(Box::new(|event| render_event(event)));
    Ok((runner, store))
}

/// Forward Ctrl+C to the interrupt flag for the life of the process.
fn spawn_interrupt_watcher(interrupt: InterruptFlag) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                break;
            }
            debug!("received Ctrl+C, triggering interrupt");
            interrupt.trigger();
        }
    });
}

async fn finish(runner: &mut TaskRunner, outcome: TaskOutcome) -> Result<()> {
    match outcome {
        TaskOutcome::Completed { summary } => {
            if !summary.is_empty() {
                println!("\u{2714} {}", summary);
            }
        }
        TaskOutcome::AwaitingUser => {
            println!("\u{23f8} Paused. Waiting for your input.");
        }
        TaskOutcome::Interrupted => {
            runner.recover_from_interrupt().await?;
            println!("\u{2715} Interrupted.");
        }
    }
    Ok(())
}

pub(super) async fn task(
    config_path: Option<&Path>,
    task: &str,
    agent: Option<&str>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let (mut runner, _store) = build_runner(config)?;
    spawn_interrupt_watcher(runner.interrupt());

    if let Some(agent_id) = agent {
        runner.stack_mut().push(agent_id, false)?;
    }
    let outcome = runner.run_task(task).await?;
    finish(&mut runner, outcome).await
}

pub(super) async fn repl(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let (mut runner, store) = build_runner(config)?;
    spawn_interrupt_watcher(runner.interrupt());

    println!("taskmate {} \u{2014} type a task, /help for commands", crate::VERSION);
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    loop {
        // An interrupt that fired while idle at the prompt still unwinds.
        if runner.interrupt().is_interrupted() {
            runner.recover_from_interrupt().await?;
            println!("\u{2715} Interrupted.");
        }

        // Nested contexts indent their prompt by depth.
        let context = runner.stack().current();
        print!("{}[{}]> ", "  ".repeat(context.depth), context.agent_id);
        use std::io::Write;
        std::io::stdout().flush()?;
        let interrupt = runner.interrupt();
        let Some(line) = read_repl_line(&mut stdin, &interrupt).await? else {
            break; // EOF
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if let Some(command) = input.strip_prefix('/') {
            if !handle_slash_command(&mut runner, &store, command).await? {
                break;
            }
            continue;
        }

        let outcome = runner.run_task(input).await?;
        finish(&mut runner, outcome).await?;
    }
    Ok(())
}

/// Read one line at the prompt, abandoning the wait when the interrupt
/// fires (the empty result falls through to the unwind check at the top
/// of the loop). `None` means EOF.
pub(super) async fn read_repl_line<R>(
    reader: &mut R,
    interrupt: &InterruptFlag,
) -> Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut input = String::new();
    tokio::select! {
        read = reader.read_line(&mut input) => {
            if read? == 0 { Ok(None) } else { Ok(Some(input)) }
        }
        _ = interrupt.cancelled() => {
            println!();
            Ok(Some(String::new()))
        }
    }
}

/// Returns false when the REPL should exit.
async fn handle_slash_command(
    runner: &mut TaskRunner,
    store: &Arc<SessionManager>,
    command: &str,
) -> Result<bool> {
    let mut parts = command.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match name {
        "quit" | "exit" => return Ok(false),
        "help" => {
            println!("/agent <id> [task]  switch to a named agent (and optionally run a task)");
            println!("/pop                return to the previous agent");
            println!("/agents             list configured agents");
            println!("/history            show executed commands for this context");
            println!("/quit               exit");
        }
        "agents" => {
            let ids = runner.stack().registry().ids();
            if ids.is_empty() {
                println!("No agents configured.");
            } else {
                for id in ids {
                    println!("  {}", id);
                }
            }
        }
        "agent" => {
            let mut args = rest.splitn(2, char::is_whitespace);
            let agent_id = args.next().unwrap_or("");
            if agent_id.is_empty() {
                println!("usage: /agent <id> [task]");
                return Ok(true);
            }
            let task = args.next().map(str::trim);
            // A one-shot task returns to the previous agent when it
            // completes; a bare switch is persistent.
            match runner.stack_mut().push(agent_id, task.is_some()) {
                Ok(()) => {
                    println!("Switched to agent '{}'.", agent_id);
                    if let Some(task) = task {
                        let outcome = runner.run_task(task).await?;
                        let completed = matches!(outcome, TaskOutcome::Completed { .. });
                        finish(runner, outcome).await?;
                        if completed && runner.stack().current().auto_pop_on_complete {
                            let popped = runner.stack_mut().pop()?;
                            let session = store.get_or_create(&popped.session_key).await?;
                            if !session.is_empty() {
                                store.archive(&popped.session_key).await?;
                            }
                            println!(
                                "Back to '{}'.",
                                runner.stack().current().agent_id
                            );
                        }
                    }
                }
                Err(e) => println!("{:#}", e),
            }
        }
        "pop" => match runner.stack_mut().pop() {
            Ok(popped) => {
                let session = store.get_or_create(&popped.session_key).await?;
                if !session.is_empty() {
                    store.archive(&popped.session_key).await?;
                }
                println!(
                    "Left agent '{}', back to '{}'.",
                    popped.agent_id,
                    runner.stack().current().agent_id
                );
            }
            Err(e) => println!("{:#}", e),
        },
        "history" => {
            let key = runner.stack().current().session_key.clone();
            let session = store.get_or_create(&key).await?;
            if session.history.is_empty() {
                println!("No commands executed yet.");
            } else {
                for entry in &session.history {
                    let mark = if entry.success { "\u{2714}" } else { "\u{2715}" };
                    println!("  {} {}", mark, entry.command.lines().next().unwrap_or(""));
                }
            }
        }
        _ => println!("Unknown command '/{}'. Try /help.", name),
    }
    Ok(true)
}

pub(super) async fn sessions_list() -> Result<()> {
    let home = get_taskmate_home()?;
    let store = SessionManager::new(&home)?;
    let archives = store.list_archives().await?;
    if archives.is_empty() {
        println!("No archived sessions.");
    } else {
        for id in archives {
            println!("  {}", id);
        }
    }
    Ok(())
}

pub(super) async fn sessions_clear(yes: bool) -> Result<()> {
    if !yes {
        use std::io::{BufRead, Write};
        print!("Delete all sessions and archives? [y/N] ");
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }
    let home = get_taskmate_home()?;
    let store = SessionManager::new(&home)?;
    store.clear_all().await?;
    println!("All sessions cleared.");
    Ok(())
}

pub(super) fn status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let home = get_taskmate_home()?;
    let resolved_path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };

    println!("taskmate {}", crate::VERSION);
    println!("  config:     {}", resolved_path.display());
    println!("  home:       {}", home.display());
    println!("  workspace:  {}", config.workspace_path().display());
    println!("  model:      {}", config.provider.model);
    println!(
        "  api key:    {}",
        if config.provider.api_key.is_empty() {
            "(not set)"
        } else {
            "configured"
        }
    );
    println!(
        "  sandbox:    max {} lines, {}s timeout, {} forbidden entries",
        config.sandbox.max_command_lines,
        config.sandbox.exec_timeout,
        config.sandbox.effective_forbidden().len()
    );
    println!(
        "  loop:       max {} iterations, compaction {}",
        config.task_loop.max_iterations,
        if config.task_loop.compaction.enabled {
            "on"
        } else {
            "off"
        }
    );
    let mut agents: Vec<&String> = config.agents.keys().collect();
    agents.sort();
    if agents.is_empty() {
        println!("  agents:     (none configured)");
    } else {
        println!(
            "  agents:     {}",
            agents
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let sessions_dir = home.join("sessions");
    if sessions_dir.exists() {
        let count = std::fs::read_dir(&sessions_dir)
            .context("Failed to read sessions directory")?
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .count();
        println!("  sessions:   {} active", count);
    }
    Ok(())
}
