mod subcommands;


use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taskmate")]
#[command(about = "Agentic command-line assistant")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (default: $TASKMATE_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session with the assistant
    Repl,
    /// Run a single task to completion and exit
    Task {
        /// The task to perform
        task: String,
        /// Run the task under a named agent instead of the root context
        #[arg(long)]
        agent: Option<String>,
    },
    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        cmd: SessionCommands,
    },
    /// Show configuration and workspace status
    Status,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List archived sessions, newest first
    List,
    /// Delete all sessions and archives
    Clear {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Repl => {
            subcommands::repl(config_path).await?;
        }
        Commands::Task { task, agent } => {
            subcommands::task(config_path, &task, agent.as_deref()).await?;
        }
        Commands::Sessions { cmd } => match cmd {
            SessionCommands::List => {
                subcommands::sessions_list().await?;
            }
            SessionCommands::Clear { yes } => {
                subcommands::sessions_clear(yes).await?;
            }
        },
        Commands::Status => {
            subcommands::status(config_path)?;
        }
    }
    Ok(())
}
