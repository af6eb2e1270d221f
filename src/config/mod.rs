mod loader;
mod schema;

pub use loader::{get_config_path, load_config};
pub use schema::{
    AgentDef, CompactionConfig, Config, DEFAULT_FORBIDDEN_COMMANDS, LoopConfig, ProviderConfig,
    SandboxConfig,
};
