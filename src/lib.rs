pub mod agent;
pub mod cli;
pub mod config;
pub mod errors;
pub mod providers;
pub mod session;
pub mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
