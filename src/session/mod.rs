pub mod manager;
pub mod store;

pub use manager::{HistoryEntry, MessageData, Session, SessionManager};
pub use store::SessionStore;
