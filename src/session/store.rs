use crate::session::Session;
use anyhow::Result;
use async_trait::async_trait;

/// Trait for session storage backends.
/// The core only requires ordered append and full-history read-back;
/// archival operations shelve a conversation without losing it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get or create a session with the given key.
    async fn get_or_create(&self, key: &str) -> Result<Session>;

    /// Save a session.
    async fn save(&self, session: &Session) -> Result<()>;

    /// Move the session's file into the archive and drop it from the
    /// active set. No-op for sessions that were never saved.
    async fn archive(&self, key: &str) -> Result<Option<String>>;

    /// List archive ids, newest first.
    async fn list_archives(&self) -> Result<Vec<String>>;

    /// Restore an archived conversation as the session for `key`.
    async fn switch_to_archive(&self, key: &str, archive_id: &str) -> Result<Session>;

    /// Remove all sessions and archives.
    async fn clear_all(&self) -> Result<()>;
}
