use crate::session::store::SessionStore;
use crate::utils::{atomic_write, ensure_dir, safe_filename};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

const MAX_CACHED_SESSIONS: usize = 32;
const MAX_SESSION_MESSAGES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<MessageData>,
    /// Ordered record of executed commands and their outcomes.
    pub history: Vec<HistoryEntry>,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "chrono::Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageData {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub success: bool,
    pub output: String,
    pub timestamp: String,
}

impl Session {
    pub fn new(key: String) -> Self {
        Self {
            key,
            messages: Vec::new(),
            history: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(MessageData {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
        });
        self.updated_at = Utc::now();

        // Prune oldest messages
        if self.messages.len() > MAX_SESSION_MESSAGES {
            let drain_count = self.messages.len() - MAX_SESSION_MESSAGES;
            self.messages.drain(..drain_count);
        }
    }

    pub fn add_history_entry(
        &mut self,
        command: impl Into<String>,
        success: bool,
        output: impl Into<String>,
    ) {
        self.history.push(HistoryEntry {
            command: command.into(),
            success,
            output: output.into(),
            timestamp: Utc::now().to_rfc3339(),
        });
        self.updated_at = Utc::now();
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.history.is_empty()
    }
}

/// JSONL-file session storage under `<home>/sessions/`, with archives in
/// `<home>/sessions/archive/`. One file per session key; first line is a
/// metadata record, then message and history records in order.
pub struct SessionManager {
    sessions_dir: PathBuf,
    archive_dir: PathBuf,
    cache: Mutex<LruCache<String, Session>>,
}

impl SessionManager {
    pub fn new(home: &std::path::Path) -> Result<Self> {
        let sessions_dir = ensure_dir(home.join("sessions"))?;
        let archive_dir = ensure_dir(sessions_dir.join("archive"))?;
        Ok(Self {
            sessions_dir,
            archive_dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_SESSIONS).expect("MAX_CACHED_SESSIONS must be > 0"),
            )),
        })
    }

    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key = safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(format!("{}.jsonl", safe_key))
    }

    fn serialize(session: &Session) -> Result<String> {
        let mut content = String::new();
        let metadata_line = serde_json::json!({
            "_type": "metadata",
            "created_at": session.created_at.to_rfc3339(),
            "updated_at": session.updated_at.to_rfc3339(),
            "metadata": session.metadata,
        });
        content.push_str(&serde_json::to_string(&metadata_line)?);
        content.push('\n');

        for msg in &session.messages {
            content.push_str(&serde_json::to_string(&serde_json::json!({
                "role": msg.role,
                "content": msg.content,
                "timestamp": msg.timestamp,
            }))?);
            content.push('\n');
        }
        for entry in &session.history {
            content.push_str(&serde_json::to_string(&serde_json::json!({
                "_type": "history",
                "command": entry.command,
                "success": entry.success,
                "output": entry.output,
                "timestamp": entry.timestamp,
            }))?);
            content.push('\n');
        }
        Ok(content)
    }

    fn deserialize(key: &str, content: &str) -> Result<Session> {
        let mut messages = Vec::new();
        let mut history = Vec::new();
        let mut metadata = HashMap::new();
        let mut created_at = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let data: Value =
                serde_json::from_str(line).with_context(|| "Failed to parse session JSON line")?;

            match data.get("_type").and_then(Value::as_str) {
                Some("metadata") => {
                    if let Some(meta) = data.get("metadata").and_then(|v| v.as_object()) {
                        for (k, v) in meta {
                            metadata.insert(k.clone(), v.clone());
                        }
                    }
                    if let Some(ts) = data.get("created_at").and_then(|v| v.as_str()) {
                        created_at = DateTime::parse_from_rfc3339(ts)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc));
                    }
                }
                Some("history") => {
                    history.push(HistoryEntry {
                        command: str_field(&data, "command"),
                        success: data.get("success").and_then(Value::as_bool).unwrap_or(false),
                        output: str_field(&data, "output"),
                        timestamp: str_field(&data, "timestamp"),
                    });
                }
                _ => {
                    messages.push(MessageData {
                        role: str_field(&data, "role"),
                        content: str_field(&data, "content"),
                        timestamp: str_field(&data, "timestamp"),
                    });
                }
            }
        }

        // Prune on load
        if messages.len() > MAX_SESSION_MESSAGES {
            let drain_count = messages.len() - MAX_SESSION_MESSAGES;
            messages.drain(..drain_count);
        }

        Ok(Session {
            key: key.to_string(),
            messages,
            history,
            created_at: created_at.unwrap_or_else(Utc::now),
            updated_at: Utc::now(),
            metadata,
        })
    }

    fn load(&self, key: &str) -> Result<Option<Session>> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        Ok(Some(Self::deserialize(key, &content)?))
    }
}

fn str_field(data: &Value, field: &str) -> String {
    data.get(field)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[async_trait]
impl SessionStore for SessionManager {
    async fn get_or_create(&self, key: &str) -> Result<Session> {
        let cached = {
            let mut cache = self.cache.lock().await;
            cache.get(key).cloned()
        };
        if let Some(session) = cached {
            return Ok(session);
        }

        let session = self
            .load(key)?
            .unwrap_or_else(|| Session::new(key.to_string()));

        {
            let mut cache = self.cache.lock().await;
            // Double-check in case another task loaded it
            if let Some(existing) = cache.get(key) {
                return Ok(existing.clone());
            }
            cache.put(key.to_string(), session.clone());
        }
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let content = Self::serialize(session)?;
        atomic_write(&self.session_path(&session.key), &content)?;
        self.cache
            .lock()
            .await
            .put(session.key.clone(), session.clone());
        Ok(())
    }

    async fn archive(&self, key: &str) -> Result<Option<String>> {
        self.cache.lock().await.pop(key);
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let safe_key = safe_filename(&key.replace(':', "_"));
        let archive_id = format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), safe_key);
        let dest = self.archive_dir.join(format!("{}.jsonl", archive_id));
        fs::rename(&path, &dest)
            .with_context(|| format!("Failed to archive session to {}", dest.display()))?;
        debug!("archived session '{}' as {}", key, archive_id);
        Ok(Some(archive_id))
    }

    async fn list_archives(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.archive_dir)
            .with_context(|| "Failed to read archive directory")?
        {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".jsonl") {
                ids.push(id.to_string());
            }
        }
        // Archive ids start with a sortable timestamp
        ids.sort();
        ids.reverse();
        Ok(ids)
    }

    async fn switch_to_archive(&self, key: &str, archive_id: &str) -> Result<Session> {
        let src = self
            .archive_dir
            .join(format!("{}.jsonl", safe_filename(archive_id)));
        if !src.exists() {
            anyhow::bail!("archive '{}' not found", archive_id);
        }
        let content = fs::read_to_string(&src)
            .with_context(|| format!("Failed to read archive: {}", src.display()))?;
        let mut session = Self::deserialize(key, &content)?;
        session.key = key.to_string();
        self.save(&session).await?;
        Ok(session)
    }

    async fn clear_all(&self) -> Result<()> {
        self.cache.lock().await.clear();
        for dir in [&self.sessions_dir, &self.archive_dir] {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.path().extension().is_some_and(|e| e == "jsonl") {
                    fs::remove_file(entry.path())?;
                }
            }
        }
        Ok(())
    }
}
