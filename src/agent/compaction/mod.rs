//! Conversation compaction: when a session's estimated token count crosses
//! the configured threshold, fold older messages into a model-written
//! summary, keeping the most recent turns verbatim. If the summarization
//! call fails, fall back to plain truncation so the loop never stalls.

use crate::config::CompactionConfig;
use crate::providers::base::{ChatProvider, ChatRequest, Message};
use crate::session::manager::MessageData;
use chrono::Utc;
use tracing::{debug, info, warn};

/// Rough chars-per-token ratio for English plus shell output.
const CHARS_PER_TOKEN: usize = 4;

/// Messages at the head always preserved by the truncation fallback (the
/// task statement and its first response carry the task definition).
const FALLBACK_HEAD: usize = 2;

const SUMMARY_PROMPT: &str = "Summarize the following conversation between a \
user and a command-line assistant. Preserve: the original task, commands that \
were run and their key outcomes, current state of the work, and anything still \
pending. Be concise; output only the summary.";

pub fn estimate_tokens(messages: &[MessageData]) -> usize {
    messages
        .iter()
        .map(|m| (m.role.len() + m.content.len()) / CHARS_PER_TOKEN + 1)
        .sum()
}

pub fn needs_compaction(config: &CompactionConfig, messages: &[MessageData]) -> bool {
    config.enabled
        && messages.len() > config.keep_recent + FALLBACK_HEAD
        && estimate_tokens(messages) > config.threshold_tokens
}

/// Compact `messages` in place. Older messages are replaced by one summary
/// message; the last `keep_recent` stay verbatim. Never fails: a failed
/// summarization call degrades to truncation.
pub async fn compact(
    config: &CompactionConfig,
    provider: &dyn ChatProvider,
    messages: &mut Vec<MessageData>,
) {
    if !needs_compaction(config, messages) {
        return;
    }
    let split = messages.len() - config.keep_recent;
    let (older, recent) = messages.split_at(split);
    debug!(
        "compacting {} of {} messages (~{} tokens)",
        older.len(),
        messages.len(),
        estimate_tokens(messages)
    );

    match summarize(provider, older).await {
        Ok(summary) => {
            let mut compacted = vec![MessageData {
                role: "system".to_string(),
                content: format!("[Earlier conversation, summarized]\n{}", summary),
                timestamp: Utc::now().to_rfc3339(),
            }];
            compacted.extend_from_slice(recent);
            info!(
                "compacted session: {} messages -> {}",
                split + recent.len(),
                compacted.len()
            );
            *messages = compacted;
        }
        Err(e) => {
            warn!("summarization failed, falling back to truncation: {:#}", e);
            truncate_fallback(config, messages);
        }
    }
}

async fn summarize(provider: &dyn ChatProvider, older: &[MessageData]) -> anyhow::Result<String> {
    let mut transcript = String::new();
    for msg in older {
        transcript.push_str(&msg.role);
        transcript.push_str(": ");
        transcript.push_str(&msg.content);
        transcript.push('\n');
    }
    let request = ChatRequest {
        messages: vec![Message::user(transcript)],
        system_prompt: SUMMARY_PROMPT,
        model: None,
    };
    let summary = provider.chat_with_retry(request, None).await?;
    if summary.trim().is_empty() {
        anyhow::bail!("model returned an empty summary");
    }
    Ok(summary.trim().to_string())
}

/// Keep the first `FALLBACK_HEAD` and last `keep_recent` messages, with a
/// marker noting the elision.
fn truncate_fallback(config: &CompactionConfig, messages: &mut Vec<MessageData>) {
    if messages.len() <= FALLBACK_HEAD + config.keep_recent {
        return;
    }
    let elided = messages.len() - FALLBACK_HEAD - config.keep_recent;
    let tail_start = messages.len() - config.keep_recent;
    let mut result: Vec<MessageData> = messages[..FALLBACK_HEAD].to_vec();
    result.push(MessageData {
        role: "system".to_string(),
        content: format!("[{} earlier messages elided]", elided),
        timestamp: Utc::now().to_rfc3339(),
    });
    result.extend_from_slice(&messages[tail_start..]);
    *messages = result;
}
