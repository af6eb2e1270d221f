//! Response parsing: turns a raw model reply into an ordered list of typed
//! actions (chat text, shell command blocks, agent delegations).
//!
//! Command blocks are delimited by a `>>>` / `<<<` marker pair. The grammar
//! is a single left-to-right scan with no backtracking; an opening marker
//! with no matching close degrades to chat text plus a diagnostic rather
//! than dropping input.

use regex::Regex;
use std::sync::LazyLock;

pub const BLOCK_OPEN: &str = ">>>";
pub const BLOCK_CLOSE: &str = "<<<";

/// Characters of an unclosed block kept in the diagnostic preview.
const UNCLOSED_PREVIEW_CHARS: usize = 80;

static DELEGATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*agent\s+([A-Za-z0-9_-]+):?\s+(\S.*)$").expect("delegation regex compiles")
});

/// One parsed unit of model-reply intent, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Chat { text: String },
    Shell { content: String },
    Delegate { agent_id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Chat,
    Shell,
    Delegate,
}

/// An opening marker with no matching close. Recoverable: the dangling text
/// is reprocessed as chat, this record just surfaces the warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnclosedBlock {
    /// Byte offset of the opening marker in the reply.
    pub offset: usize,
    /// Bounded preview of the dangling text.
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub unclosed_blocks: Vec<UnclosedBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseResult {
    pub actions: Vec<Action>,
    /// Flattened `Shell` contents, in document order.
    pub commands: Vec<String>,
    pub primary_type: ActionKind,
    pub diagnostics: Diagnostics,
}

impl ParseResult {
    pub fn has_warnings(&self) -> bool {
        !self.diagnostics.unclosed_blocks.is_empty()
    }
}

/// Reserved reply values signaling the task loop to stop or suspend.
/// Detected by the loop, not the parser; the normalizer lives here because
/// it shares the marker-stripping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Pause,
    Exit,
    Done,
}

/// Detect a completion sentinel: `exit`/`pause`/`done`, case-insensitive,
/// optionally wrapped in the block markers.
pub fn detect_sentinel(text: &str) -> Option<Sentinel> {
    let mut t = text.trim();
    if let Some(stripped) = t.strip_prefix(BLOCK_OPEN)
        && let Some(stripped) = stripped.strip_suffix(BLOCK_CLOSE)
    {
        t = stripped.trim();
    }
    match t.to_ascii_lowercase().as_str() {
        "pause" => Some(Sentinel::Pause),
        "exit" => Some(Sentinel::Exit),
        "done" => Some(Sentinel::Done),
        _ => None,
    }
}

/// Parse a raw model reply into ordered actions. Pure function of the text.
pub fn parse(response: &str) -> ParseResult {
    let mut actions = Vec::new();
    let mut diagnostics = Diagnostics::default();
    let mut cursor = 0;

    while let Some(rel_open) = response[cursor..].find(BLOCK_OPEN) {
        let open = cursor + rel_open;
        parse_chat_segment(&response[cursor..open], &mut actions);

        let body_start = open + BLOCK_OPEN.len();
        match response[body_start..].find(BLOCK_CLOSE) {
            Some(rel_close) => {
                let close = body_start + rel_close;
                let content = response[body_start..close].trim();
                if !content.is_empty() {
                    actions.push(Action::Shell {
                        content: content.to_string(),
                    });
                }
                cursor = close + BLOCK_CLOSE.len();
            }
            None => {
                // Dangling open marker: record it, then reprocess the tail
                // (marker included) as chat so nothing is silently dropped.
                let dangling = &response[open..];
                diagnostics.unclosed_blocks.push(UnclosedBlock {
                    offset: open,
                    preview: bounded_preview(dangling),
                });
                parse_chat_segment(dangling, &mut actions);
                cursor = response.len();
                break;
            }
        }
    }

    if cursor < response.len() {
        parse_chat_segment(&response[cursor..], &mut actions);
    }

    let commands: Vec<String> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Shell { content } => Some(content.clone()),
            _ => None,
        })
        .collect();

    let primary_type = if !commands.is_empty() {
        ActionKind::Shell
    } else if actions
        .iter()
        .any(|a| matches!(a, Action::Delegate { .. }))
    {
        ActionKind::Delegate
    } else {
        ActionKind::Chat
    };

    ParseResult {
        actions,
        commands,
        primary_type,
        diagnostics,
    }
}

/// Split a chat segment into `Chat` and `Delegate` actions. Delegation lines
/// and blank lines flush the pending chat buffer; everything else accumulates.
fn parse_chat_segment(segment: &str, actions: &mut Vec<Action>) {
    let mut buffer: Vec<&str> = Vec::new();

    for line in segment.lines() {
        if let Some(caps) = DELEGATION_RE.captures(line) {
            flush_chat(&mut buffer, actions);
            actions.push(Action::Delegate {
                agent_id: caps[1].to_string(),
                message: caps[2].trim().to_string(),
            });
        } else if line.trim().is_empty() {
            flush_chat(&mut buffer, actions);
        } else {
            buffer.push(line);
        }
    }
    flush_chat(&mut buffer, actions);
}

fn flush_chat(buffer: &mut Vec<&str>, actions: &mut Vec<Action>) {
    if buffer.is_empty() {
        return;
    }
    let text = buffer.join("\n").trim().to_string();
    buffer.clear();
    if !text.is_empty() {
        actions.push(Action::Chat { text });
    }
}

fn bounded_preview(text: &str) -> String {
    let mut preview: String = text.chars().take(UNCLOSED_PREVIEW_CHARS).collect();
    if text.chars().count() > UNCLOSED_PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}
