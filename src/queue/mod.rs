use crate::error::StoreError;
use crate::processed::ProcessedSet;
use crate::store::{now_iso8601, read_json_file, write_json_file};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// The producer keeps only this many of the most recent entries.
pub const MAX_QUEUE_LEN: usize = 100;

const MAX_COMMAND_CHARS: usize = 500;

const REMOVED: &str = "[REMOVED]";

// Order matters: `>` is handled before `>>`.
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf", "sudo", "su ", "chmod 777", "wget", "curl", ">", ">>", "|", "&", ";", "$(", "`",
    "eval", "exec",
];

/// Identifier handed over by the producer. Chat platforms emit these as
/// JSON numbers; anything else is kept as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpaqueId {
    Number(serde_json::Number),
    Text(String),
}

impl OpaqueId {
    /// Interpret a command-line value: all-digit values become numbers.
    pub fn parse_arg(value: &str) -> Self {
        match value.parse::<u64>() {
            Ok(n) => OpaqueId::Number(n.into()),
            Err(_) => OpaqueId::Text(value.to_string()),
        }
    }
}

impl fmt::Display for OpaqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpaqueId::Number(n) => write!(f, "{n}"),
            OpaqueId::Text(s) => f.write_str(s),
        }
    }
}

/// Identity of a command: `"<timestamp>_<message_id>"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(String);

impl CommandId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        CommandId(s.to_string())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submitted instruction as stored in the queue file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub timestamp: String,
    pub message_id: OpaqueId,
    /// Sanitized text passed to the external tool.
    pub command: String,
    /// Text as received, kept for audit.
    #[serde(default)]
    pub original_command: Option<String>,
    #[serde(default)]
    pub user_id: Option<OpaqueId>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub channel_id: Option<OpaqueId>,
    #[serde(default)]
    pub guild_id: Option<OpaqueId>,
}

/// Producer-side context attached to a new entry.
#[derive(Debug, Clone, Default)]
pub struct Submitter {
    pub user_id: Option<OpaqueId>,
    pub user_name: Option<String>,
    pub channel_id: Option<OpaqueId>,
    pub guild_id: Option<OpaqueId>,
}

impl CommandEntry {
    /// Build a new entry stamped with the current local time. The command
    /// text is sanitized; the raw text is kept in `original_command`.
    pub fn submit(raw: &str, message_id: OpaqueId, from: Submitter) -> Self {
        CommandEntry {
            timestamp: now_iso8601(),
            message_id,
            command: sanitize(raw),
            original_command: Some(raw.to_string()),
            user_id: from.user_id,
            user_name: from.user_name,
            channel_id: from.channel_id,
            guild_id: from.guild_id,
        }
    }

    pub fn id(&self) -> CommandId {
        CommandId(format!("{}_{}", self.timestamp, self.message_id))
    }
}

/// Strip shell metacharacters and known dangerous commands, then cap the
/// length at 500 characters.
pub fn sanitize(command: &str) -> String {
    let mut sanitized = command.trim().to_string();

    for pattern in DANGEROUS_PATTERNS {
        if sanitized.to_ascii_lowercase().contains(pattern) {
            warn!(pattern, "dangerous pattern removed from command");
            sanitized = replace_ignore_ascii_case(&sanitized, pattern);
        }
    }

    if sanitized.chars().count() > MAX_COMMAND_CHARS {
        let mut truncated: String = sanitized.chars().take(MAX_COMMAND_CHARS).collect();
        truncated.push_str("...");
        sanitized = truncated;
    }
    sanitized
}

/// `pattern` must be lowercase ASCII, so byte offsets found in the
/// lowercased copy are valid in the original.
fn replace_ignore_ascii_case(text: &str, pattern: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, _) in lower.match_indices(pattern) {
        out.push_str(&text[last..start]);
        out.push_str(REMOVED);
        last = start + pattern.len();
    }
    out.push_str(&text[last..]);
    out
}

/// The on-disk command queue. The dispatcher only ever reads it.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    path: PathBuf,
}

impl CommandQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all entries in arrival order. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<CommandEntry>, StoreError> {
        Ok(read_json_file(&self.path)?.unwrap_or_default())
    }

    /// Like [`load`](Self::load), but unreadable or malformed content (for
    /// example a file caught mid-rewrite) is logged and treated as empty.
    pub fn load_or_empty(&self) -> Vec<CommandEntry> {
        self.load().unwrap_or_else(|err| {
            warn!(error = %err, "command queue unreadable, treating as empty");
            Vec::new()
        })
    }

    /// Entries not yet in `processed`, oldest first.
    pub fn pending(&self, processed: &ProcessedSet) -> Vec<CommandEntry> {
        self.load_or_empty()
            .into_iter()
            .filter(|entry| !processed.contains(&entry.id()))
            .collect()
    }

    /// Append an entry, keeping the newest [`MAX_QUEUE_LEN`] entries.
    ///
    /// Unlike the read path this fails hard on a malformed file so the
    /// producer never clobbers data it could not parse.
    pub fn append(&self, entry: CommandEntry) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        entries.push(entry);
        if entries.len() > MAX_QUEUE_LEN {
            let excess = entries.len() - MAX_QUEUE_LEN;
            entries.drain(..excess);
        }
        write_json_file(&self.path, &entries)
    }
}

#[cfg(test)]
mod tests;
