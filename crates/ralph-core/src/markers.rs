//! Completion-marker and blocker-tag extraction from agent output (§4.D).
//!
//! No teacher module implements this directly; the UTF-8-boundary-safe
//! string handling follows the care taken by `gate::truncate_snippet` in
//! the teacher (`gate/mod.rs`), and the hashing follows the same
//! RustCrypto convention the teacher uses for `sha2` elsewhere.

use std::sync::OnceLock;

use md5::{Digest, Md5};
use regex::Regex;

/// The literal sentinel the agent emits to claim a plan is complete.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

/// Case-sensitive substring search for the completion marker.
pub fn has_completion_marker(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

/// A structured blocker message extracted from agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    /// The raw, trimmed `<blocker>...</blocker>` body.
    pub content: String,
    /// Everything not claimed by `Action:`/`Resume:` lines.
    pub description: String,
    /// Value of the (optional) `Action:` line.
    pub action: String,
    /// Value of the (optional) `Resume:` line.
    pub resume: String,
    /// First 8 lowercase hex digits of the MD5 of `content`.
    pub hash: String,
}

fn blocker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").expect("valid blocker regex"))
}

/// Extract the first `<blocker>...</blocker>` region from `text`, if any.
///
/// Returns `None` when no tag is present, or when the tag's inner
/// content is empty after trimming.
pub fn extract_blocker(text: &str) -> Option<Blocker> {
    let captures = blocker_regex().captures(text)?;
    let content = captures.get(1)?.as_str().trim().to_string();
    if content.is_empty() {
        return None;
    }

    let (description, action, resume) = split_fields(&content);
    let hash = content_hash(&content);

    Some(Blocker {
        content,
        description,
        action,
        resume,
        hash,
    })
}

/// Split a trimmed blocker body into `(description, action, resume)`.
fn split_fields(content: &str) -> (String, String, String) {
    let mut action = String::new();
    let mut resume = String::new();
    let mut remaining_lines = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(value) = strip_label(trimmed, "action:") {
            action = value.to_string();
            continue;
        }
        if let Some(value) = strip_label(trimmed, "resume:") {
            resume = value.to_string();
            continue;
        }
        remaining_lines.push(line);
    }

    let remaining = remaining_lines.join("\n");
    let remaining = remaining.trim();

    let description = match strip_label(remaining, "description:") {
        Some(value) => value.to_string(),
        None => remaining.to_string(),
    };

    (description, action, resume)
}

/// If `line` starts with `label` case-insensitively, return the
/// remainder trimmed; else `None`.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    if line.len() < label.len() {
        return None;
    }
    let (head, tail) = line.split_at(label.len());
    if head.eq_ignore_ascii_case(label) {
        Some(tail.trim())
    } else {
        None
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..8].to_string()
}
