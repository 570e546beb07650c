// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Deterministic history compaction.
//!
//! Compaction replaces the oldest span of a session's messages with a single
//! `system` message tagged `summary`.  The condenser is a pure function of
//! the message list — no model call — so compacting an already-compacted
//! session is a structural no-op and the result is reproducible byte for
//! byte.
//!
//! Preserved verbatim, per the compaction contract:
//! 1. the most recent `keep_recent` messages,
//! 2. user messages that introduced still-referenced files,
//! 3. the cumulative set of tool names used (recorded on the summary).

use crate::types::{approx_tokens, Message, Role};

/// Digest lines carried forward in the summary body; older digests fall off.
const MAX_DIGEST_LINES: usize = 20;
/// Per-digest excerpt length.
const DIGEST_CHARS: usize = 80;

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages_removed: usize,
    /// False when the pass was a no-op (already at target, or nothing left
    /// that the keep-rules allow dropping).
    pub compacted: bool,
}

impl CompactionReport {
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    fn noop(tokens: usize) -> Self {
        Self {
            tokens_before: tokens,
            tokens_after: tokens,
            messages_removed: 0,
            compacted: false,
        }
    }
}

/// Compact `messages` in place so that the total footprint approaches
/// `target_tokens`.
///
/// The pass is a no-op when the history already fits, when it is shorter
/// than `keep_recent`, or when every old message is protected by a keep-rule
/// (which is exactly the state a previous pass leaves behind — hence
/// idempotence).
pub fn compact_messages(
    messages: &mut Vec<Message>,
    target_tokens: usize,
    keep_recent: usize,
) -> CompactionReport {
    let tokens_before: usize = messages.iter().map(Message::approx_tokens).sum();
    if tokens_before <= target_tokens || messages.len() <= keep_recent {
        return CompactionReport::noop(tokens_before);
    }

    let split = messages.len() - keep_recent;
    let (head, tail) = messages.split_at(split);

    // Paths mentioned in a head user message that some later message still
    // refers to mark that message as load-bearing context.
    let kept_user: Vec<bool> = head
        .iter()
        .enumerate()
        .map(|(i, m)| {
            m.role == Role::User
                && !m.is_summary()
                && path_tokens(&m.content)
                    .iter()
                    .any(|p| referenced_later(p, &messages[i + 1..]))
        })
        .collect();

    let old_summary = head.iter().find(|m| m.is_summary());

    let droppable: Vec<&Message> = head
        .iter()
        .enumerate()
        .filter(|(i, m)| !m.is_summary() && !kept_user[*i])
        .map(|(_, m)| m)
        .collect();

    if droppable.is_empty() {
        return CompactionReport::noop(tokens_before);
    }

    // Cumulative tool-name set: union of everything recorded so far.
    let mut tools: Vec<String> = old_summary
        .and_then(|s| s.tools_used.clone())
        .unwrap_or_default();
    for m in head {
        if let Some(used) = &m.tools_used {
            for t in used {
                if !tools.contains(t) {
                    tools.push(t.clone());
                }
            }
        }
    }

    // File list: every path token seen in the dropped span, deduplicated.
    let mut files: Vec<String> = old_summary
        .and_then(|s| s.context_snapshot.clone())
        .unwrap_or_default();
    for m in &droppable {
        for p in path_tokens(&m.content) {
            if !files.contains(&p) {
                files.push(p);
            }
        }
    }

    // One digest line per dropped message, newest `MAX_DIGEST_LINES` kept.
    let mut digests: Vec<String> = old_summary
        .map(|s| {
            s.content
                .lines()
                .filter(|l| l.starts_with("- "))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    for m in &droppable {
        digests.push(format!("- {}: {}", role_label(m.role), digest(&m.content)));
    }
    if digests.len() > MAX_DIGEST_LINES {
        digests.drain(..digests.len() - MAX_DIGEST_LINES);
    }

    let mut body = String::from("Summary of earlier conversation (compacted).\n");
    if !tools.is_empty() {
        body.push_str(&format!("Tools used so far: {}.\n", tools.join(", ")));
    }
    if !files.is_empty() {
        body.push_str(&format!("Files discussed: {}.\n", files.join(", ")));
    }
    body.push('\n');
    body.push_str(&digests.join("\n"));

    // The summary inherits the newest dropped message's timestamp so the log
    // stays chronologically ordered without minting a wall-clock read here.
    let mut summary = Message::system(body);
    summary.timestamp = droppable.last().map(|m| m.timestamp).unwrap_or_else(|| {
        head.first()
            .map(|m| m.timestamp)
            .unwrap_or(summary.timestamp)
    });
    summary.tag = Some("summary".to_string());
    summary.tools_used = if tools.is_empty() { None } else { Some(tools) };
    summary.context_snapshot = if files.is_empty() { None } else { Some(files) };

    let mut rebuilt = Vec::with_capacity(1 + keep_recent + 4);
    rebuilt.push(summary);
    for (i, m) in head.iter().enumerate() {
        if kept_user[i] {
            rebuilt.push(m.clone());
        }
    }
    rebuilt.extend(tail.iter().cloned());

    let removed = messages.len() - rebuilt.len();
    let tokens_after: usize = rebuilt.iter().map(Message::approx_tokens).sum();
    *messages = rebuilt;

    CompactionReport {
        tokens_before,
        tokens_after,
        messages_removed: removed,
        compacted: true,
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

fn digest(content: &str) -> String {
    let first = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut out: String = first.chars().take(DIGEST_CHARS).collect();
    if first.chars().count() > DIGEST_CHARS {
        out.push('…');
    }
    out
}

/// Extract path-looking tokens (`src/lib.rs`, `Cargo.toml`, …) from text.
fn path_tokens(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '_'))
        .filter(|t| looks_like_path(t))
        .map(str::to_string)
        .collect()
}

fn looks_like_path(token: &str) -> bool {
    if token.len() < 3 || token.starts_with("http") {
        return false;
    }
    let has_sep = token.contains('/');
    let has_ext = token
        .rsplit_once('.')
        .map(|(stem, ext)| {
            !stem.is_empty() && (2..=4).contains(&ext.len()) && ext.chars().all(char::is_alphanumeric)
        })
        .unwrap_or(false);
    (has_sep && !token.ends_with('/')) || has_ext
}

fn referenced_later(path: &str, later: &[Message]) -> bool {
    later.iter().any(|m| m.content.contains(path))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
