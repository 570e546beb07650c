// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use maestro_protocol::{ModeFlags, Provider, StreamEvent, UsageTotals};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Approximate token count for a piece of text (bytes / 4).
///
/// Authoritative usage from a provider's `result` event supersedes this at
/// the accounting layer; the approximation only covers text the provider has
/// not yet counted.
pub fn approx_tokens(text: &str) -> usize {
    text.len() / 4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One turn in a session's conversation log.  Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Pasted images as data URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    /// Names of the tools invoked during this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_used: Option<Vec<String>>,
    /// Copy of the per-turn execution trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_events: Option<Vec<StreamEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// Names of rules/skills/mcps/agents active during the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<Vec<String>>,
    /// Marker for synthetic messages; `"summary"` tags a compaction summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            images: None,
            tools_used: None,
            execution_events: None,
            usage: None,
            cost_usd: None,
            context_snapshot: None,
            tag: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Approximate context footprint of this message.
    pub fn approx_tokens(&self) -> usize {
        approx_tokens(&self.content)
    }

    pub fn is_summary(&self) -> bool {
        self.tag.as_deref() == Some("summary")
    }
}

/// Status of a persisted sub-agent record.  Advances monotonically:
/// `pending → active → {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl AgentStatus {
    /// Position in the lifecycle; terminal states share the highest rank.
    fn rank(self) -> u8 {
        match self {
            AgentStatus::Pending => 0,
            AgentStatus::Active => 1,
            AgentStatus::Completed | AgentStatus::Failed => 2,
        }
    }

    /// True when a record in `self` may be replaced by one in `next`.
    pub fn can_advance_to(self, next: AgentStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// A sub-agent invocation recorded on the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAgent {
    pub id: String,
    /// Domain/role tag (`scout`, `builder`, …).
    #[serde(rename = "type")]
    pub agent_type: String,
    /// Prompt excerpt the agent was tasked with.
    pub task: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// First KiB of the agent's output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Links the record to the spawning turn's `tool_use` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

impl PersistedAgent {
    pub fn new(agent_type: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_type: agent_type.into(),
            task: task.into(),
            status: AgentStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            tokens_used: None,
            error: None,
            tool_use_id: None,
        }
    }
}

/// Per-session mode configuration.
///
/// `provider` here is an optional override; the session's own `provider`
/// field is the default CLI for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionModes {
    #[serde(flatten)]
    pub flags: ModeFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

/// The durable unit of user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub work_dir: String,
    pub provider: Provider,
    #[serde(default)]
    pub modes: SessionModes,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub agents: Vec<PersistedAgent>,
}

impl Session {
    pub fn new(name: impl Into<String>, work_dir: impl Into<String>, provider: Provider) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            work_dir: work_dir.into(),
            provider,
            modes: SessionModes::default(),
            messages: Vec::new(),
            agents: Vec::new(),
        }
    }

    /// Approximate token footprint of the full message history.
    pub fn history_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }

    /// Metadata-only projection for listings.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            work_dir: self.work_dir.clone(),
            provider: self.provider,
            message_count: self.messages.len(),
            agent_count: self.agents.len(),
        }
    }
}

/// What `list` returns: session metadata without the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub work_dir: String,
    pub provider: Provider,
    pub message_count: usize,
    pub agent_count: usize,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Token accounting ──────────────────────────────────────────────────────

    #[test]
    fn approx_tokens_is_quarter_of_bytes() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("12345678"), 2);
        assert_eq!(approx_tokens("123"), 0);
    }

    #[test]
    fn history_tokens_sums_messages() {
        let mut s = Session::new("test", "/tmp", Provider::Claude);
        s.messages.push(Message::user("12345678")); // 2 tokens
        s.messages.push(Message::assistant("abcd")); // 1 token
        assert_eq!(s.history_tokens(), 3);
    }

    // ── Agent status lattice ──────────────────────────────────────────────────

    #[test]
    fn status_advances_forward_only() {
        use AgentStatus::*;
        assert!(Pending.can_advance_to(Active));
        assert!(Pending.can_advance_to(Completed));
        assert!(Active.can_advance_to(Failed));
        assert!(!Active.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(Active));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Completed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(!AgentStatus::Active.is_terminal());
        assert!(!AgentStatus::Pending.is_terminal());
    }

    // ── Serde shape ───────────────────────────────────────────────────────────

    #[test]
    fn message_json_uses_camel_case() {
        let mut m = Message::user("hi");
        m.tools_used = Some(vec!["grep".into()]);
        m.cost_usd = Some(0.01);
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("toolsUsed").is_some());
        assert!(v.get("costUsd").is_some());
        assert!(v.get("tools_used").is_none());
    }

    #[test]
    fn persisted_agent_type_field_is_named_type() {
        let a = PersistedAgent::new("scout", "explore the repo");
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], "scout");
        assert_eq!(v["status"], "pending");
    }

    #[test]
    fn session_round_trips() {
        let mut s = Session::new("demo", "/work", Provider::Gemini);
        s.messages.push(Message::user("hello"));
        s.agents.push(PersistedAgent::new("builder", "build it"));
        let json = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn modes_flatten_flags() {
        let json = r#"{"orchestrate":true,"leadOrchestrate":false,"thinking":true,
                       "planMode":false,"bypassPermissions":false,"allowFullPC":false,
                       "provider":"codex"}"#;
        let m: SessionModes = serde_json::from_str(json).unwrap();
        assert!(m.flags.orchestrate);
        assert!(m.flags.thinking);
        assert_eq!(m.provider, Some(Provider::Codex));
    }

    #[test]
    fn summary_tag_round_trips() {
        let mut m = Message::system("condensed history");
        m.tag = Some("summary".into());
        assert!(m.is_summary());
        let back: Message = serde_json::from_str(&serde_json::to_string(&m).unwrap()).unwrap();
        assert!(back.is_summary());
    }
}
