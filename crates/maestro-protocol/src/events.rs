// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The outbound event envelope.
//!
//! Every event the kernel emits — to a subscriber queue, into the per
//! execution ring buffer, or onto the per-session broadcast channel — is one
//! [`StreamEvent`].  The JSON form is `{"type": "<tag>", ...}` with camelCase
//! field names, so a browser client can switch on `type` directly.
//!
//! Events that originate from a provider CLI carry a flattened `extra` map:
//! fields the CLI emitted beyond the recognised contract pass through
//! unchanged rather than being dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(b: &bool) -> bool {
    !*b
}

/// One observable step of an execution, as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event of every execution; `data` carries the execution id.
    #[serde(rename_all = "camelCase")]
    RequestId { data: String },

    /// Streaming started.  `data` is informational (model name, etc.).
    #[serde(rename_all = "camelCase")]
    Init {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Assistant text delta.
    #[serde(rename_all = "camelCase")]
    Text {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Model-internal reasoning delta (opaque text).
    #[serde(rename_all = "camelCase")]
    Thinking {
        data: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// The model is invoking a tool.
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool: String,
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// A tool finished.  `tool_output` may already be truncated.
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool: String,
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// A context item (skill, rule, memory, …) was activated for the turn.
    #[serde(rename_all = "camelCase")]
    Context {
        context_type: ContextType,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ContextStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memories: Option<Vec<String>>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Sub-agent lifecycle transition.
    #[serde(rename_all = "camelCase")]
    AgentEvent {
        event: AgentLifecycle,
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },

    /// Final synthesized reply for the turn.
    #[serde(rename_all = "camelCase")]
    Result {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<UsageTotals>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Context-window monitor notification.
    #[serde(rename_all = "camelCase")]
    ContextWindow {
        event: ContextWindowEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<ContextWindowState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_saved: Option<u64>,
    },

    /// Auto-continuation notification.
    #[serde(rename_all = "camelCase")]
    Continuation {
        event: ContinuationEventKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<ContinuationState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<StopReason>,
    },

    /// Orchestrator: the prompt was classified.
    #[serde(rename_all = "camelCase")]
    Classified {
        complexity_score: u8,
        domains: Vec<String>,
        requires_delegation: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },

    /// Orchestrator: the plan is running (lists the selected agent roles).
    #[serde(rename_all = "camelCase")]
    Executing { agents: Vec<String> },

    /// Orchestrator: all sub-agents have settled.
    #[serde(rename_all = "camelCase")]
    Completed {
        agents_used: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// Non-fatal error surfaced to the subscriber; the execution continues
    /// unless a `done` follows.
    #[serde(rename_all = "camelCase")]
    Error { data: String },

    /// Terminal event.  No further events follow on this subscription.
    #[serde(rename_all = "camelCase")]
    Done {
        data: String,
        #[serde(default, skip_serializing_if = "is_false")]
        aborted: bool,
    },

    /// An event type the supervisor did not recognise; the original CLI
    /// object is preserved verbatim under `data`.
    #[serde(rename_all = "camelCase")]
    Unknown { data: Value },
}

impl StreamEvent {
    /// True for the event that ends a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    /// The sub-agent correlation id carried by this event, if any.
    pub fn parent_tool_use_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ToolUse {
                parent_tool_use_id, ..
            }
            | StreamEvent::ToolResult {
                parent_tool_use_id, ..
            }
            | StreamEvent::AgentEvent {
                parent_tool_use_id, ..
            } => parent_tool_use_id.as_deref(),
            _ => None,
        }
    }

    /// True when the event also belongs on the per-session broadcast channel
    /// (agent lifecycle events, plus anything linked to a sub-agent spawn).
    pub fn is_session_broadcast(&self) -> bool {
        matches!(self, StreamEvent::AgentEvent { .. }) || self.parent_tool_use_id().is_some()
    }
}

// ─── Supporting types ─────────────────────────────────────────────────────────

/// Kind of context item announced by a `context` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Skill,
    Rule,
    Mcp,
    Memory,
    Hook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Active,
    Completed,
    Failed,
}

/// Sub-agent lifecycle stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Spawned,
    Started,
    Completed,
    Failed,
}

/// Token usage totals attached to a `result` event.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_percent: Option<f32>,
}

impl UsageTotals {
    /// Sum of all tokens that occupy context on the next turn.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.output_tokens
    }
}

/// Context window status bands, least to most constrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Safe,
    Warning,
    Critical,
    Compacting,
}

/// Token breakdown for the current window snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBreakdown {
    pub system: u64,
    pub history: u64,
    pub tools: u64,
    pub current: u64,
}

/// Snapshot published with `context_window` events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowState {
    pub used_tokens: u64,
    pub max_tokens: u64,
    pub percentage: f32,
    pub status: WindowStatus,
    pub breakdown: ContextBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextWindowEventKind {
    Init,
    StatusChanged,
    ThresholdWarning,
    ThresholdCritical,
    CompactionStarted,
    CompactionCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationEventKind {
    Iteration,
    Completed,
}

/// Why auto-continuation stopped (or fired).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Truncated,
    Completed,
    MaxIterations,
    CompleteEnough,
}

/// Iteration counters published with `continuation` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationState {
    pub current_iteration: u32,
    pub max_iterations: u32,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
