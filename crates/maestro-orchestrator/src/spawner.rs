// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Runs one sub-agent as a nested CLI invocation.
//!
//! The spawner enriches the task prompt with a role preamble and the
//! optional expertise pack, drives the turn through the shared
//! [`TurnDriver`], relabels every event with the agent's identity so
//! subscribers can reconstruct the tree, and keeps the session's
//! [`PersistedAgent`] record in step with the lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use maestro_protocol::{AgentLifecycle, ModeFlags, Provider, StreamEvent};
use maestro_session::{AgentStatus, PersistedAgent, SessionStore};
use maestro_supervisor::{PromptBundle, TurnDriver};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::expertise::ExpertisePack;

/// First KiB of agent output lands on the persisted record.
const PERSISTED_RESULT_BYTES: usize = 1024;

/// One sub-agent launch.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Role tag (`scout`, `builder`, …) — also the persisted agent type.
    pub role: String,
    pub task_prompt: String,
    pub session_id: String,
    pub work_dir: String,
    pub provider: Provider,
    pub expertise: Option<ExpertisePack>,
    /// The Task-style `tool_use` id this spawn hangs off.
    pub parent_tool_use_id: String,
    /// True when the caller is itself a sub-agent; such calls are refused.
    pub nested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMetrics {
    pub tool_calls: u64,
    pub duration_ms: u64,
    pub tokens_used: u64,
}

/// What one sub-agent produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub role: String,
    /// Output capped at the configured summary budget.
    pub output: String,
    pub success: bool,
    /// Failure reason (`timeout`, `depth`, error text) when `!success`.
    pub reason: Option<String>,
    pub metrics: AgentMetrics,
}

pub struct SubAgentSpawner {
    driver: Arc<dyn TurnDriver>,
    store: Arc<SessionStore>,
    soft_cap: Duration,
    summary_cap_chars: usize,
}

impl SubAgentSpawner {
    pub fn new(
        driver: Arc<dyn TurnDriver>,
        store: Arc<SessionStore>,
        soft_cap: Duration,
        summary_cap_tokens: usize,
    ) -> Self {
        Self {
            driver,
            store,
            soft_cap,
            summary_cap_chars: summary_cap_tokens * 4,
        }
    }

    /// Run one sub-agent to completion (or timeout/abort), streaming its
    /// relabelled events through `events`.
    pub async fn spawn(
        &self,
        req: SpawnRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> AgentOutcome {
        let mut record = PersistedAgent::new(&req.role, excerpt(&req.task_prompt, 200));
        record.tool_use_id = Some(req.parent_tool_use_id.clone());
        let agent_id = record.id.clone();

        // Nested CLIs do not get to open further nested CLIs.
        if req.nested {
            record.status = AgentStatus::Failed;
            record.error = Some("sub-agents may not spawn sub-agents".to_string());
            record.completed_at = Some(Utc::now());
            self.flush(&req.session_id, record).await;
            let _ = events
                .send(lifecycle(
                    AgentLifecycle::Failed,
                    &agent_id,
                    &req,
                    None,
                    Some("depth limit reached".to_string()),
                    None,
                ))
                .await;
            return AgentOutcome {
                agent_id,
                role: req.role.clone(),
                output: String::new(),
                success: false,
                reason: Some("depth".to_string()),
                metrics: AgentMetrics::default(),
            };
        }

        self.flush(&req.session_id, record.clone()).await;
        let _ = events
            .send(lifecycle(
                AgentLifecycle::Spawned,
                &agent_id,
                &req,
                None,
                None,
                None,
            ))
            .await;

        record.status = AgentStatus::Active;
        record.started_at = Some(Utc::now());
        self.flush(&req.session_id, record.clone()).await;
        let _ = events
            .send(lifecycle(
                AgentLifecycle::Started,
                &agent_id,
                &req,
                None,
                None,
                None,
            ))
            .await;

        let bundle = PromptBundle {
            prompt: self.enrich(&req),
            history: Vec::new(),
            session_id: req.session_id.clone(),
            work_dir: req.work_dir.clone(),
            resume: false,
            images: Vec::new(),
            flags: ModeFlags {
                // Sub-agents run unattended; a permission prompt would hang
                // the whole fan-out.
                bypass_permissions: true,
                ..Default::default()
            },
            provider: req.provider,
            orchestrate_hint: false,
        };

        // Relabel the driver's events with this agent's identity before
        // they reach the shared feed.
        let (turn_tx, mut turn_rx) = mpsc::channel::<StreamEvent>(256);
        let forward_events = events.clone();
        let forward_agent_id = agent_id.clone();
        let forward_parent = req.parent_tool_use_id.clone();
        let forwarder = tokio::spawn(async move {
            let mut tool_calls = 0u64;
            let mut text_bytes = 0usize;
            while let Some(ev) = turn_rx.recv().await {
                let relabelled =
                    relabel(ev, &forward_agent_id, &forward_parent, &mut tool_calls, &mut text_bytes);
                if let Some(ev) = relabelled {
                    if forward_events.send(ev).await.is_err() {
                        break;
                    }
                }
            }
            (tool_calls, text_bytes)
        });

        let child_cancel = cancel.child_token();
        let (_answer_tx, answer_rx) = mpsc::channel(1);
        let started = std::time::Instant::now();
        let turn = tokio::time::timeout(
            self.soft_cap,
            self.driver
                .run_turn(bundle, turn_tx, child_cancel.clone(), answer_rx),
        )
        .await;

        let (tool_calls, text_bytes) = forwarder.await.unwrap_or((0, 0));
        let duration_ms = started.elapsed().as_millis() as u64;

        let (output, success, reason, tokens_used) = match turn {
            // Soft cap expired: the dropped future's kill-on-drop reaps the
            // CLI; the child token is cancelled for completeness.
            Err(_) => {
                child_cancel.cancel();
                warn!(agent = %agent_id, cap = ?self.soft_cap, "sub-agent hit wall-clock cap");
                (String::new(), false, Some("timeout".to_string()), 0)
            }
            Ok(Err(e)) => {
                warn!(agent = %agent_id, "sub-agent turn failed: {e}");
                (String::new(), false, Some(e.to_string()), 0)
            }
            Ok(Ok(outcome)) => {
                let tokens = outcome
                    .usage
                    .map(|u| u.total_tokens)
                    .unwrap_or((text_bytes / 4) as u64);
                if outcome.aborted {
                    (String::new(), false, Some("aborted".to_string()), tokens)
                } else if outcome.saw_result {
                    let text = outcome.result_text.unwrap_or_default();
                    (self.cap_summary(&text), true, None, tokens)
                } else {
                    (
                        String::new(),
                        false,
                        Some("CLI exited without a result".to_string()),
                        tokens,
                    )
                }
            }
        };

        record.status = if success {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        record.completed_at = Some(Utc::now());
        record.result = (!output.is_empty()).then(|| excerpt(&output, PERSISTED_RESULT_BYTES));
        record.error = reason.clone();
        record.tokens_used = Some(tokens_used);
        self.flush(&req.session_id, record).await;

        let metrics = AgentMetrics {
            tool_calls,
            duration_ms,
            tokens_used,
        };
        let event_kind = if success {
            AgentLifecycle::Completed
        } else {
            AgentLifecycle::Failed
        };
        let _ = events
            .send(lifecycle(
                event_kind,
                &agent_id,
                &req,
                (!output.is_empty()).then(|| excerpt(&output, 400)),
                reason.clone(),
                Some(&metrics),
            ))
            .await;
        debug!(agent = %agent_id, success, tool_calls, "sub-agent settled");

        AgentOutcome {
            agent_id,
            role: req.role,
            output,
            success,
            reason,
            metrics,
        }
    }

    fn enrich(&self, req: &SpawnRequest) -> String {
        let mut prompt = format!("{}\n\n", role_preamble(&req.role));
        if let Some(pack) = &req.expertise {
            prompt.push_str(&pack.render());
            prompt.push('\n');
        }
        prompt.push_str("## Task\n\n");
        prompt.push_str(&req.task_prompt);
        prompt.push_str(
            "\n\nFinish with a concise summary of what you found or changed; \
             it will be folded into a combined report.",
        );
        prompt
    }

    fn cap_summary(&self, text: &str) -> String {
        if text.len() <= self.summary_cap_chars {
            return text.to_string();
        }
        let mut cut = self.summary_cap_chars;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…[summary truncated]", &text[..cut])
    }

    async fn flush(&self, session_id: &str, record: PersistedAgent) {
        if let Err(e) = self.store.append_agent(session_id, record).await {
            warn!(session = session_id, "failed to persist agent record: {e}");
        }
    }
}

fn role_preamble(role: &str) -> &'static str {
    match role {
        "scout" => {
            "You are a scout agent: explore the codebase, map the relevant files and \
             data flow, and report what a implementer needs to know. Do not modify files."
        }
        "builder" => {
            "You are a builder agent: implement the requested change end to end, \
             keeping edits minimal and consistent with the surrounding code."
        }
        "reviewer" => {
            "You are a reviewer agent: inspect the change for correctness, missed \
             edge cases, and regressions. Report concrete findings."
        }
        "planner" => {
            "You are a planner agent: break the task into ordered, verifiable steps \
             with file-level targets. Do not modify files."
        }
        "architect" => {
            "You are an architect agent: evaluate the design impact of the task and \
             propose the structure the implementation should follow."
        }
        _ => {
            "You are a focused specialist agent: complete the scoped task below and \
             report your findings."
        }
    }
}

pub(crate) fn excerpt(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

fn lifecycle(
    event: AgentLifecycle,
    agent_id: &str,
    req: &SpawnRequest,
    result: Option<String>,
    error: Option<String>,
    metrics: Option<&AgentMetrics>,
) -> StreamEvent {
    StreamEvent::AgentEvent {
        event,
        agent_id: agent_id.to_string(),
        agent_type: Some(req.role.clone()),
        task: Some(excerpt(&req.task_prompt, 200)),
        result,
        error,
        tool_calls: metrics.map(|m| m.tool_calls),
        duration_ms: metrics.map(|m| m.duration_ms),
        parent_tool_use_id: Some(req.parent_tool_use_id.clone()),
    }
}

/// Stamp agent identity onto the events that carry it; drop per-turn
/// bookkeeping that makes no sense mid-orchestration.
fn relabel(
    ev: StreamEvent,
    agent_id: &str,
    parent: &str,
    tool_calls: &mut u64,
    text_bytes: &mut usize,
) -> Option<StreamEvent> {
    match ev {
        StreamEvent::Text { data, extra, .. } => {
            *text_bytes += data.len();
            Some(StreamEvent::Text {
                data,
                agent_id: Some(agent_id.to_string()),
                extra,
            })
        }
        StreamEvent::ToolUse {
            tool,
            tool_use_id,
            tool_input,
            extra,
            ..
        } => {
            *tool_calls += 1;
            Some(StreamEvent::ToolUse {
                tool,
                tool_use_id,
                tool_input,
                parent_tool_use_id: Some(parent.to_string()),
                agent_id: Some(agent_id.to_string()),
                extra,
            })
        }
        StreamEvent::ToolResult {
            tool,
            tool_use_id,
            tool_output,
            extra,
            ..
        } => Some(StreamEvent::ToolResult {
            tool,
            tool_use_id,
            tool_output,
            parent_tool_use_id: Some(parent.to_string()),
            agent_id: Some(agent_id.to_string()),
            extra,
        }),
        StreamEvent::Thinking { .. } => Some(ev),
        // The sub-agent's own result/init/done are folded into the
        // lifecycle events; forwarding them would confuse subscribers
        // about which stream is ending.
        StreamEvent::Result { result, .. } => {
            *text_bytes += result.len();
            None
        }
        StreamEvent::Init { .. } | StreamEvent::Done { .. } | StreamEvent::RequestId { .. } => None,
        other => Some(other),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
