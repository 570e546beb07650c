// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The lead orchestrator: plan → bounded parallel fan-out → synthesis.
//!
//! Fan-out uses all-settled semantics: every selected agent runs to its own
//! conclusion and one failure never short-circuits the rest.  Aborting the
//! parent execution cancels every live sub-agent in parallel through the
//! shared cancellation token.

use std::sync::Arc;
use std::time::Instant;

use maestro_protocol::{Provider, StreamEvent};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{classify, Classification};
use crate::expertise::ExpertiseSource;
use crate::spawner::{AgentOutcome, SpawnRequest, SubAgentSpawner};

/// Role selection priority: expert-matched domains always go first, then
/// the fixed role order, then anything else the classifier suggested.
const ROLE_PRIORITY: &[&str] = &["scout", "architect", "builder", "reviewer"];

pub struct OrchestrationRequest {
    pub prompt: String,
    pub session_id: String,
    pub work_dir: String,
    pub provider: Provider,
}

#[derive(Debug)]
pub struct OrchestrationOutcome {
    /// The synthesized Markdown artifact (or the inline reply for trivial
    /// prompts).
    pub summary: String,
    pub classification: Classification,
    pub agents_used: usize,
    pub all_failed: bool,
    pub outcomes: Vec<AgentOutcome>,
    pub duration_ms: u64,
}

pub struct LeadOrchestrator {
    spawner: Arc<SubAgentSpawner>,
    expertise: Arc<dyn ExpertiseSource>,
    max_concurrent: usize,
    trivial_threshold: u8,
}

impl LeadOrchestrator {
    pub fn new(
        spawner: Arc<SubAgentSpawner>,
        expertise: Arc<dyn ExpertiseSource>,
        max_concurrent: usize,
        trivial_threshold: u8,
    ) -> Self {
        Self {
            spawner,
            expertise,
            max_concurrent,
            trivial_threshold,
        }
    }

    /// Run the full orchestration for one prompt, streaming events through
    /// `events`.
    pub async fn run(
        &self,
        req: OrchestrationRequest,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> OrchestrationOutcome {
        let started = Instant::now();
        let available = self.expertise.available_domains();
        let classification = classify(&req.prompt, &available, self.trivial_threshold);
        debug!(
            score = classification.complexity_score,
            delegation = classification.requires_delegation,
            "prompt classified"
        );

        let _ = events
            .send(StreamEvent::Classified {
                complexity_score: classification.complexity_score,
                domains: classification.domains.clone(),
                requires_delegation: classification.requires_delegation,
                reasoning: Some(classification.reasoning.clone()),
            })
            .await;

        if !classification.requires_delegation {
            let summary = format!(
                "Low complexity (score {}); handled inline without sub-agents. {}",
                classification.complexity_score,
                inline_reply(&req.prompt)
            );
            let _ = events
                .send(StreamEvent::Completed {
                    agents_used: 0,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                })
                .await;
            return OrchestrationOutcome {
                summary,
                classification,
                agents_used: 0,
                all_failed: false,
                outcomes: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        }

        let roles = self.plan(&classification);
        info!(?roles, "orchestration plan");
        let _ = events
            .send(StreamEvent::Executing {
                agents: roles.clone(),
            })
            .await;

        // Announce each spawn as a Task-style tool_use so sub-agent events
        // can link back to it via parentToolUseId.
        let mut set: JoinSet<AgentOutcome> = JoinSet::new();
        for role in &roles {
            let tool_use_id = format!("task-{}", Uuid::new_v4());
            let _ = events
                .send(StreamEvent::ToolUse {
                    tool: "Task".to_string(),
                    tool_use_id: tool_use_id.clone(),
                    tool_input: Some(serde_json::json!({
                        "role": role,
                        "task": req.prompt,
                    })),
                    parent_tool_use_id: None,
                    agent_id: None,
                    extra: Default::default(),
                })
                .await;

            let expertise = self.expertise.pack_for(role).await;
            let spawn = SpawnRequest {
                role: role.clone(),
                task_prompt: req.prompt.clone(),
                session_id: req.session_id.clone(),
                work_dir: req.work_dir.clone(),
                provider: req.provider,
                expertise,
                parent_tool_use_id: tool_use_id.clone(),
                nested: false,
            };
            let spawner = self.spawner.clone();
            let agent_events = events.clone();
            let agent_cancel = cancel.child_token();
            let result_events = events.clone();
            set.spawn(async move {
                let outcome = spawner.spawn(spawn, agent_events, agent_cancel).await;
                // Close the Task tool_use with the agent's summary.
                let _ = result_events
                    .send(StreamEvent::ToolResult {
                        tool: "Task".to_string(),
                        tool_use_id,
                        tool_output: Some(if outcome.success {
                            outcome.output.clone()
                        } else {
                            format!(
                                "agent failed: {}",
                                outcome.reason.clone().unwrap_or_default()
                            )
                        }),
                        parent_tool_use_id: None,
                        agent_id: Some(outcome.agent_id.clone()),
                        extra: Default::default(),
                    })
                    .await;
                outcome
            });
        }

        // All-settled: collect every outcome; a panicked task becomes a
        // failed outcome instead of poisoning the batch.
        let mut outcomes: Vec<AgentOutcome> = Vec::with_capacity(roles.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!("sub-agent task panicked: {e}");
                    outcomes.push(AgentOutcome {
                        agent_id: format!("lost-{}", outcomes.len()),
                        role: "unknown".to_string(),
                        output: String::new(),
                        success: false,
                        reason: Some(format!("task panicked: {e}")),
                        metrics: Default::default(),
                    });
                }
            }
        }
        // JoinSet yields in completion order; stable role order reads better
        // in the synthesis.
        outcomes.sort_by_key(|o| roles.iter().position(|r| *r == o.role).unwrap_or(usize::MAX));

        let duration_ms = started.elapsed().as_millis() as u64;
        let all_failed = !outcomes.is_empty() && outcomes.iter().all(|o| !o.success);
        let summary = synthesize(&req.prompt, &classification, &outcomes, duration_ms);

        let _ = events
            .send(StreamEvent::Completed {
                agents_used: outcomes.len(),
                duration_ms: Some(duration_ms),
            })
            .await;

        OrchestrationOutcome {
            summary,
            classification,
            agents_used: outcomes.len(),
            all_failed,
            outcomes,
            duration_ms,
        }
    }

    /// Pick up to `max_concurrent` roles from experts ∪ suggested agents,
    /// expert matches first, deduplicated.
    fn plan(&self, classification: &Classification) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        for expert in &classification.suggested_experts {
            if !roles.contains(expert) {
                roles.push(expert.clone());
            }
        }
        for role in ROLE_PRIORITY {
            if classification.suggested_agents.iter().any(|a| a == role)
                && !roles.contains(&role.to_string())
            {
                roles.push(role.to_string());
            }
        }
        for other in &classification.suggested_agents {
            if !roles.contains(other) {
                roles.push(other.clone());
            }
        }
        roles.truncate(self.max_concurrent);
        roles
    }
}

fn inline_reply(prompt: &str) -> String {
    format!(
        "This request (\"{}\") is simple enough for a single direct pass; \
         run it without leadOrchestrate for a full answer.",
        crate::spawner::excerpt(prompt, 120)
    )
}

/// The final Markdown artifact.
fn synthesize(
    prompt: &str,
    classification: &Classification,
    outcomes: &[AgentOutcome],
    duration_ms: u64,
) -> String {
    let succeeded: Vec<&AgentOutcome> = outcomes.iter().filter(|o| o.success).collect();
    let failed: Vec<&AgentOutcome> = outcomes.iter().filter(|o| !o.success).collect();

    let mut out = String::from("## Summary\n\n");
    out.push_str(&format!(
        "Task: {}\n\nClassification: score {}, domains [{}]. \
         {} of {} agents completed successfully.\n",
        crate::spawner::excerpt(prompt, 200),
        classification.complexity_score,
        classification.domains.join(", "),
        succeeded.len(),
        outcomes.len(),
    ));

    out.push_str("\n## Per-Agent Results\n");
    for o in outcomes {
        out.push_str(&format!("\n### {} ({})\n\n", o.role, o.agent_id));
        if o.success {
            out.push_str(&o.output);
            out.push('\n');
        } else {
            out.push_str(&format!(
                "Failed: {}\n",
                o.reason.as_deref().unwrap_or("unknown")
            ));
        }
    }

    if !failed.is_empty() && !succeeded.is_empty() {
        out.push_str("\n## Failures\n\n");
        for o in &failed {
            out.push_str(&format!(
                "- {} — {}\n",
                o.role,
                o.reason.as_deref().unwrap_or("unknown")
            ));
        }
    }

    let total_tools: u64 = outcomes.iter().map(|o| o.metrics.tool_calls).sum();
    let total_tokens: u64 = outcomes.iter().map(|o| o.metrics.tokens_used).sum();
    out.push_str(&format!(
        "\n## Metrics\n\n- Agents: {}\n- Tool calls: {}\n- Total duration: {} ms\n- Tokens: {}\n",
        outcomes.len(),
        total_tools,
        duration_ms,
        total_tokens,
    ));
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expertise::{ExpertisePack, NoExpertise};
    use async_trait::async_trait;
    use maestro_session::SessionStore;
    use maestro_supervisor::MockDriver;
    use std::time::Duration;

    struct AuthExpertise;

    #[async_trait]
    impl ExpertiseSource for AuthExpertise {
        fn available_domains(&self) -> Vec<String> {
            vec!["auth".to_string()]
        }

        async fn pack_for(&self, domain: &str) -> Option<ExpertisePack> {
            (domain == "auth").then(|| ExpertisePack {
                domain: "auth".into(),
                mental_model: "cookie sessions".into(),
                key_files: vec![],
                patterns: vec![],
                known_issues: vec![],
                confidence: 0.8,
            })
        }
    }

    async fn orchestrator(
        driver: MockDriver,
        expertise: Arc<dyn ExpertiseSource>,
    ) -> (tempfile::TempDir, LeadOrchestrator, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let session = store.create(None, None, None).await.unwrap();
        let spawner = Arc::new(SubAgentSpawner::new(
            Arc::new(driver),
            store,
            Duration::from_secs(30),
            500,
        ));
        let lead = LeadOrchestrator::new(spawner, expertise, 4, 50);
        (dir, lead, session.id)
    }

    fn request(session_id: &str, prompt: &str) -> OrchestrationRequest {
        OrchestrationRequest {
            prompt: prompt.to_string(),
            session_id: session_id.to_string(),
            work_dir: ".".to_string(),
            provider: Provider::Claude,
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn trivial_prompt_completes_inline_with_zero_agents() {
        let (_dir, lead, session_id) =
            orchestrator(MockDriver::new(), Arc::new(NoExpertise)).await;
        let (tx, mut rx) = mpsc::channel(256);

        let outcome = lead
            .run(
                request(&session_id, "Fix typo in README"),
                tx,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.agents_used, 0);
        assert!(!outcome.all_failed);
        assert!(outcome.summary.contains("handled inline"));

        let events = drain(&mut rx).await;
        assert!(matches!(
            events[0],
            StreamEvent::Classified {
                requires_delegation: false,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            StreamEvent::Completed { agents_used: 0, .. }
        ));
        // No agent lifecycle events at all.
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::AgentEvent { .. })));
    }

    #[tokio::test]
    async fn complex_prompt_fans_out_and_synthesizes() {
        let (_dir, lead, session_id) =
            orchestrator(MockDriver::new(), Arc::new(NoExpertise)).await;
        let (tx, mut rx) = mpsc::channel(1024);

        let outcome = lead
            .run(
                request(
                    &session_id,
                    "Refactor and debug the authentication integration across multiple files",
                ),
                tx,
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.agents_used >= 3);
        assert!(outcome.agents_used <= 4);
        assert!(!outcome.all_failed);
        for section in ["## Summary", "## Per-Agent Results", "## Metrics"] {
            assert!(outcome.summary.contains(section), "missing {section}");
        }

        let events = drain(&mut rx).await;
        let spawned = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    StreamEvent::AgentEvent {
                        event: maestro_protocol::AgentLifecycle::Spawned,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(spawned, outcome.agents_used);

        // Every Task tool_use is answered by a matching tool_result.
        for ev in &events {
            if let StreamEvent::ToolResult {
                tool, tool_use_id, ..
            } = ev
            {
                if tool == "Task" {
                    assert!(events.iter().any(|e| matches!(
                        e,
                        StreamEvent::ToolUse { tool_use_id: id, .. } if id == tool_use_id
                    )));
                }
            }
        }
    }

    #[tokio::test]
    async fn expert_match_takes_priority_in_plan() {
        let (_dir, lead, session_id) =
            orchestrator(MockDriver::new(), Arc::new(AuthExpertise)).await;
        let (tx, mut rx) = mpsc::channel(1024);

        let outcome = lead
            .run(
                request(
                    &session_id,
                    "Refactor and debug the authentication integration across multiple files",
                ),
                tx,
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.agents_used > 0);

        let events = drain(&mut rx).await;
        let executing = events.iter().find_map(|e| match e {
            StreamEvent::Executing { agents } => Some(agents.clone()),
            _ => None,
        });
        let agents = executing.expect("executing event");
        assert_eq!(agents[0], "auth", "expert match must lead the plan");
        assert_eq!(agents.len(), 4, "plan is capped at max_concurrent");
    }

    #[tokio::test]
    async fn partial_failure_keeps_summary_and_lists_failures() {
        let driver = MockDriver::new();
        // First agent settles with a result; second produces no result and
        // is therefore a failure; remaining agents echo fine.
        driver
            .push_script(vec![StreamEvent::Result {
                result: "scouted".into(),
                usage: None,
                cost_usd: None,
                duration_ms: None,
                extra: Default::default(),
            }])
            .await;
        driver
            .push_script(vec![StreamEvent::Text {
                data: "died midway".into(),
                agent_id: None,
                extra: Default::default(),
            }])
            .await;
        let (_dir, lead, session_id) = orchestrator(driver, Arc::new(NoExpertise)).await;
        let (tx, _rx) = mpsc::channel(4096);

        let outcome = lead
            .run(
                request(
                    &session_id,
                    "Refactor and debug the authentication integration across multiple files",
                ),
                tx,
                CancellationToken::new(),
            )
            .await;
        assert!(!outcome.all_failed);
        assert!(outcome.outcomes.iter().any(|o| !o.success));
        assert!(outcome.summary.contains("## Failures"));
    }

    #[tokio::test]
    async fn abort_cancels_all_live_agents() {
        let (_dir, lead, session_id) =
            orchestrator(MockDriver::new(), Arc::new(NoExpertise)).await;
        let (tx, _rx) = mpsc::channel(4096);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = lead
            .run(
                request(
                    &session_id,
                    "Refactor and debug the authentication integration across multiple files",
                ),
                tx,
                cancel,
            )
            .await;
        // Every agent observed the cancellation and settled unsuccessfully.
        assert!(outcome.all_failed);
    }
}
