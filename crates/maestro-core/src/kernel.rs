// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The execution kernel — the single entry point for "run this prompt".
//!
//! `execute` admits the request, writes the user turn, and spawns the
//! kernel runner task.  The runner picks the direct or lead-orchestration
//! path, streams events through the execution's bus, drives compaction and
//! auto-continuation, and on any terminal transition performs the side
//! effect rollback steps independently: persist the assistant turn iff a
//! result was seen, flush advanced agent records, release the registry
//! slot, and hand the transcript to the memory collaborator.

use std::sync::Arc;

use maestro_config::Config;
use maestro_orchestrator::{
    LeadOrchestrator, NoExpertise, OrchestrationRequest, SubAgentSpawner,
};
use maestro_protocol::{
    ContextType, ErrorKind, ExecuteParams, ModeFlags, Provider, StopReason, StreamEvent,
    UsageTotals,
};
use maestro_session::{approx_tokens, Message, Session, SessionStore};
use maestro_supervisor::{PromptBundle, TurnDriver};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::{ExecutionBus, SessionChannels, Subscription};
use crate::continuation::ContinuationController;
use crate::memory::{MemoryService, NullMemory};
use crate::monitor::ContextWindowMonitor;
use crate::registry::{ExecutionHandle, ExecutionRegistry, ExecutionStatus};

/// What the caller gets back from a successful admission.
pub struct ExecutionStarted {
    pub execution_id: String,
    pub session_id: String,
    pub subscription: Subscription,
}

pub struct ExecutionKernel {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    registry: Arc<ExecutionRegistry>,
    session_channels: Arc<SessionChannels>,
    driver: Arc<dyn TurnDriver>,
    memory: Arc<dyn MemoryService>,
    orchestrator: Arc<LeadOrchestrator>,
}

/// Assembles a kernel with its component graph.
pub struct KernelBuilder {
    config: Config,
    store: Arc<SessionStore>,
    driver: Arc<dyn TurnDriver>,
    memory: Arc<dyn MemoryService>,
    expertise: Arc<dyn maestro_orchestrator::ExpertiseSource>,
}

impl KernelBuilder {
    pub fn new(config: Config, store: Arc<SessionStore>, driver: Arc<dyn TurnDriver>) -> Self {
        Self {
            config,
            store,
            driver,
            memory: Arc::new(NullMemory),
            expertise: Arc::new(NoExpertise),
        }
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = memory;
        self
    }

    pub fn expertise(mut self, expertise: Arc<dyn maestro_orchestrator::ExpertiseSource>) -> Self {
        self.expertise = expertise;
        self
    }

    pub fn build(self) -> Arc<ExecutionKernel> {
        let spawner = Arc::new(SubAgentSpawner::new(
            self.driver.clone(),
            self.store.clone(),
            std::time::Duration::from_secs(self.config.limits.sub_agent_soft_cap_secs),
            self.config.orchestrator.agent_summary_max_tokens,
        ));
        let orchestrator = Arc::new(LeadOrchestrator::new(
            spawner,
            self.expertise,
            self.config.limits.max_concurrent_sub_agents,
            self.config.orchestrator.trivial_threshold,
        ));
        let registry = ExecutionRegistry::new(&self.config.limits);
        Arc::new(ExecutionKernel {
            config: Arc::new(self.config),
            store: self.store,
            registry,
            session_channels: SessionChannels::new(),
            driver: self.driver,
            memory: self.memory,
            orchestrator,
        })
    }
}

/// What one execution path produced, before terminal handling.
#[derive(Default)]
struct PathResult {
    final_text: String,
    saw_result: bool,
    aborted: bool,
    error: Option<ErrorKind>,
    trace: Vec<StreamEvent>,
    tools: Vec<String>,
    usage: Option<UsageTotals>,
    cost_usd: Option<f64>,
}

impl ExecutionKernel {
    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn session_channels(&self) -> &Arc<SessionChannels> {
        &self.session_channels
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Start the background TTL sweeper.  Call once at startup.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.registry.spawn_sweeper()
    }

    /// Request an abort of a live execution (idempotent).
    pub async fn abort(&self, execution_id: &str) {
        self.registry.abort(execution_id).await;
    }

    /// Admit and start one execution; the caller streams events from the
    /// returned subscription.  Takes the kernel by `Arc` because the runner
    /// task outlives the call.
    pub async fn execute(
        self: Arc<Self>,
        params: ExecuteParams,
    ) -> Result<ExecutionStarted, ErrorKind> {
        if params.prompt.trim().is_empty() {
            return Err(ErrorKind::Validation("prompt must not be empty".into()));
        }

        let session = match &params.session_id {
            Some(id) => self.store.get(id).await.map_err(ErrorKind::from)?,
            None => self
                .store
                .create(None, params.work_dir.clone(), params.provider)
                .await
                .map_err(ErrorKind::from)?,
        };

        let handle = self.registry.open(&session.id).await?;
        let subscription = handle.bus.subscribe().await;
        let started = ExecutionStarted {
            execution_id: handle.id.clone(),
            session_id: session.id.clone(),
            subscription,
        };

        let kernel = self.clone();
        tokio::spawn(async move {
            kernel.run_execution(handle, session, params).await;
        });

        Ok(started)
    }

    async fn forward(&self, session_id: &str, bus: &Arc<ExecutionBus>, event: StreamEvent) {
        self.session_channels.publish(session_id, &event);
        bus.publish(event).await;
    }

    /// The kernel runner: one long-lived task per execution.
    async fn run_execution(
        self: Arc<Self>,
        handle: ExecutionHandle,
        session: Session,
        params: ExecuteParams,
    ) {
        let bus = handle.bus.clone();
        let exec_id = handle.id.clone();
        let flags = params.mode_flags();
        let provider = params
            .provider
            .or(session.modes.provider)
            .unwrap_or(session.provider);

        self.forward(
            &session.id,
            &bus,
            StreamEvent::RequestId {
                data: exec_id.clone(),
            },
        )
        .await;
        self.forward(
            &session.id,
            &bus,
            StreamEvent::Init {
                data: provider.to_string(),
                session_id: Some(session.id.clone()),
            },
        )
        .await;
        self.registry.mark_running(&exec_id).await;
        info!(execution = %exec_id, session = %session.id, %provider, "execution running");

        // The user turn lands first; a failed write is surfaced but does
        // not kill the execution.
        let mut user_msg = Message::user(&params.prompt);
        if !params.images.is_empty() {
            user_msg.images = Some(params.images.clone());
        }
        if let Err(e) = self.store.append_message(&session.id, user_msg).await {
            error!(session = %session.id, "failed to persist user turn: {e}");
            self.forward(
                &session.id,
                &bus,
                StreamEvent::Error {
                    data: ErrorKind::from(e).to_string(),
                },
            )
            .await;
        }

        let mut monitor = ContextWindowMonitor::new(self.config.context.clone());
        monitor.set_history_tokens(
            0,
            (session.history_tokens() + approx_tokens(&params.prompt)) as u64,
        );
        self.forward(&session.id, &bus, monitor.init_event()).await;
        for ev in monitor.evaluate() {
            self.forward(&session.id, &bus, ev).await;
        }

        // Memory enrichment (`orchestrate` flag): recall context is stitched
        // in front of the prompt and announced as a context event.
        let mut effective_prompt = params.prompt.clone();
        if flags.orchestrate {
            match self.memory.inject(&params.prompt, &session.id).await {
                Ok(inj) if !inj.context_text.is_empty() => {
                    self.forward(
                        &session.id,
                        &bus,
                        StreamEvent::Context {
                            context_type: ContextType::Memory,
                            name: "recall".to_string(),
                            detail: None,
                            status: Some(maestro_protocol::ContextStatus::Active),
                            memories: Some(inj.refs.clone()),
                            extra: Default::default(),
                        },
                    )
                    .await;
                    effective_prompt = format!("{}\n\n{}", inj.context_text, params.prompt);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("memory injection failed: {e}");
                    self.forward(
                        &session.id,
                        &bus,
                        StreamEvent::Error {
                            data: format!("memory injection failed: {e}"),
                        },
                    )
                    .await;
                }
            }
        }

        let result = if flags.lead_orchestrate {
            self.run_orchestration(&handle, &session, provider, &effective_prompt)
                .await
        } else {
            self.run_direct(
                &handle,
                &session,
                provider,
                flags,
                &params,
                effective_prompt,
                &mut monitor,
            )
            .await
        };

        self.finish(&handle, &session, result).await;
    }

    /// Direct single-process path with auto-continuation.
    #[allow(clippy::too_many_arguments)]
    async fn run_direct(
        &self,
        handle: &ExecutionHandle,
        session: &Session,
        provider: Provider,
        flags: ModeFlags,
        params: &ExecuteParams,
        effective_prompt: String,
        monitor: &mut ContextWindowMonitor,
    ) -> PathResult {
        let bus = &handle.bus;
        let mut result = PathResult::default();
        let mut controller =
            ContinuationController::new(self.config.limits.continuation_max_iterations);
        let mut current_prompt = effective_prompt;
        let mut resume = params.resume;
        let mut first_turn = true;
        let mut compaction_attempted = false;
        let mut stop_reason = StopReason::CompleteEnough;

        loop {
            let (turn_tx, mut turn_rx) = mpsc::channel::<StreamEvent>(256);
            let (answer_tx, answer_rx) = mpsc::channel::<String>(8);
            self.registry.set_answer_sender(&handle.id, answer_tx).await;

            let bundle = PromptBundle {
                prompt: current_prompt.clone(),
                history: params.messages.clone().unwrap_or_default(),
                session_id: session.id.clone(),
                work_dir: effective_work_dir(params, session),
                resume,
                images: if first_turn {
                    params.images.clone()
                } else {
                    Vec::new()
                },
                flags,
                provider,
                orchestrate_hint: flags.orchestrate,
            };

            let driver = self.driver.clone();
            let cancel = handle.cancel.clone();
            let turn_task =
                tokio::spawn(async move { driver.run_turn(bundle, turn_tx, cancel, answer_rx).await });

            // Forward the turn's events as they arrive, feeding the monitor.
            while let Some(ev) = turn_rx.recv().await {
                match &ev {
                    StreamEvent::Text { data, .. } | StreamEvent::Thinking { data, .. } => {
                        monitor.add_current(approx_tokens(data) as u64);
                    }
                    StreamEvent::ToolResult { tool_output, .. } => {
                        if let Some(out) = tool_output {
                            monitor.add_tool_tokens(approx_tokens(out) as u64);
                        }
                    }
                    StreamEvent::ToolUse { tool, .. } => {
                        if !result.tools.contains(tool) {
                            result.tools.push(tool.clone());
                        }
                    }
                    StreamEvent::Result { usage, .. } => {
                        if let Some(u) = usage {
                            monitor.observe_usage(u);
                        }
                    }
                    _ => {}
                }
                result.trace.push(ev.clone());
                self.forward(&session.id, bus, ev).await;

                for transition in monitor.evaluate() {
                    self.forward(&session.id, bus, transition).await;
                }
                if monitor.needs_compaction() && !compaction_attempted {
                    compaction_attempted = true;
                    self.run_compaction(&session.id, bus, monitor).await;
                }
            }

            let turn = match turn_task.await {
                Ok(t) => t,
                Err(e) => {
                    result.error = Some(ErrorKind::CliFailed(format!("turn task panicked: {e}")));
                    return result;
                }
            };

            match turn {
                Err(e) => {
                    result.error = Some(e.to_error_kind());
                    return result;
                }
                Ok(outcome) => {
                    if outcome.aborted {
                        result.aborted = true;
                        return result;
                    }
                    if !outcome.saw_result {
                        let tail = if outcome.stderr_tail.is_empty() {
                            "CLI exited without emitting a result".to_string()
                        } else {
                            outcome.stderr_tail.clone()
                        };
                        result.error = Some(ErrorKind::CliFailed(tail));
                        return result;
                    }

                    result.saw_result = true;
                    let text = outcome.result_text.unwrap_or_default();
                    if result.final_text.is_empty() {
                        result.final_text = text.clone();
                    } else {
                        result.final_text.push('\n');
                        result.final_text.push_str(&text);
                    }
                    if outcome.usage.is_some() {
                        result.usage = outcome.usage;
                    }
                    if let Some(cost) = outcome.cost_usd {
                        result.cost_usd = Some(result.cost_usd.unwrap_or(0.0) + cost);
                    }
                    for tool in outcome.tool_names {
                        if !result.tools.contains(&tool) {
                            result.tools.push(tool);
                        }
                    }

                    let decision = controller.decide(&text, &result.trace);
                    if decision.should_continue && !handle.cancel.is_cancelled() {
                        let iteration_ev = controller.begin_iteration();
                        self.forward(&session.id, bus, iteration_ev).await;
                        debug!(
                            execution = %handle.id,
                            iteration = controller.state().current_iteration,
                            "auto-continuation engaged"
                        );

                        // Pacing delay, interruptible by abort.
                        let pacing = std::time::Duration::from_millis(
                            self.config.limits.continuation_pacing_ms,
                        );
                        tokio::select! {
                            _ = handle.cancel.cancelled() => {
                                result.aborted = true;
                                return result;
                            }
                            _ = tokio::time::sleep(pacing) => {}
                        }
                        current_prompt = ContinuationController::synthesize_prompt(&text);
                        resume = true;
                        first_turn = false;
                        continue;
                    }

                    stop_reason = match decision.reason {
                        StopReason::CompleteEnough => StopReason::Completed,
                        other => other,
                    };
                    break;
                }
            }
        }

        if controller.continued() {
            let ev = controller.completed_event(stop_reason);
            self.forward(&session.id, bus, ev).await;
        }
        result
    }

    /// Lead-orchestration path.
    async fn run_orchestration(
        &self,
        handle: &ExecutionHandle,
        session: &Session,
        provider: Provider,
        prompt: &str,
    ) -> PathResult {
        let bus = &handle.bus;
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(256);

        let forwarder = {
            let kernel_channels = self.session_channels.clone();
            let bus = bus.clone();
            let session_id = session.id.clone();
            tokio::spawn(async move {
                let mut trace = Vec::new();
                while let Some(ev) = rx.recv().await {
                    trace.push(ev.clone());
                    kernel_channels.publish(&session_id, &ev);
                    bus.publish(ev).await;
                }
                trace
            })
        };

        let outcome = self
            .orchestrator
            .run(
                OrchestrationRequest {
                    prompt: prompt.to_string(),
                    session_id: session.id.clone(),
                    work_dir: session.work_dir.clone(),
                    provider,
                },
                tx,
                handle.cancel.child_token(),
            )
            .await;

        let mut result = PathResult {
            trace: forwarder.await.unwrap_or_default(),
            ..Default::default()
        };

        if handle.cancel.is_cancelled() {
            result.aborted = true;
            return result;
        }
        if outcome.all_failed {
            result.error = Some(ErrorKind::SubAgentFailure(
                "all sub-agents failed".to_string(),
            ));
            return result;
        }

        // The synthesized artifact is the assistant reply.
        self.forward(
            &session.id,
            bus,
            StreamEvent::Text {
                data: outcome.summary.clone(),
                agent_id: None,
                extra: Default::default(),
            },
        )
        .await;
        let result_event = StreamEvent::Result {
            result: outcome.summary.clone(),
            usage: None,
            cost_usd: None,
            duration_ms: Some(outcome.duration_ms),
            extra: Default::default(),
        };
        result.trace.push(result_event.clone());
        self.forward(&session.id, bus, result_event).await;

        result.saw_result = true;
        result.final_text = outcome.summary;
        result.tools = vec!["Task".to_string()];
        result
    }

    async fn run_compaction(
        &self,
        session_id: &str,
        bus: &Arc<ExecutionBus>,
        monitor: &mut ContextWindowMonitor,
    ) {
        let started = monitor.begin_compaction();
        self.forward(session_id, bus, started).await;

        match self
            .store
            .compact(
                session_id,
                monitor.compaction_target_tokens(),
                self.config.context.keep_recent,
            )
            .await
        {
            Ok(report) if report.compacted => {
                info!(
                    session = session_id,
                    saved = report.tokens_saved(),
                    "history compacted"
                );
                for ev in monitor
                    .complete_compaction(report.tokens_after as u64, report.tokens_saved() as u64)
                {
                    self.forward(session_id, bus, ev).await;
                }
            }
            Ok(report) => {
                // Nothing the keep-rules allow dropping; report it anyway so
                // subscribers see the cycle close.
                for ev in monitor.complete_compaction(report.tokens_after as u64, 0) {
                    self.forward(session_id, bus, ev).await;
                }
            }
            Err(e) => {
                warn!(session = session_id, "compaction failed: {e}");
                monitor.fail_compaction();
                self.forward(
                    session_id,
                    bus,
                    StreamEvent::Error {
                        data: ErrorKind::CompactionFailed(e.to_string()).to_string(),
                    },
                )
                .await;
            }
        }
    }

    /// Terminal transition: each rollback step runs regardless of the
    /// others' outcome.  The terminal events go out last, so by the time a
    /// subscriber sees `done` the turn is persisted and the slot is free.
    async fn finish(&self, handle: &ExecutionHandle, session: &Session, result: PathResult) {
        let bus = &handle.bus;
        let timed_out = self.registry.was_timed_out(&handle.id).await;

        let mut closing: Vec<StreamEvent> = Vec::with_capacity(2);
        let status = if let Some(err) = &result.error {
            closing.push(StreamEvent::Error {
                data: err.to_string(),
            });
            closing.push(StreamEvent::Done {
                data: String::new(),
                aborted: err.aborted_flag(),
            });
            if matches!(err, ErrorKind::TimedOut) {
                ExecutionStatus::TimedOut
            } else {
                ExecutionStatus::Failed
            }
        } else if result.aborted {
            if timed_out {
                closing.push(StreamEvent::Error {
                    data: ErrorKind::TimedOut.to_string(),
                });
                closing.push(StreamEvent::Done {
                    data: String::new(),
                    aborted: true,
                });
                ExecutionStatus::TimedOut
            } else {
                // A user abort is terminal but not an error.
                closing.push(StreamEvent::Result {
                    result: "Execution aborted by user".to_string(),
                    usage: None,
                    cost_usd: None,
                    duration_ms: None,
                    extra: Default::default(),
                });
                closing.push(StreamEvent::Done {
                    data: String::new(),
                    aborted: true,
                });
                ExecutionStatus::Aborted
            }
        } else {
            closing.push(StreamEvent::Done {
                data: String::new(),
                aborted: false,
            });
            ExecutionStatus::Succeeded
        };

        // (a) Assistant turn, iff the CLI (or synthesis) produced a result.
        // The synthetic abort notice deliberately does not count.
        let mut persisted_messages = Vec::new();
        if result.saw_result {
            let mut msg = Message::assistant(&result.final_text);
            msg.tools_used = (!result.tools.is_empty()).then(|| result.tools.clone());
            msg.execution_events = Some(result.trace.clone());
            msg.usage = result.usage;
            msg.cost_usd = result.cost_usd;
            persisted_messages.push(msg.clone());
            if let Err(e) = self.store.append_message(&session.id, msg).await {
                error!(session = %session.id, "failed to persist assistant turn: {e}");
            }
        }

        // (b) Image scratch files are turn-scoped guards inside the
        // supervisor; they are gone by the time a turn resolves.
        // (c) Agent records were flushed on every transition by the spawner;
        // the store's monotonic upsert makes a re-flush here redundant.

        // (d) Release the slot.
        self.registry.close(&handle.id, status).await;
        info!(execution = %handle.id, ?status, "execution finished");

        for ev in closing {
            self.forward(&session.id, bus, ev).await;
        }

        // (e) Completed turns feed the memory collaborator.
        if status == ExecutionStatus::Succeeded && !persisted_messages.is_empty() {
            if let Err(e) = self.memory.extract(&session.id, &persisted_messages).await {
                warn!("memory extract failed: {e}");
            }
        }
    }
}

fn effective_work_dir(params: &ExecuteParams, session: &Session) -> String {
    params
        .work_dir
        .clone()
        .unwrap_or_else(|| session.work_dir.clone())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
