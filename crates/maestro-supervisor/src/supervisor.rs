// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_config::{Config, LimitsConfig, ProviderConfig};
use maestro_protocol::{ErrorKind, StreamEvent};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::args::build_invocation;
use crate::driver::{PromptBundle, TurnDriver, TurnOutcome};
use crate::images::ImageScratch;
use crate::parse::{parse_line, LineOutcome};

/// Parse failures tolerated within [`PARSE_FAILURE_WINDOW`] before the turn
/// is aborted with a protocol error.
const PARSE_FAILURE_LIMIT: usize = 16;
const PARSE_FAILURE_WINDOW: Duration = Duration::from_secs(1);
/// How much trailing stderr is kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("invalid image attachment: {0}")]
    BadImage(String),

    #[error("CLI produced no event for {0:?}")]
    Stalled(Duration),

    #[error("persistent unparsable CLI output: {0}")]
    Protocol(String),
}

impl SupervisorError {
    /// Translate into the wire taxonomy.
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Spawn { program, source } => {
                ErrorKind::CliFailed(format!("spawn {program}: {source}"))
            }
            SupervisorError::Io(e) => ErrorKind::Io(e.to_string()),
            SupervisorError::BadImage(msg) => ErrorKind::Validation(msg.clone()),
            SupervisorError::Stalled(_) => ErrorKind::Stalled,
            SupervisorError::Protocol(msg) => ErrorKind::ProtocolError(msg.clone()),
        }
    }
}

/// Supervises one CLI process per [`run_turn`](TurnDriver::run_turn) call.
pub struct CliSupervisor {
    idle_timeout: Duration,
    graceful_grace: Duration,
    max_tool_output: usize,
    providers: HashMap<String, ProviderConfig>,
}

impl CliSupervisor {
    pub fn new(limits: &LimitsConfig, providers: HashMap<String, ProviderConfig>) -> Self {
        Self {
            idle_timeout: Duration::from_secs(limits.cli_idle_timeout_secs),
            graceful_grace: Duration::from_secs(limits.graceful_grace_secs),
            max_tool_output: limits.max_tool_output_bytes,
            providers,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.limits, config.providers.clone())
    }

    /// Graceful interrupt, then hard kill after the grace period.
    /// Safe to call more than once.
    async fn abort_child(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid came from a live child we own; worst case the
            // process already exited and the signal goes nowhere.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
            if timeout(self.graceful_grace, child.wait()).await.is_ok() {
                return;
            }
            warn!("CLI ignored interrupt; escalating to kill");
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[async_trait]
impl TurnDriver for CliSupervisor {
    async fn run_turn(
        &self,
        bundle: PromptBundle,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        mut answers: mpsc::Receiver<String>,
    ) -> Result<TurnOutcome, SupervisorError> {
        let started = Instant::now();

        // Scratch files live exactly as long as this call; the guard's Drop
        // unlinks them on every exit path below, early errors included.
        let scratch = ImageScratch::materialize(&bundle.images)?;
        let image_paths = scratch.paths();

        let overrides = self.providers.get(bundle.provider.binary_name());
        let invocation = build_invocation(&bundle, &image_paths, overrides);
        debug!(
            provider = %bundle.provider,
            program = %invocation.program,
            "spawning CLI"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !bundle.work_dir.is_empty() {
            cmd.current_dir(&bundle.work_dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Io(other_io("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SupervisorError::Io(other_io("stderr not piped")))?;
        let mut stdin = child.stdin.take();

        // Stderr drains in its own task; only the tail is retained.
        let stderr_buf: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let stderr_task = {
            let buf = stderr_buf.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut buf = buf.lock().await;
                    buf.push_str(&line);
                    buf.push('\n');
                    if buf.len() > STDERR_TAIL_BYTES {
                        let cut = buf.len() - STDERR_TAIL_BYTES;
                        let boundary = buf
                            .char_indices()
                            .map(|(i, _)| i)
                            .find(|i| *i >= cut)
                            .unwrap_or(cut);
                        buf.drain(..boundary);
                    }
                }
            })
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut outcome = TurnOutcome::default();
        let mut pending_answers: VecDeque<String> = VecDeque::new();
        let mut waiting_for_answer = false;
        let mut parse_failures: VecDeque<Instant> = VecDeque::new();
        let mut answers_open = true;

        'stream: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("turn cancelled; aborting CLI");
                    drop(stdin.take());
                    self.abort_child(&mut child).await;
                    outcome.aborted = true;
                    break 'stream;
                }

                maybe = answers.recv(), if answers_open => {
                    match maybe {
                        Some(answer) => {
                            if waiting_for_answer {
                                if let Some(stdin) = stdin.as_mut() {
                                    write_answer(stdin, &answer).await;
                                }
                                waiting_for_answer = false;
                            } else {
                                // Buffered until the CLI actually asks.
                                pending_answers.push_back(answer);
                            }
                        }
                        None => answers_open = false,
                    }
                }

                read = timeout(self.idle_timeout, lines.next_line()) => {
                    let line = match read {
                        Err(_) => {
                            warn!("CLI idle for {:?}; aborting", self.idle_timeout);
                            drop(stdin.take());
                            self.abort_child(&mut child).await;
                            return Err(SupervisorError::Stalled(self.idle_timeout));
                        }
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => break 'stream,
                        Ok(Err(e)) => {
                            warn!("stdout read error: {e}");
                            break 'stream;
                        }
                    };

                    match parse_line(bundle.provider, &line, self.max_tool_output) {
                        LineOutcome::ParseFailure => {
                            let now = Instant::now();
                            parse_failures.push_back(now);
                            while parse_failures
                                .front()
                                .is_some_and(|t| now.duration_since(*t) > PARSE_FAILURE_WINDOW)
                            {
                                parse_failures.pop_front();
                            }
                            {
                                // Unparsable output joins the stderr-like log.
                                let mut buf = stderr_buf.lock().await;
                                buf.push_str(&line);
                                buf.push('\n');
                            }
                            if parse_failures.len() > PARSE_FAILURE_LIMIT {
                                drop(stdin.take());
                                self.abort_child(&mut child).await;
                                return Err(SupervisorError::Protocol(format!(
                                    "{} unparsable lines within {:?}",
                                    parse_failures.len(),
                                    PARSE_FAILURE_WINDOW
                                )));
                            }
                        }
                        LineOutcome::WaitingForAnswer(event) => {
                            waiting_for_answer = true;
                            if let Some(answer) = pending_answers.pop_front() {
                                if let Some(stdin) = stdin.as_mut() {
                                    write_answer(stdin, &answer).await;
                                }
                                waiting_for_answer = false;
                            }
                            if tx.send(event).await.is_err() {
                                drop(stdin.take());
                                self.abort_child(&mut child).await;
                                outcome.aborted = true;
                                break 'stream;
                            }
                        }
                        LineOutcome::Events(events) => {
                            for event in events {
                                record(&mut outcome, &event);
                                if tx.send(event).await.is_err() {
                                    // Consumer gone; nobody is listening.
                                    drop(stdin.take());
                                    self.abort_child(&mut child).await;
                                    outcome.aborted = true;
                                    break 'stream;
                                }
                            }
                        }
                    }
                }
            }
        }

        if !outcome.aborted {
            drop(stdin.take());
            match timeout(self.graceful_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    if !status.success() && !outcome.saw_result {
                        debug!(?status, "CLI exited non-zero without a result event");
                    }
                }
                Ok(Err(e)) => warn!("wait on CLI failed: {e}"),
                Err(_) => {
                    warn!("CLI kept running after stdout EOF; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        // The child is gone, so stderr hits EOF and the drainer finishes on
        // its own; the timeout is a backstop against a wedged pipe.
        let mut stderr_task = stderr_task;
        if timeout(Duration::from_millis(250), &mut stderr_task)
            .await
            .is_err()
        {
            stderr_task.abort();
        }
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome.stderr_tail = stderr_buf.lock().await.clone();
        Ok(outcome)
    }
}

fn other_io(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, msg.to_string())
}

async fn write_answer(stdin: &mut ChildStdin, answer: &str) {
    let mut line = answer.to_string();
    line.push('\n');
    if let Err(e) = stdin.write_all(line.as_bytes()).await {
        warn!("failed to inject answer: {e}");
        return;
    }
    let _ = stdin.flush().await;
}

/// Fold one forwarded event into the aggregate outcome.
fn record(outcome: &mut TurnOutcome, event: &StreamEvent) {
    match event {
        StreamEvent::Result {
            result,
            usage,
            cost_usd,
            ..
        } => {
            outcome.saw_result = true;
            outcome.result_text = Some(result.clone());
            if usage.is_some() {
                outcome.usage = *usage;
            }
            if cost_usd.is_some() {
                outcome.cost_usd = *cost_usd;
            }
        }
        StreamEvent::ToolUse { tool, .. } => {
            if !outcome.tool_names.contains(tool) {
                outcome.tool_names.push(tool.clone());
            }
        }
        _ => {}
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
