// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;

use async_trait::async_trait;
use maestro_protocol::{ModeFlags, PromptTurn, Provider, StreamEvent, UsageTotals};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::supervisor::SupervisorError;

/// Everything one CLI invocation needs.
#[derive(Debug, Clone, Default)]
pub struct PromptBundle {
    pub prompt: String,
    /// Prior turns rendered into the prompt when `resume` is off.
    pub history: Vec<PromptTurn>,
    pub session_id: String,
    pub work_dir: String,
    /// Resume the provider's own conversation state instead of re-sending
    /// history.
    pub resume: bool,
    /// Pasted images as `data:` URLs, or plain paths to existing files.
    /// The supervisor materialises data URLs into scratch files for the
    /// duration of the turn.
    pub images: Vec<String>,
    pub flags: ModeFlags,
    pub provider: Provider,
    /// Nudge the CLI that it may delegate internally.
    pub orchestrate_hint: bool,
}

impl PromptBundle {
    /// The prompt text actually handed to the CLI: inline history (when not
    /// resuming) followed by the current user text.
    pub fn effective_prompt(&self) -> String {
        if self.resume || self.history.is_empty() {
            return self.prompt.clone();
        }
        let mut out = String::from("Conversation so far:\n\n");
        for turn in &self.history {
            out.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        out.push_str("\nCurrent request:\n");
        out.push_str(&self.prompt);
        out
    }
}

/// What one turn produced, independent of how the process exited.
///
/// The exit code is deliberately absent: authoritative success is "a
/// `result` event was observed before the process exited".
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub result_text: Option<String>,
    pub usage: Option<UsageTotals>,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    /// Names of the tools the CLI invoked, in first-use order.
    pub tool_names: Vec<String>,
    pub saw_result: bool,
    pub aborted: bool,
    /// Trailing stderr output, for diagnostics when the CLI dies silently.
    pub stderr_tail: String,
}

/// The seam between the kernel/spawner and the underlying CLI.
///
/// `run_turn` streams events through `tx` as they happen and returns the
/// aggregate outcome when the process ends.  `cancel` aborts the turn;
/// `answers` feeds `user_answer` lines towards the CLI's stdin.
#[async_trait]
pub trait TurnDriver: Send + Sync {
    async fn run_turn(
        &self,
        bundle: PromptBundle,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        answers: mpsc::Receiver<String>,
    ) -> Result<TurnOutcome, SupervisorError>;
}

// ─── Mock driver ──────────────────────────────────────────────────────────────

/// Scripted [`TurnDriver`] for tests.
///
/// Each `run_turn` call pops the next script and replays its events in
/// order, deriving the outcome from the script (a `result` event sets
/// `saw_result`).  When the scripts run out, a canned `text` + `result`
/// pair echoing the prompt is replayed instead.
#[derive(Default)]
pub struct MockDriver {
    scripts: Mutex<VecDeque<MockScript>>,
}

struct MockScript {
    events: Vec<StreamEvent>,
    delay: std::time::Duration,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one turn's worth of events.
    pub async fn push_script(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().await.push_back(MockScript {
            events,
            delay: std::time::Duration::ZERO,
        });
    }

    /// Queue a script that pauses between events, so cancellation can land
    /// mid-stream.
    pub async fn push_slow_script(&self, events: Vec<StreamEvent>, delay: std::time::Duration) {
        self.scripts.lock().await.push_back(MockScript { events, delay });
    }

    fn echo_script(prompt: &str) -> MockScript {
        let reply = format!("[mock] {prompt}");
        MockScript {
            events: vec![
                StreamEvent::Text {
                    data: reply.clone(),
                    agent_id: None,
                    extra: Default::default(),
                },
                StreamEvent::Result {
                    result: reply,
                    usage: None,
                    cost_usd: None,
                    duration_ms: Some(1),
                    extra: Default::default(),
                },
            ],
            delay: std::time::Duration::ZERO,
        }
    }
}

#[async_trait]
impl TurnDriver for MockDriver {
    async fn run_turn(
        &self,
        bundle: PromptBundle,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        _answers: mpsc::Receiver<String>,
    ) -> Result<TurnOutcome, SupervisorError> {
        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Self::echo_script(&bundle.prompt));

        let mut outcome = TurnOutcome::default();
        for event in script.events {
            if cancel.is_cancelled() {
                outcome.aborted = true;
                return Ok(outcome);
            }
            if !script.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome.aborted = true;
                        return Ok(outcome);
                    }
                    _ = tokio::time::sleep(script.delay) => {}
                }
            }
            match &event {
                StreamEvent::Result {
                    result,
                    usage,
                    cost_usd,
                    duration_ms,
                    ..
                } => {
                    outcome.saw_result = true;
                    outcome.result_text = Some(result.clone());
                    outcome.usage = *usage;
                    outcome.cost_usd = *cost_usd;
                    outcome.duration_ms = duration_ms.unwrap_or(1);
                }
                StreamEvent::ToolUse { tool, .. } => {
                    if !outcome.tool_names.contains(tool) {
                        outcome.tool_names.push(tool.clone());
                    }
                }
                _ => {}
            }
            if tx.send(event).await.is_err() {
                break;
            }
            // Yield between events so aborts interleave realistically.
            tokio::task::yield_now().await;
        }
        Ok(outcome)
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_prompt_inlines_history_when_not_resuming() {
        let bundle = PromptBundle {
            prompt: "and now?".into(),
            history: vec![
                PromptTurn {
                    role: "user".into(),
                    content: "hello".into(),
                },
                PromptTurn {
                    role: "assistant".into(),
                    content: "hi".into(),
                },
            ],
            ..Default::default()
        };
        let p = bundle.effective_prompt();
        assert!(p.contains("user: hello"));
        assert!(p.contains("assistant: hi"));
        assert!(p.ends_with("and now?"));
    }

    #[test]
    fn effective_prompt_skips_history_when_resuming() {
        let bundle = PromptBundle {
            prompt: "next".into(),
            history: vec![PromptTurn {
                role: "user".into(),
                content: "old".into(),
            }],
            resume: true,
            ..Default::default()
        };
        assert_eq!(bundle.effective_prompt(), "next");
    }

    #[tokio::test]
    async fn mock_driver_echoes_by_default() {
        let driver = MockDriver::new();
        let (tx, mut rx) = mpsc::channel(16);
        let (_atx, arx) = mpsc::channel(1);
        let outcome = driver
            .run_turn(
                PromptBundle {
                    prompt: "ping".into(),
                    ..Default::default()
                },
                tx,
                CancellationToken::new(),
                arx,
            )
            .await
            .unwrap();
        assert!(outcome.saw_result);
        assert_eq!(outcome.result_text.as_deref(), Some("[mock] ping"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StreamEvent::Text { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, StreamEvent::Result { .. }));
    }

    #[tokio::test]
    async fn mock_driver_replays_scripts_in_order() {
        let driver = MockDriver::new();
        driver
            .push_script(vec![StreamEvent::Result {
                result: "first".into(),
                usage: None,
                cost_usd: None,
                duration_ms: None,
                extra: Default::default(),
            }])
            .await;
        driver
            .push_script(vec![StreamEvent::Result {
                result: "second".into(),
                usage: None,
                cost_usd: None,
                duration_ms: None,
                extra: Default::default(),
            }])
            .await;

        for expected in ["first", "second"] {
            let (tx, mut rx) = mpsc::channel(16);
            let (_atx, arx) = mpsc::channel(1);
            let outcome = driver
                .run_turn(
                    PromptBundle::default(),
                    tx,
                    CancellationToken::new(),
                    arx,
                )
                .await
                .unwrap();
            assert_eq!(outcome.result_text.as_deref(), Some(expected));
            while rx.recv().await.is_some() {}
        }
    }

    #[tokio::test]
    async fn mock_driver_stops_on_cancel() {
        let driver = MockDriver::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);
        let (_atx, arx) = mpsc::channel(1);
        let outcome = driver
            .run_turn(PromptBundle::default(), tx, cancel, arx)
            .await
            .unwrap();
        assert!(outcome.aborted);
        assert!(!outcome.saw_result);
        assert!(rx.recv().await.is_none());
    }
}
