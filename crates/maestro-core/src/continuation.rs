// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! "Is this reply truncated, shall we auto-continue?"
//!
//! A completed assistant turn is followed by a synthetic `continue` turn
//! when the reply looks cut off — up to a hard iteration cap so a confused
//! model can never loop forever.

use maestro_protocol::{ContinuationState, StopReason, StreamEvent};

/// Substrings the model uses to declare itself done.
const COMPLETION_MARKERS: &[&str] = &["[DONE]", "</complete>", "<promise>DONE</promise>"];
/// Trailing markers that explicitly signal a cut-off reply.
const TRUNCATION_INDICATORS: &[&str] = &["...", "[TRUNCATED]", "[CONTINUE]"];
/// Characters that can legitimately end a complete reply.
const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?', ':', '"', '`', ')', '}'];

/// The punctuation heuristic only applies to substantial replies; a short
/// one-liner ("4") is an answer, not a truncation.
const PUNCTUATION_CHECK_MIN_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationDecision {
    pub should_continue: bool,
    pub reason: StopReason,
}

/// Per-execution continuation state.
pub struct ContinuationController {
    current_iteration: u32,
    max_iterations: u32,
}

impl ContinuationController {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            current_iteration: 1,
            max_iterations,
        }
    }

    pub fn state(&self) -> ContinuationState {
        ContinuationState {
            current_iteration: self.current_iteration,
            max_iterations: self.max_iterations,
        }
    }

    /// Decide whether the turn that just completed warrants a continuation.
    ///
    /// `events` is the turn's trace; an unanswered `tool_use` marks the
    /// reply as truncated regardless of its text.
    pub fn decide(&self, response: &str, events: &[StreamEvent]) -> ContinuationDecision {
        if self.current_iteration >= self.max_iterations {
            return ContinuationDecision {
                should_continue: false,
                reason: StopReason::MaxIterations,
            };
        }
        if COMPLETION_MARKERS.iter().any(|m| response.contains(m)) {
            return ContinuationDecision {
                should_continue: false,
                reason: StopReason::Completed,
            };
        }
        if is_truncated(response) || has_unmatched_tool_use(events) {
            return ContinuationDecision {
                should_continue: true,
                reason: StopReason::Truncated,
            };
        }
        ContinuationDecision {
            should_continue: false,
            reason: StopReason::CompleteEnough,
        }
    }

    /// Advance to the next iteration and return its announcement event.
    pub fn begin_iteration(&mut self) -> StreamEvent {
        self.current_iteration += 1;
        StreamEvent::Continuation {
            event: maestro_protocol::ContinuationEventKind::Iteration,
            state: Some(self.state()),
            reason: None,
        }
    }

    /// The terminal continuation event.
    pub fn completed_event(&self, reason: StopReason) -> StreamEvent {
        StreamEvent::Continuation {
            event: maestro_protocol::ContinuationEventKind::Completed,
            state: Some(self.state()),
            reason: Some(reason),
        }
    }

    /// True once at least one continuation turn has run.
    pub fn continued(&self) -> bool {
        self.current_iteration > 1
    }

    /// The synthetic prompt for the next turn.
    pub fn synthesize_prompt(response: &str) -> String {
        let last_line = response
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        format!(
            "Continue from where you left off. Previous response ended with: {last_line}"
        )
    }
}

fn is_truncated(response: &str) -> bool {
    let trimmed = response.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    if TRUNCATION_INDICATORS.iter().any(|t| trimmed.ends_with(t)) {
        return true;
    }
    if trimmed.len() >= PUNCTUATION_CHECK_MIN_CHARS {
        let last_line = trimmed
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim_end();
        if let Some(last) = last_line.chars().last() {
            if !TERMINAL_PUNCTUATION.contains(&last) {
                return true;
            }
        }
    }
    false
}

fn has_unmatched_tool_use(events: &[StreamEvent]) -> bool {
    events.iter().any(|ev| {
        if let StreamEvent::ToolUse { tool_use_id, .. } = ev {
            !events.iter().any(|other| {
                matches!(
                    other,
                    StreamEvent::ToolResult { tool_use_id: id, .. } if id == tool_use_id
                )
            })
        } else {
            false
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ContinuationController {
        ContinuationController::new(5)
    }

    fn long_text(ending: &str) -> String {
        format!(
            "Here is a long explanation of what was done across several steps \
             and files in the repository{ending}"
        )
    }

    // ── Decision table ────────────────────────────────────────────────────────

    #[test]
    fn short_answer_is_complete_enough() {
        let d = controller().decide("4", &[]);
        assert!(!d.should_continue);
        assert_eq!(d.reason, StopReason::CompleteEnough);
    }

    #[test]
    fn completion_marker_stops_continuation() {
        for marker in COMPLETION_MARKERS {
            let d = controller().decide(&format!("work done {marker}"), &[]);
            assert!(!d.should_continue);
            assert_eq!(d.reason, StopReason::Completed, "marker {marker}");
        }
    }

    #[test]
    fn ellipsis_means_truncated() {
        let d = controller().decide("I will now proceed to...", &[]);
        assert!(d.should_continue);
        assert_eq!(d.reason, StopReason::Truncated);
    }

    #[test]
    fn explicit_truncation_markers() {
        for marker in ["[TRUNCATED]", "[CONTINUE]"] {
            let d = controller().decide(&format!("partial output {marker}"), &[]);
            assert!(d.should_continue, "marker {marker}");
        }
    }

    #[test]
    fn long_reply_without_terminal_punctuation_is_truncated() {
        let d = controller().decide(&long_text(" and then the next step was"), &[]);
        assert!(d.should_continue);
        assert_eq!(d.reason, StopReason::Truncated);
    }

    #[test]
    fn long_reply_with_terminal_punctuation_is_complete() {
        let d = controller().decide(&long_text("."), &[]);
        assert!(!d.should_continue);
        assert_eq!(d.reason, StopReason::CompleteEnough);
    }

    #[test]
    fn code_fence_and_brace_endings_count_as_terminal() {
        for ending in ["`", ")", "}", "\"", ":"] {
            let d = controller().decide(&long_text(ending), &[]);
            assert!(!d.should_continue, "ending {ending:?}");
        }
    }

    #[test]
    fn unmatched_tool_use_forces_continuation() {
        let events = vec![StreamEvent::ToolUse {
            tool: "bash".into(),
            tool_use_id: "t-1".into(),
            tool_input: None,
            parent_tool_use_id: None,
            agent_id: None,
            extra: Default::default(),
        }];
        let d = controller().decide("All finished here.", &events);
        assert!(d.should_continue);
        assert_eq!(d.reason, StopReason::Truncated);
    }

    #[test]
    fn matched_tool_use_does_not_force_continuation() {
        let events = vec![
            StreamEvent::ToolUse {
                tool: "bash".into(),
                tool_use_id: "t-1".into(),
                tool_input: None,
                parent_tool_use_id: None,
                agent_id: None,
                extra: Default::default(),
            },
            StreamEvent::ToolResult {
                tool: "bash".into(),
                tool_use_id: "t-1".into(),
                tool_output: Some("ok".into()),
                parent_tool_use_id: None,
                agent_id: None,
                extra: Default::default(),
            },
        ];
        let d = controller().decide("All finished here.", &events);
        assert!(!d.should_continue);
    }

    // ── Iteration cap ─────────────────────────────────────────────────────────

    #[test]
    fn max_iterations_caps_continuation() {
        let mut c = ContinuationController::new(3);
        // Iterations 1 and 2 may continue; after begin_iteration twice the
        // counter sits at 3 == max, so the next decision stops.
        assert!(c.decide("cut off...", &[]).should_continue);
        c.begin_iteration();
        assert!(c.decide("cut off...", &[]).should_continue);
        c.begin_iteration();
        let d = c.decide("cut off...", &[]);
        assert!(!d.should_continue);
        assert_eq!(d.reason, StopReason::MaxIterations);
    }

    #[test]
    fn begin_iteration_counts_and_reports_state() {
        let mut c = controller();
        assert!(!c.continued());
        let ev = c.begin_iteration();
        assert!(c.continued());
        match ev {
            StreamEvent::Continuation { state, .. } => {
                assert_eq!(state.unwrap().current_iteration, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // ── Prompt synthesis ──────────────────────────────────────────────────────

    #[test]
    fn synthesized_prompt_quotes_last_nonempty_line() {
        let prompt =
            ContinuationController::synthesize_prompt("step one\nstep two was started\n\n");
        assert_eq!(
            prompt,
            "Continue from where you left off. Previous response ended with: step two was started"
        );
    }
}
