// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Context window accounting and threshold transitions.
//!
//! ```text
//! safe ──≥0.70── warning ──≥0.85── critical ──trigger── compacting ── safe
//!   ▲                                                                  │
//!   └───────────── step-down with 5% hysteresis ──────────────────────┘
//! ```
//!
//! Token counts come from the bytes/4 approximation until the CLI reports
//! authoritative usage in a `result` event, which then supersedes.

use maestro_config::ContextConfig;
use maestro_protocol::{
    ContextBreakdown, ContextWindowEventKind, ContextWindowState, StreamEvent, UsageTotals,
    WindowStatus,
};
use tracing::debug;

pub struct ContextWindowMonitor {
    cfg: ContextConfig,
    status: WindowStatus,
    breakdown: ContextBreakdown,
    /// Authoritative total from the provider, when known.
    reported_used: Option<u64>,
}

impl ContextWindowMonitor {
    pub fn new(cfg: ContextConfig) -> Self {
        Self {
            cfg,
            status: WindowStatus::Safe,
            breakdown: ContextBreakdown::default(),
            reported_used: None,
        }
    }

    /// The `context_window{event:init}` announcement for a fresh execution.
    pub fn init_event(&self) -> StreamEvent {
        StreamEvent::ContextWindow {
            event: ContextWindowEventKind::Init,
            state: Some(self.state()),
            tokens_saved: None,
        }
    }

    /// Seed the approximate accounting from the session's stored history.
    pub fn set_history_tokens(&mut self, system: u64, history: u64) {
        self.breakdown.system = system;
        self.breakdown.history = history;
        self.reported_used = None;
    }

    /// Accumulate the in-flight turn (text deltas, tool results).
    pub fn add_current(&mut self, tokens: u64) {
        self.breakdown.current += tokens;
    }

    pub fn add_tool_tokens(&mut self, tokens: u64) {
        self.breakdown.tools += tokens;
    }

    /// Authoritative usage from a `result` event supersedes the estimate.
    pub fn observe_usage(&mut self, usage: &UsageTotals) {
        self.reported_used = Some(usage.context_tokens());
    }

    pub fn used_tokens(&self) -> u64 {
        self.reported_used.unwrap_or(
            self.breakdown.system
                + self.breakdown.history
                + self.breakdown.tools
                + self.breakdown.current,
        )
    }

    pub fn percentage(&self) -> f32 {
        if self.cfg.max_tokens == 0 {
            return 0.0;
        }
        self.used_tokens() as f32 / self.cfg.max_tokens as f32
    }

    /// Usage at or beyond the emergency line.
    pub fn is_emergency(&self) -> bool {
        self.percentage() >= self.cfg.emergency_threshold
    }

    /// Compaction fires on entering `critical`.
    pub fn needs_compaction(&self) -> bool {
        self.status == WindowStatus::Critical
    }

    /// Target footprint compaction must reach.
    pub fn compaction_target_tokens(&self) -> usize {
        (self.cfg.max_tokens as f32 * self.cfg.compaction_target) as usize
    }

    pub fn state(&self) -> ContextWindowState {
        ContextWindowState {
            used_tokens: self.used_tokens(),
            max_tokens: self.cfg.max_tokens as u64,
            percentage: self.percentage(),
            status: self.status,
            breakdown: self.breakdown,
        }
    }

    /// Re-evaluate the status band and return the events any transition
    /// produces.  Applies 5% hysteresis on the way down.
    pub fn evaluate(&mut self) -> Vec<StreamEvent> {
        if self.status == WindowStatus::Compacting {
            // Transitions out of compacting go through complete_compaction.
            return Vec::new();
        }
        let p = self.percentage();
        let raw = if p >= self.cfg.critical_threshold {
            WindowStatus::Critical
        } else if p >= self.cfg.warning_threshold {
            WindowStatus::Warning
        } else {
            WindowStatus::Safe
        };

        let next = if raw < self.status {
            // Step down only once usage is clearly below the band edge.
            let edge = match self.status {
                WindowStatus::Critical => self.cfg.critical_threshold,
                WindowStatus::Warning => self.cfg.warning_threshold,
                _ => 0.0,
            };
            if p < edge - self.cfg.hysteresis {
                raw
            } else {
                self.status
            }
        } else {
            raw
        };

        if next == self.status {
            return Vec::new();
        }
        let prev = self.status;
        self.status = next;
        debug!(?prev, ?next, pct = p, "context window status changed");

        let mut events = vec![StreamEvent::ContextWindow {
            event: ContextWindowEventKind::StatusChanged,
            state: Some(self.state()),
            tokens_saved: None,
        }];
        if next == WindowStatus::Warning && prev < WindowStatus::Warning {
            events.push(StreamEvent::ContextWindow {
                event: ContextWindowEventKind::ThresholdWarning,
                state: Some(self.state()),
                tokens_saved: None,
            });
        }
        if next == WindowStatus::Critical && prev < WindowStatus::Critical {
            events.push(StreamEvent::ContextWindow {
                event: ContextWindowEventKind::ThresholdCritical,
                state: Some(self.state()),
                tokens_saved: None,
            });
        }
        events
    }

    /// Enter the transient compacting state.
    pub fn begin_compaction(&mut self) -> StreamEvent {
        self.status = WindowStatus::Compacting;
        StreamEvent::ContextWindow {
            event: ContextWindowEventKind::CompactionStarted,
            state: Some(self.state()),
            tokens_saved: None,
        }
    }

    /// Leave compacting with the new footprint; recomputes the band.
    pub fn complete_compaction(&mut self, new_history_tokens: u64, tokens_saved: u64) -> Vec<StreamEvent> {
        self.breakdown.history = new_history_tokens;
        self.breakdown.current = 0;
        self.breakdown.tools = 0;
        self.reported_used = None;

        let p = self.percentage();
        self.status = if p >= self.cfg.critical_threshold {
            WindowStatus::Critical
        } else if p >= self.cfg.warning_threshold {
            WindowStatus::Warning
        } else {
            WindowStatus::Safe
        };

        vec![
            StreamEvent::ContextWindow {
                event: ContextWindowEventKind::CompactionCompleted,
                state: Some(self.state()),
                tokens_saved: Some(tokens_saved),
            },
            StreamEvent::ContextWindow {
                event: ContextWindowEventKind::StatusChanged,
                state: Some(self.state()),
                tokens_saved: None,
            },
        ]
    }

    /// Compaction failed: fall back to the last stable band.
    pub fn fail_compaction(&mut self) {
        let p = self.percentage();
        self.status = if p >= self.cfg.critical_threshold {
            WindowStatus::Critical
        } else if p >= self.cfg.warning_threshold {
            WindowStatus::Warning
        } else {
            WindowStatus::Safe
        };
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
