// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Per-provider overrides keyed by provider name (`claude`, `codex`,
    /// `gemini`).
    ///
    /// ```yaml
    /// providers:
    ///   claude:
    ///     binary: /opt/bin/claude
    ///     model: claude-opus-4-5
    ///   gemini:
    ///     extra_args: ["--sandbox"]
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderConfig>,
}

/// Admission, queueing, and timing caps for live executions.
///
/// Durations are plain seconds/milliseconds so the YAML stays greppable and
/// diffable; they are converted to `Duration` at the call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of executions alive across all sessions.
    #[serde(default = "default_max_active")]
    pub max_active_executions: usize,
    /// Maximum sub-agents one orchestration may run in parallel.
    #[serde(default = "default_max_sub_agents")]
    pub max_concurrent_sub_agents: usize,
    /// Bounded queue depth per event-bus subscriber.  A subscriber that
    /// falls this far behind is dropped, never the upstream.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue_depth: usize,
    /// Ring buffer of recent events kept per execution for late joiners.
    #[serde(default = "default_ring_capacity")]
    pub event_ring_capacity: usize,
    /// Hard wall-clock lifetime of one execution before the sweeper aborts it.
    #[serde(default = "default_execution_ttl")]
    pub execution_ttl_secs: u64,
    /// How often the registry sweeper scans for expired executions.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Abort a CLI that has produced no event for this long.
    #[serde(default = "default_cli_idle_timeout")]
    pub cli_idle_timeout_secs: u64,
    /// Per-sub-agent wall-clock budget.
    #[serde(default = "default_sub_agent_soft_cap")]
    pub sub_agent_soft_cap_secs: u64,
    /// Grace period between the graceful interrupt and the hard kill.
    #[serde(default = "default_graceful_grace")]
    pub graceful_grace_secs: u64,
    /// Tool results larger than this are truncated before forwarding.
    #[serde(default = "default_max_tool_output")]
    pub max_tool_output_bytes: usize,
    /// Auto-continuation iteration cap per user message.
    #[serde(default = "default_max_iterations")]
    pub continuation_max_iterations: u32,
    /// Pacing delay before an auto-continuation turn starts.
    #[serde(default = "default_pacing_ms")]
    pub continuation_pacing_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_active_executions: default_max_active(),
            max_concurrent_sub_agents: default_max_sub_agents(),
            subscriber_queue_depth: default_subscriber_queue(),
            event_ring_capacity: default_ring_capacity(),
            execution_ttl_secs: default_execution_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            cli_idle_timeout_secs: default_cli_idle_timeout(),
            sub_agent_soft_cap_secs: default_sub_agent_soft_cap(),
            graceful_grace_secs: default_graceful_grace(),
            max_tool_output_bytes: default_max_tool_output(),
            continuation_max_iterations: default_max_iterations(),
            continuation_pacing_ms: default_pacing_ms(),
        }
    }
}

fn default_max_active() -> usize {
    64
}
fn default_max_sub_agents() -> usize {
    4
}
fn default_subscriber_queue() -> usize {
    256
}
fn default_ring_capacity() -> usize {
    1024
}
fn default_execution_ttl() -> u64 {
    600
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_cli_idle_timeout() -> u64 {
    300
}
fn default_sub_agent_soft_cap() -> u64 {
    90
}
fn default_graceful_grace() -> u64 {
    2
}
fn default_max_tool_output() -> usize {
    256 * 1024
}
fn default_max_iterations() -> u32 {
    5
}
fn default_pacing_ms() -> u64 {
    1000
}

/// Context-window accounting thresholds.
///
/// Fractions are of `max_tokens`.  The step-down hysteresis prevents status
/// flapping right at a threshold boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_warning")]
    pub warning_threshold: f32,
    #[serde(default = "default_critical")]
    pub critical_threshold: f32,
    #[serde(default = "default_emergency")]
    pub emergency_threshold: f32,
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
    /// Compaction must bring usage at or below this fraction.
    #[serde(default = "default_compaction_target")]
    pub compaction_target: f32,
    /// Messages at the tail of the history that compaction never touches.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            warning_threshold: default_warning(),
            critical_threshold: default_critical(),
            emergency_threshold: default_emergency(),
            hysteresis: default_hysteresis(),
            compaction_target: default_compaction_target(),
            keep_recent: default_keep_recent(),
        }
    }
}

fn default_max_tokens() -> usize {
    200_000
}
fn default_warning() -> f32 {
    0.70
}
fn default_critical() -> f32 {
    0.85
}
fn default_emergency() -> f32 {
    0.95
}
fn default_hysteresis() -> f32 {
    0.05
}
fn default_compaction_target() -> f32 {
    0.60
}
fn default_keep_recent() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Prompts scoring at or below this run inline, without delegation.
    #[serde(default = "default_trivial_threshold")]
    pub trivial_threshold: u8,
    /// Per-agent output cap (tokens) folded into the synthesis.
    #[serde(default = "default_agent_summary_tokens")]
    pub agent_summary_max_tokens: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            trivial_threshold: default_trivial_threshold(),
            agent_summary_max_tokens: default_agent_summary_tokens(),
        }
    }
}

fn default_trivial_threshold() -> u8 {
    50
}
fn default_agent_summary_tokens() -> usize {
    500
}

/// Where session JSON lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory; `~` and `$VARS` are expanded.  Sessions are stored
    /// under `<data_dir>/sessions/<id>.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("maestro")
        .display()
        .to_string()
}

impl StoreConfig {
    /// The expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).into_owned())
    }
}

/// Overrides for a single provider CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Binary to invoke.  Defaults to the provider name itself (resolved
    /// via PATH).
    pub binary: Option<String>,
    /// Model forwarded to the CLI's `--model` flag where supported.
    pub model: Option<String>,
    /// Extra arguments appended verbatim after the built vector.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
