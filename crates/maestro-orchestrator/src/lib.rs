// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Autonomous multi-agent orchestration.
//!
//! When a request asks for lead orchestration, the flow is:
//! classify the prompt (pure, deterministic) → derive a plan (which roles,
//! capped parallelism) → fan the sub-agents out through the
//! [`SubAgentSpawner`] with all-settled semantics → synthesize one Markdown
//! summary.  Every step streams events so subscribers watch the tree grow
//! in real time.

mod classifier;
mod expertise;
mod lead;
mod spawner;

pub use classifier::{classify, Classification};
pub use expertise::{ExpertisePack, ExpertiseSource, KeyFile, NoExpertise, Pattern};
pub use lead::{LeadOrchestrator, OrchestrationOutcome, OrchestrationRequest};
pub use spawner::{AgentMetrics, AgentOutcome, SpawnRequest, SubAgentSpawner};
