// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cheap, deterministic prompt pre-classification.
//!
//! The classifier is a pure function: no I/O, no clocks, no randomness.
//! Identical inputs produce byte-identical outputs, so results are safely
//! memoizable and re-runnable.

use serde::{Deserialize, Serialize};

/// Keyword map compiled once; iteration order is the declaration order, so
/// domain lists come out in a stable order.
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("auth", &["auth", "login", "password", "oauth", "session token", "permission"]),
    ("database", &["database", "sql", "query", "migration", "schema", "index"]),
    ("api", &["api", "endpoint", "rest", "http", "route", "request handler"]),
    ("frontend", &["frontend", "ui", "css", "component", "render", "browser"]),
    ("testing", &["test", "tests", "coverage", "regression", "flaky"]),
    ("build", &["build", "compile", "pipeline", "ci", "deploy", "release"]),
    ("performance", &["performance", "slow", "optimize", "profil", "latency", "memory leak"]),
    ("security", &["security", "vulnerability", "injection", "xss", "sanitize", "cve"]),
    ("docs", &["readme", "documentation", "docs", "changelog"]),
    ("concurrency", &["concurrency", "race", "deadlock", "thread", "async", "lock"]),
];

/// Difficulty signals and their score weights.
const SIGNAL_WEIGHTS: &[(&[&str], u8)] = &[
    (&["refactor"], 25),
    (&["multi-file", "across"], 20),
    (&["integration"], 15),
    (&["debug", "investigate"], 10),
];

/// Verbs that mark a prompt as implementation-shaped (rather than a plain
/// question), which is what warrants a `builder` agent.
const IMPLEMENTATION_VERBS: &[&str] = &[
    "implement", "fix", "add", "refactor", "build", "create", "write", "update", "change",
    "migrate", "rename", "remove", "debug",
];

const BASE_SCORE: u8 = 10;
const EXTRA_DOMAIN_WEIGHT: u8 = 8;

/// The classifier's verdict on one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// 0–100; higher means more coordination is likely needed.
    pub complexity_score: u8,
    pub domains: Vec<String>,
    pub estimated_tool_calls: u32,
    pub requires_delegation: bool,
    /// Expert domains available right now that the prompt touches, in the
    /// order the prompt first matched them.
    pub suggested_experts: Vec<String>,
    pub suggested_agents: Vec<String>,
    pub reasoning: String,
}

/// Classify `prompt` against the currently available expert domain tags.
///
/// `trivial_threshold` is the delegation cut-off: anything scoring at or
/// below it is handled inline.
pub fn classify(prompt: &str, available_experts: &[String], trivial_threshold: u8) -> Classification {
    let lower = prompt.to_lowercase();

    let domains: Vec<String> = DOMAIN_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(domain, _)| domain.to_string())
        .collect();

    let mut score = BASE_SCORE as u32;
    let mut signals: Vec<&str> = Vec::new();
    for (words, weight) in SIGNAL_WEIGHTS {
        if let Some(hit) = words.iter().find(|w| lower.contains(*w)) {
            score += *weight as u32;
            signals.push(*hit);
        }
    }
    if domains.len() > 1 {
        score += (domains.len() as u32 - 1) * EXTRA_DOMAIN_WEIGHT as u32;
    }
    let score = score.min(100) as u8;

    let requires_delegation = score > trivial_threshold;

    let mut agents: Vec<String> = Vec::new();
    if IMPLEMENTATION_VERBS.iter().any(|v| lower.contains(v)) {
        agents.push("builder".to_string());
    }
    if score > 40 {
        agents.push("scout".to_string());
    }
    if score > 70 {
        agents.push("reviewer".to_string());
    }
    if score > 80 {
        agents.push("planner".to_string());
    }

    let suggested_experts: Vec<String> = domains
        .iter()
        .filter(|d| available_experts.iter().any(|e| e == *d))
        .cloned()
        .collect();

    let reasoning = format!(
        "score {score} (base {BASE_SCORE}, signals: [{}], domains: [{}]); delegation {}",
        signals.join(", "),
        domains.join(", "),
        if requires_delegation { "required" } else { "not required" },
    );

    Classification {
        complexity_score: score,
        domains,
        estimated_tool_calls: 2 + score as u32 / 10,
        requires_delegation,
        suggested_experts,
        suggested_agents: agents,
        reasoning,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
