// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A read-only bundle of domain knowledge used to enrich a sub-agent's
/// prompt.  Produced by the external expertise collaborator; the kernel
/// never mutates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpertisePack {
    pub domain: String,
    /// Prose description of how this part of the system works.
    pub mental_model: String,
    #[serde(default)]
    pub key_files: Vec<KeyFile>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default)]
    pub known_issues: Vec<String>,
    /// 0.0–1.0; how much the learning loop trusts this pack.
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFile {
    pub path: String,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub example: String,
}

impl ExpertisePack {
    /// Render the pack as a prompt section for a sub-agent.
    pub fn render(&self) -> String {
        let mut out = format!(
            "## Domain expertise: {} (confidence {:.2})\n\n{}\n",
            self.domain, self.confidence, self.mental_model
        );
        if !self.key_files.is_empty() {
            out.push_str("\nKey files:\n");
            for f in &self.key_files {
                out.push_str(&format!("- {} — {}\n", f.path, f.purpose));
            }
        }
        if !self.patterns.is_empty() {
            out.push_str("\nEstablished patterns:\n");
            for p in &self.patterns {
                out.push_str(&format!("- {}: {}\n", p.name, p.example));
            }
        }
        if !self.known_issues.is_empty() {
            out.push_str("\nKnown issues:\n");
            for issue in &self.known_issues {
                out.push_str(&format!("- {issue}\n"));
            }
        }
        out
    }
}

/// The external expertise collaborator, seen from the kernel's side.
#[async_trait]
pub trait ExpertiseSource: Send + Sync {
    /// Domain tags packs exist for right now.
    fn available_domains(&self) -> Vec<String>;

    /// Fetch the pack for one domain, if any.
    async fn pack_for(&self, domain: &str) -> Option<ExpertisePack>;
}

/// An [`ExpertiseSource`] with nothing to offer; the default wiring.
pub struct NoExpertise;

#[async_trait]
impl ExpertiseSource for NoExpertise {
    fn available_domains(&self) -> Vec<String> {
        Vec::new()
    }

    async fn pack_for(&self, _domain: &str) -> Option<ExpertisePack> {
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
