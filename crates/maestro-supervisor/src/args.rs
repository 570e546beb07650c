// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Provider argument-vector construction.
//!
//! Each provider CLI has its own flag dialect, but the invariants are
//! shared: the prompt goes in as one argument, history rides on the
//! provider's own resume mechanism, images are repeated `--image <path>`
//! arguments, and output is requested as streaming JSON.

use maestro_config::ProviderConfig;
use maestro_protocol::Provider;

use crate::driver::PromptBundle;

/// System-prompt addendum sent when the caller set the orchestrate hint.
const ORCHESTRATE_HINT: &str = "You may decompose this task and delegate sub-tasks \
     to your own agents where that produces a better result.";

/// The program and argument vector for one CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

/// Build the full invocation for `bundle`, honouring config overrides.
/// `image_paths` are the already-materialised attachment files.
pub fn build_invocation(
    bundle: &PromptBundle,
    image_paths: &[String],
    overrides: Option<&ProviderConfig>,
) -> Invocation {
    let program = overrides
        .and_then(|o| o.binary.clone())
        .unwrap_or_else(|| bundle.provider.binary_name().to_string());

    let mut args = match bundle.provider {
        Provider::Claude => claude_args(bundle, overrides),
        Provider::Codex => codex_args(bundle, overrides),
        Provider::Gemini => gemini_args(bundle),
    };

    for path in image_paths {
        args.push("--image".to_string());
        args.push(path.clone());
    }
    if let Some(o) = overrides {
        args.extend(o.extra_args.iter().cloned());
    }

    Invocation { program, args }
}

fn claude_args(bundle: &PromptBundle, overrides: Option<&ProviderConfig>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        bundle.effective_prompt(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if bundle.resume && !bundle.session_id.is_empty() {
        args.push("--resume".to_string());
        args.push(bundle.session_id.clone());
    }
    if let Some(model) = overrides.and_then(|o| o.model.clone()) {
        args.push("--model".to_string());
        args.push(model);
    }
    if bundle.flags.plan_mode {
        args.push("--permission-mode".to_string());
        args.push("plan".to_string());
    } else if bundle.flags.bypass_permissions {
        args.push("--permission-mode".to_string());
        args.push("bypassPermissions".to_string());
    }
    if bundle.orchestrate_hint {
        args.push("--append-system-prompt".to_string());
        args.push(ORCHESTRATE_HINT.to_string());
    }
    args
}

fn codex_args(bundle: &PromptBundle, overrides: Option<&ProviderConfig>) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "--json".to_string()];
    if bundle.resume && !bundle.session_id.is_empty() {
        args.push("resume".to_string());
        args.push(bundle.session_id.clone());
    }
    if !bundle.work_dir.is_empty() {
        args.push("--cd".to_string());
        args.push(bundle.work_dir.clone());
    }
    if let Some(model) = overrides.and_then(|o| o.model.clone()) {
        args.push("--model".to_string());
        args.push(model);
    }
    if bundle.flags.bypass_permissions {
        args.push("--full-auto".to_string());
    }
    args.push(bundle.effective_prompt());
    args
}

fn gemini_args(bundle: &PromptBundle) -> Vec<String> {
    let mut args = vec![
        "--prompt".to_string(),
        bundle.effective_prompt(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ];
    if bundle.resume && !bundle.session_id.is_empty() {
        args.push("--resume".to_string());
        args.push(bundle.session_id.clone());
    }
    if bundle.flags.bypass_permissions {
        args.push("--yolo".to_string());
    }
    args
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
