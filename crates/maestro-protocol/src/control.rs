// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Inbound control messages.
//!
//! # Typical session flow
//!
//! ```text
//! Client                               Kernel
//!    │                                    │
//!    │── register-session {sessionId} ───►│  joins the session broadcast set
//!    │── execute-cli {prompt, …} ────────►│  opens an Execution
//!    │◄─ request_id ──────────────────────│
//!    │◄─ text / tool_use / … × N ─────────│
//!    │── abort {requestId}  (optional) ──►│
//!    │◄─ result ──────────────────────────│
//!    │◄─ done ────────────────────────────│
//! ```

use serde::{Deserialize, Serialize};

/// Which external CLI drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    /// Binary name resolved via PATH when no config override exists.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            "gemini" => Ok(Provider::Gemini),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// The enumerated per-session mode flags.
///
/// `orchestrate` enriches the prompt with memory context before forwarding;
/// `lead_orchestrate` takes the multi-agent path; the two compose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModeFlags {
    pub orchestrate: bool,
    pub lead_orchestrate: bool,
    pub thinking: bool,
    pub plan_mode: bool,
    pub bypass_permissions: bool,
    #[serde(rename = "allowFullPC")]
    pub allow_full_pc: bool,
}

/// One prior turn supplied inline with an `execute-cli` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTurn {
    pub role: String,
    pub content: String,
}

/// Control messages accepted from a client subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Attach this channel to the per-session broadcast set.
    #[serde(rename = "register-session")]
    RegisterSession { data: RegisterSessionParams },

    /// Open an execution.
    #[serde(rename = "execute-cli")]
    ExecuteCli { data: ExecuteParams },

    /// Abort an execution (fallback: the most recent one on this channel).
    #[serde(rename = "abort")]
    Abort {
        #[serde(default)]
        data: AbortParams,
    },

    /// Feed one line to the CLI's stdin while it waits for an answer.
    #[serde(rename = "user_answer")]
    UserAnswer { data: UserAnswerParams },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSessionParams {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteParams {
    pub prompt: String,
    /// Inline history; used when the caller manages its own transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<PromptTurn>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    /// Resume the provider's own conversation state for this session.
    #[serde(default)]
    pub resume: bool,
    /// Pasted images as data URLs (`data:image/png;base64,…`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub orchestrate: bool,
    #[serde(default)]
    pub lead_orchestrate: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub bypass_permissions: bool,
    #[serde(default, rename = "allowFullPC")]
    pub allow_full_pc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
}

impl ExecuteParams {
    /// Collapse the request's individual flags into a [`ModeFlags`] record.
    pub fn mode_flags(&self) -> ModeFlags {
        ModeFlags {
            orchestrate: self.orchestrate,
            lead_orchestrate: self.lead_orchestrate,
            thinking: self.thinking,
            plan_mode: self.plan_mode,
            bypass_permissions: self.bypass_permissions,
            allow_full_pc: self.allow_full_pc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAnswerParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub answer: String,
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_cli_deserializes_wire_form() {
        let json = r#"{
            "type": "execute-cli",
            "data": {
                "prompt": "What is 2+2?",
                "sessionId": "s-1",
                "leadOrchestrate": true,
                "bypassPermissions": true,
                "provider": "codex"
            }
        }"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::ExecuteCli { data } => {
                assert_eq!(data.prompt, "What is 2+2?");
                assert_eq!(data.session_id.as_deref(), Some("s-1"));
                assert!(data.lead_orchestrate);
                assert!(data.bypass_permissions);
                assert!(!data.orchestrate);
                assert_eq!(data.provider, Some(Provider::Codex));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn missing_prompt_is_rejected() {
        let json = r#"{"type": "execute-cli", "data": {"sessionId": "s-1"}}"#;
        assert!(serde_json::from_str::<ControlMessage>(json).is_err());
    }

    #[test]
    fn abort_without_request_id_uses_default() {
        let json = r#"{"type": "abort"}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ControlMessage::Abort {
                data: AbortParams { request_id: None }
            }
        ));
    }

    #[test]
    fn user_answer_requires_answer_field() {
        let ok = r#"{"type": "user_answer", "data": {"requestId": "r1", "answer": "yes"}}"#;
        assert!(serde_json::from_str::<ControlMessage>(ok).is_ok());

        let missing = r#"{"type": "user_answer", "data": {"requestId": "r1"}}"#;
        assert!(serde_json::from_str::<ControlMessage>(missing).is_err());
    }

    #[test]
    fn allow_full_pc_uses_exact_wire_name() {
        let json = r#"{"type":"execute-cli","data":{"prompt":"p","allowFullPC":true}}"#;
        let msg: ControlMessage = serde_json::from_str(json).unwrap();
        match msg {
            ControlMessage::ExecuteCli { data } => assert!(data.allow_full_pc),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn provider_round_trips_lowercase() {
        assert_eq!(serde_json::to_string(&Provider::Gemini).unwrap(), "\"gemini\"");
        assert_eq!("claude".parse::<Provider>().unwrap(), Provider::Claude);
        assert!("gpt".parse::<Provider>().is_err());
    }
}
