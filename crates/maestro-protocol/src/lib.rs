// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between clients and the maestro kernel.
//!
//! Everything here is plain serde JSON: outbound events are [`StreamEvent`]s
//! (one JSON object per event, discriminated by `type`), inbound control
//! messages are [`ControlMessage`]s.  Transports (WebSocket, stdio JSONL)
//! live outside this crate; they only move these objects.

mod control;
mod error;
mod events;

pub use control::{
    AbortParams, ControlMessage, ExecuteParams, ModeFlags, PromptTurn, Provider,
    RegisterSessionParams, UserAnswerParams,
};
pub use error::ErrorKind;
pub use events::{
    AgentLifecycle, ContextStatus, ContextType, ContextWindowEventKind, ContextWindowState,
    ContinuationEventKind, ContinuationState, ContextBreakdown, StopReason, StreamEvent,
    UsageTotals, WindowStatus,
};
