// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session & execution kernel.
//!
//! ```text
//!   client channel ──► ControlService ──► ExecutionKernel
//!                                             │
//!                        ExecutionRegistry ◄──┤ admission, abort, TTL sweep
//!                        ExecutionBus      ◄──┤ fan-out to subscribers
//!                        TurnDriver        ◄──┤ one CLI process per turn
//!                        SessionStore      ◄──┤ durable turns & agents
//!                        ContextMonitor    ◄──┤ token thresholds, compaction
//!                        Continuation      ◄──┘ truncated-reply auto-continue
//! ```
//!
//! One long-lived task exists per live execution (the kernel runner), per
//! subscriber (the fan-out writer), plus the registry sweeper; everything
//! else is per-turn.

mod bus;
mod continuation;
mod kernel;
mod memory;
mod monitor;
mod registry;
mod service;

pub use bus::{ExecutionBus, SessionChannels, Subscription};
pub use continuation::{ContinuationController, ContinuationDecision};
pub use kernel::{ExecutionKernel, ExecutionStarted, KernelBuilder};
pub use memory::{MemoryHit, MemoryInjection, MemoryService, NullMemory};
pub use monitor::ContextWindowMonitor;
pub use registry::{ExecutionHandle, ExecutionRegistry, ExecutionStatus};
pub use service::ClientConnection;
