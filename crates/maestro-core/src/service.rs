// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `ClientConnection` — one client's control channel into the kernel.
//!
//! ```text
//!   transport (WS / stdio) ──► ControlMessage ──► ClientConnection
//!                                                       │
//!                                 ExecutionKernel  ◄────┤ execute / abort / answer
//!                                                       │
//!   transport ◄── mpsc::Sender<StreamEvent> ◄───────────┘ pump tasks
//! ```
//!
//! The transport itself (WebSocket framing, HTTP upgrade, auth) lives
//! outside the core; it only needs to decode [`ControlMessage`]s and write
//! the [`StreamEvent`]s this connection pushes into its outbound sender.

use std::sync::Arc;

use maestro_protocol::{ControlMessage, ErrorKind, StreamEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::kernel::ExecutionKernel;

pub struct ClientConnection {
    kernel: Arc<ExecutionKernel>,
    out_tx: mpsc::Sender<StreamEvent>,
    /// Fallback target for `abort` without a request id.
    last_execution: Option<String>,
}

impl ClientConnection {
    pub fn new(kernel: Arc<ExecutionKernel>, out_tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            kernel,
            out_tx,
            last_execution: None,
        }
    }

    /// Handle one inbound control message.
    pub async fn handle(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::RegisterSession { data } => {
                self.register_session(&data.session_id);
            }
            ControlMessage::ExecuteCli { data } => {
                match self.kernel.clone().execute(data).await {
                    Ok(mut started) => {
                        self.last_execution = Some(started.execution_id.clone());
                        let out = self.out_tx.clone();
                        // Pump this execution's events to the client until
                        // the terminal event (or the client goes away).
                        tokio::spawn(async move {
                            while let Some(ev) = started.subscription.next().await {
                                let terminal = ev.is_terminal();
                                if out.send(ev).await.is_err() || terminal {
                                    break;
                                }
                            }
                        });
                    }
                    Err(kind) => self.reject(kind).await,
                }
            }
            ControlMessage::Abort { data } => {
                let target = data.request_id.or_else(|| self.last_execution.clone());
                match target {
                    Some(id) => self.kernel.abort(&id).await,
                    None => {
                        debug!("abort with no target and no prior execution; ignoring");
                    }
                }
            }
            ControlMessage::UserAnswer { data } => {
                let target = data.request_id.or_else(|| self.last_execution.clone());
                if let Some(id) = target {
                    self.kernel.registry().inject_answer(&id, data.answer).await;
                } else {
                    warn!("user_answer with no target execution; dropped");
                }
            }
        }
    }

    /// Join the per-session broadcast set: agent traffic from any execution
    /// on the session flows to this client.
    fn register_session(&self, session_id: &str) {
        let mut rx = self.kernel.session_channels().subscribe(session_id);
        let out = self.out_tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        if out.send(ev).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(session = %session_id, skipped = n, "session subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Admission failures surface as an error + done pair on this channel.
    async fn reject(&self, kind: ErrorKind) {
        let _ = self
            .out_tx
            .send(StreamEvent::Error {
                data: kind.to_string(),
            })
            .await;
        let _ = self
            .out_tx
            .send(StreamEvent::Done {
                data: String::new(),
                aborted: false,
            })
            .await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
