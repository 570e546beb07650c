// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Admission control and cancellation plumbing for live executions.
//!
//! The registry is the single owner of live [`ExecutionRecord`]s: at most
//! one non-terminal execution per session, a global cap across sessions,
//! and a background sweeper that aborts anything older than the TTL.  A
//! record leaves the registry on its terminal transition; durable state
//! lives in the session store only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use maestro_config::LimitsConfig;
use maestro_protocol::ErrorKind;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::ExecutionBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Aborting,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Aborted
                | ExecutionStatus::TimedOut
        )
    }
}

struct ExecutionRecord {
    session_id: String,
    started_at: DateTime<Utc>,
    deadline_at: DateTime<Utc>,
    status: ExecutionStatus,
    cancel: CancellationToken,
    /// Swapped per turn; `inject_answer` forwards into the current turn.
    answer_tx: Option<mpsc::Sender<String>>,
    /// Set by the sweeper so the runner can tell a TTL abort from a user
    /// abort when the token trips.
    timed_out: bool,
}

/// What the kernel runner holds while an execution is alive.
pub struct ExecutionHandle {
    pub id: String,
    pub session_id: String,
    pub cancel: CancellationToken,
    pub bus: Arc<ExecutionBus>,
    pub deadline_at: DateTime<Utc>,
}

pub struct ExecutionRegistry {
    records: Mutex<HashMap<String, ExecutionRecord>>,
    buses: Mutex<HashMap<String, Arc<ExecutionBus>>>,
    max_active: usize,
    ttl: Duration,
    sweep_interval: Duration,
    ring_capacity: usize,
    queue_depth: usize,
}

impl ExecutionRegistry {
    pub fn new(limits: &LimitsConfig) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            buses: Mutex::new(HashMap::new()),
            max_active: limits.max_active_executions,
            ttl: Duration::from_secs(limits.execution_ttl_secs),
            sweep_interval: Duration::from_secs(limits.sweep_interval_secs),
            ring_capacity: limits.event_ring_capacity,
            queue_depth: limits.subscriber_queue_depth,
        })
    }

    /// Admit a new execution for `session_id`.
    ///
    /// Refuses with `Busy` when the session already has a live execution
    /// and with `AtCapacity` when the global cap is reached.
    pub async fn open(&self, session_id: &str) -> Result<ExecutionHandle, ErrorKind> {
        let mut records = self.records.lock().await;
        if records.len() >= self.max_active {
            return Err(ErrorKind::AtCapacity(records.len()));
        }
        if records.values().any(|r| r.session_id == session_id) {
            return Err(ErrorKind::Busy(session_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let deadline_at = now
            + chrono::Duration::from_std(self.ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let cancel = CancellationToken::new();
        let bus = ExecutionBus::new(self.ring_capacity, self.queue_depth);

        records.insert(
            id.clone(),
            ExecutionRecord {
                session_id: session_id.to_string(),
                started_at: now,
                deadline_at,
                status: ExecutionStatus::Pending,
                cancel: cancel.clone(),
                answer_tx: None,
                timed_out: false,
            },
        );
        self.buses.lock().await.insert(id.clone(), bus.clone());
        debug!(execution = %id, session = session_id, "execution admitted");

        Ok(ExecutionHandle {
            id,
            session_id: session_id.to_string(),
            cancel,
            bus,
            deadline_at,
        })
    }

    pub async fn mark_running(&self, id: &str) {
        if let Some(r) = self.records.lock().await.get_mut(id) {
            if r.status == ExecutionStatus::Pending {
                r.status = ExecutionStatus::Running;
            }
        }
    }

    /// Request an abort.  Idempotent: the second and later calls are no-ops,
    /// as is aborting an unknown (already closed) execution.
    pub async fn abort(&self, id: &str) {
        let mut records = self.records.lock().await;
        let Some(r) = records.get_mut(id) else {
            debug!(execution = id, "abort for unknown execution ignored");
            return;
        };
        if r.status.is_terminal() || r.status == ExecutionStatus::Aborting {
            return;
        }
        r.status = ExecutionStatus::Aborting;
        r.cancel.cancel();
        info!(execution = id, "execution aborting");
    }

    /// Route a `user_answer` line to the execution's current turn.
    /// Silently ignored when the execution is unknown or has no live turn.
    pub async fn inject_answer(&self, id: &str, line: String) {
        let records = self.records.lock().await;
        if let Some(tx) = records.get(id).and_then(|r| r.answer_tx.as_ref()) {
            if tx.try_send(line).is_err() {
                debug!(execution = id, "answer dropped: turn not accepting input");
            }
        }
    }

    /// Install the answer sender for the execution's current turn.
    pub async fn set_answer_sender(&self, id: &str, tx: mpsc::Sender<String>) {
        if let Some(r) = self.records.lock().await.get_mut(id) {
            r.answer_tx = Some(tx);
        }
    }

    /// True when the sweeper aborted this execution over its TTL.
    pub async fn was_timed_out(&self, id: &str) -> bool {
        self.records
            .lock()
            .await
            .get(id)
            .map(|r| r.timed_out)
            .unwrap_or(false)
    }

    /// Remove the record on terminal transition.  The id is free for reuse
    /// afterwards; the bus stays alive for already-attached subscriptions.
    pub async fn close(&self, id: &str, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        let removed = self.records.lock().await.remove(id);
        self.buses.lock().await.remove(id);
        if let Some(r) = removed {
            debug!(
                execution = id,
                session = %r.session_id,
                ?status,
                age_ms = (Utc::now() - r.started_at).num_milliseconds(),
                "execution closed"
            );
        }
    }

    /// Bus lookup for secondary subscribers joining by request id.
    pub async fn bus(&self, id: &str) -> Option<Arc<ExecutionBus>> {
        self.buses.lock().await.get(id).cloned()
    }

    /// Count of live (non-terminal) executions.
    pub async fn live_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Live execution count for one session (0 or 1 by invariant).
    pub async fn live_for_session(&self, session_id: &str) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.session_id == session_id)
            .count()
    }

    /// Most recent live execution id, used as the `abort` fallback target.
    pub async fn most_recent(&self) -> Option<String> {
        self.records
            .lock()
            .await
            .iter()
            .max_by_key(|(_, r)| r.started_at)
            .map(|(id, _)| id.clone())
    }

    /// Spawn the background sweeper: every `sweep_interval`, abort any
    /// execution whose age exceeds the TTL.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                registry.sweep_once().await;
            }
        })
    }

    /// One sweep pass; exposed for tests.
    pub async fn sweep_once(&self) {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        for (id, r) in records.iter_mut() {
            if !r.status.is_terminal() && now >= r.deadline_at {
                warn!(execution = %id, session = %r.session_id, "execution exceeded TTL");
                r.timed_out = true;
                r.status = ExecutionStatus::Aborting;
                r.cancel.cancel();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
