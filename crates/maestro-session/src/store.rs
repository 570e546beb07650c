// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use maestro_protocol::{ErrorKind, Provider};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::compact::{compact_messages, CompactionReport};
use crate::types::{Message, PersistedAgent, Session, SessionSummary};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid session data: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for ErrorKind {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ErrorKind::NotFound(id),
            StoreError::Validation(msg) => ErrorKind::Validation(msg),
            StoreError::Io(e) => ErrorKind::Io(e.to_string()),
        }
    }
}

/// Durable session store: one JSON file per session, atomic replacement,
/// per-session write serialization.
pub struct SessionStore {
    dir: PathBuf,
    /// Per-session mutexes.  Reads take the lock too, so a reader never
    /// observes a half-applied read-modify-write.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Open (or create) a store rooted at `<data_dir>/sessions`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        // Session ids are UUID-shaped; anything else is rejected before it
        // can traverse out of the store directory.
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::Validation(format!("invalid session id: {id}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn read_file(&self, path: &Path, id: &str) -> Result<Session, StoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| StoreError::NotFound(id.to_string()))?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Validation(format!("corrupt session {id}: {e}")))
    }

    /// Write-to-temp + fsync + rename, so the file is either the old or the
    /// new session, never a partial write.
    fn write_file(&self, path: &Path, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp.as_file(), json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    // ── Public contract ───────────────────────────────────────────────────────

    /// Create and persist a new, empty session.
    pub async fn create(
        &self,
        name: Option<String>,
        work_dir: Option<String>,
        provider: Option<Provider>,
    ) -> Result<Session, StoreError> {
        let session = Session::new(
            name.unwrap_or_else(|| "untitled".to_string()),
            work_dir.unwrap_or_else(|| ".".to_string()),
            provider.unwrap_or_default(),
        );
        let path = self.path_for(&session.id)?;
        let guard = self.lock_for(&session.id).await;
        let _held = guard.lock().await;
        self.write_file(&path, &session)?;
        debug!(id = %session.id, "session created");
        Ok(session)
    }

    /// Metadata-only listing, most recently updated first.
    pub async fn list(
        &self,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_file(&path, id) {
                Ok(session) => entries.push(session.summary()),
                Err(e) => warn!(id, "skipping unreadable session: {e}"),
            }
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let entries: Vec<SessionSummary> = entries
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entries)
    }

    /// Full session by id.
    pub async fn get(&self, id: &str) -> Result<Session, StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        self.read_file(&path, id)
    }

    /// Durably append one message; returns the new log length.
    pub async fn append_message(&self, id: &str, message: Message) -> Result<usize, StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        let mut session = self.read_file(&path, id)?;
        session.messages.push(message);
        session.updated_at = Utc::now();
        self.write_file(&path, &session)?;
        Ok(session.messages.len())
    }

    /// Upsert an agent record by id.  Status only ever advances; a stale
    /// update that would regress the lifecycle is dropped.
    pub async fn append_agent(&self, id: &str, agent: PersistedAgent) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        let mut session = self.read_file(&path, id)?;
        match session.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => {
                if existing.status == agent.status || existing.status.can_advance_to(agent.status) {
                    *existing = agent;
                } else {
                    warn!(
                        agent = %agent.id,
                        from = ?agent.status,
                        to = ?existing.status,
                        "dropping agent update that would regress status"
                    );
                }
            }
            None => session.agents.push(agent),
        }
        session.updated_at = Utc::now();
        self.write_file(&path, &session)?;
        Ok(())
    }

    /// Patch the session name.
    pub async fn update_name(&self, id: &str, name: &str) -> Result<Session, StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        let mut session = self.read_file(&path, id)?;
        session.name = name.to_string();
        session.updated_at = Utc::now();
        self.write_file(&path, &session)?;
        Ok(session)
    }

    /// Remove a session from the store.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        std::fs::remove_file(&path)?;
        self.locks.lock().await.remove(id);
        Ok(())
    }

    /// JSON dump of one session.
    pub async fn export(&self, id: &str) -> Result<String, StoreError> {
        let session = self.get(id).await?;
        serde_json::to_string_pretty(&session).map_err(|e| StoreError::Validation(e.to_string()))
    }

    /// Import a dump produced by [`export`](Self::export).  The imported
    /// session receives a fresh id and fresh created/updated stamps;
    /// everything else round-trips unchanged.
    pub async fn import(&self, dump: &str) -> Result<Session, StoreError> {
        let mut session: Session =
            serde_json::from_str(dump).map_err(|e| StoreError::Validation(e.to_string()))?;
        session.id = Uuid::new_v4().to_string();
        let now = Utc::now();
        session.created_at = now;
        session.updated_at = now;
        let path = self.path_for(&session.id)?;
        let guard = self.lock_for(&session.id).await;
        let _held = guard.lock().await;
        self.write_file(&path, &session)?;
        Ok(session)
    }

    /// Run the deterministic condenser on a session's history.
    ///
    /// The rewrite happens on a copy and is swapped in with one atomic file
    /// replace, so cancellation between read and write leaves the session in
    /// its pre-compaction state.
    pub async fn compact(
        &self,
        id: &str,
        target_tokens: usize,
        keep_recent: usize,
    ) -> Result<CompactionReport, StoreError> {
        let path = self.path_for(id)?;
        let guard = self.lock_for(id).await;
        let _held = guard.lock().await;
        let mut session = self.read_file(&path, id)?;
        let report = compact_messages(&mut session.messages, target_tokens, keep_recent);
        if report.compacted {
            session.updated_at = Utc::now();
            self.write_file(&path, &session)?;
            debug!(
                id,
                saved = report.tokens_saved(),
                removed = report.messages_removed,
                "session compacted"
            );
        }
        Ok(report)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentStatus, Role};

    async fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    // ── Create / get / list ───────────────────────────────────────────────────

    #[tokio::test]
    async fn create_persists_before_return() {
        let (_dir, store) = store().await;
        let s = store.create(Some("demo".into()), None, None).await.unwrap();
        let loaded = store.get(&s.id).await.unwrap();
        assert_eq!(loaded.name, "demo");
        assert!(loaded.messages.is_empty());
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (_dir, store) = store().await;
        let err = store
            .get("00000000-0000-0000-0000-000000000000")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_id_is_rejected_not_traversed() {
        let (_dir, store) = store().await;
        let err = store.get("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn list_is_metadata_projection_sorted_by_recency() {
        let (_dir, store) = store().await;
        let a = store.create(Some("a".into()), None, None).await.unwrap();
        let b = store.create(Some("b".into()), None, None).await.unwrap();
        // Touch `a` so it becomes the most recent.
        store
            .append_message(&a.id, Message::user("bump"))
            .await
            .unwrap();

        let list = store.list(None, 0).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
        assert_eq!(list[0].message_count, 1);
    }

    #[tokio::test]
    async fn list_paging() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store.create(Some(format!("s{i}")), None, None).await.unwrap();
        }
        let page = store.list(Some(2), 1).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    // ── Append message ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn append_message_bumps_length_and_updated_at() {
        let (_dir, store) = store().await;
        let s = store.create(None, None, None).await.unwrap();
        let len = store
            .append_message(&s.id, Message::user("hello"))
            .await
            .unwrap();
        assert_eq!(len, 1);
        let len = store
            .append_message(&s.id, Message::assistant("hi"))
            .await
            .unwrap();
        assert_eq!(len, 2);

        let loaded = store.get(&s.id).await.unwrap();
        assert!(loaded.updated_at >= loaded.created_at);
        assert_eq!(loaded.messages[0].role, Role::User);
        assert_eq!(loaded.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_durable() {
        let (_dir, store) = store().await;
        let store = std::sync::Arc::new(store);
        let s = store.create(None, None, None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = s.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_message(&id, Message::user(format!("m{i}")))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let loaded = store.get(&s.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 16);
    }

    // ── Agent upsert ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn agent_upsert_advances_status() {
        let (_dir, store) = store().await;
        let s = store.create(None, None, None).await.unwrap();
        let mut agent = PersistedAgent::new("scout", "look");
        store.append_agent(&s.id, agent.clone()).await.unwrap();

        agent.status = AgentStatus::Active;
        store.append_agent(&s.id, agent.clone()).await.unwrap();

        agent.status = AgentStatus::Completed;
        agent.result = Some("found it".into());
        store.append_agent(&s.id, agent.clone()).await.unwrap();

        let loaded = store.get(&s.id).await.unwrap();
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.agents[0].status, AgentStatus::Completed);
        assert_eq!(loaded.agents[0].result.as_deref(), Some("found it"));
    }

    #[tokio::test]
    async fn agent_upsert_never_regresses() {
        let (_dir, store) = store().await;
        let s = store.create(None, None, None).await.unwrap();
        let mut agent = PersistedAgent::new("builder", "build");
        agent.status = AgentStatus::Completed;
        store.append_agent(&s.id, agent.clone()).await.unwrap();

        // A stale transition arrives late.
        agent.status = AgentStatus::Active;
        store.append_agent(&s.id, agent.clone()).await.unwrap();

        let loaded = store.get(&s.id).await.unwrap();
        assert_eq!(loaded.agents[0].status, AgentStatus::Completed);
    }

    // ── Update / delete ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn update_name_persists() {
        let (_dir, store) = store().await;
        let s = store.create(Some("old".into()), None, None).await.unwrap();
        store.update_name(&s.id, "new").await.unwrap();
        assert_eq!(store.get(&s.id).await.unwrap().name, "new");
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let (_dir, store) = store().await;
        let s = store.create(None, None, None).await.unwrap();
        store.delete(&s.id).await.unwrap();
        assert!(matches!(
            store.get(&s.id).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            store.delete(&s.id).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    // ── Export / import ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn export_import_round_trip_modulo_identity() {
        let (_dir, store) = store().await;
        let s = store
            .create(Some("roundtrip".into()), Some("/work".into()), Some(Provider::Codex))
            .await
            .unwrap();
        store
            .append_message(&s.id, Message::user("turn one"))
            .await
            .unwrap();
        let mut agent = PersistedAgent::new("reviewer", "review");
        agent.status = AgentStatus::Completed;
        store.append_agent(&s.id, agent).await.unwrap();

        let dump = store.export(&s.id).await.unwrap();
        let imported = store.import(&dump).await.unwrap();

        assert_ne!(imported.id, s.id);
        let original = store.get(&s.id).await.unwrap();
        assert_eq!(imported.name, original.name);
        assert_eq!(imported.work_dir, original.work_dir);
        assert_eq!(imported.provider, original.provider);
        assert_eq!(imported.messages, original.messages);
        assert_eq!(imported.agents, original.agents);
    }

    #[tokio::test]
    async fn import_rejects_garbage() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.import("not json").await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    // ── Compaction through the store ──────────────────────────────────────────

    #[tokio::test]
    async fn compact_rewrites_and_is_idempotent() {
        let (_dir, store) = store().await;
        let s = store.create(None, None, None).await.unwrap();
        for _ in 0..30 {
            store
                .append_message(&s.id, Message::assistant("y".repeat(400)))
                .await
                .unwrap();
        }
        let report = store.compact(&s.id, 500, 10).await.unwrap();
        assert!(report.compacted);
        assert!(report.tokens_saved() > 0);

        let after_first = store.export(&s.id).await.unwrap();
        let report2 = store.compact(&s.id, 500, 10).await.unwrap();
        assert!(!report2.compacted);
        let after_second = store.export(&s.id).await.unwrap();
        assert_eq!(after_first, after_second);
    }
}
