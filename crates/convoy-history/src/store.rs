use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use convoy_core::ConversationKey;
use dashmap::DashMap;
use rusqlite::Connection;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{HistoryError, Result};
use crate::types::HistoryMessage;

/// Durable medium behind the history cache. Calls are blocking; the store
/// always invokes them from `spawn_blocking`.
pub trait SnapshotStore: Send + Sync + 'static {
    fn load(&self, key: &ConversationKey) -> Result<Option<Vec<HistoryMessage>>>;
    fn save(&self, key: &ConversationKey, messages: &[HistoryMessage]) -> Result<()>;
    fn delete(&self, key: &ConversationKey) -> Result<()>;
}

/// SQLite-backed snapshots: one JSON row per conversation.
pub struct SqliteSnapshotStore {
    db: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Wrap a connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn load(&self, key: &ConversationKey) -> Result<Option<Vec<HistoryMessage>>> {
        let db = self.db.lock().unwrap();
        let raw: Option<String> = match db.query_row(
            "SELECT messages FROM conversation_history
             WHERE project_id = ?1 AND conversation_id = ?2",
            rusqlite::params![key.project_id, key.conversation_id],
            |row| row.get(0),
        ) {
            Ok(s) => Some(s),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(HistoryError::Database(e)),
        };
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save(&self, key: &ConversationKey, messages: &[HistoryMessage]) -> Result<()> {
        let json = serde_json::to_string(messages)?;
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversation_history
             (project_id, conversation_id, messages, message_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(project_id, conversation_id) DO UPDATE SET
                messages      = excluded.messages,
                message_count = excluded.message_count,
                updated_at    = excluded.updated_at",
            rusqlite::params![
                key.project_id,
                key.conversation_id,
                json,
                messages.len() as i64,
                now
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &ConversationKey) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM conversation_history WHERE project_id = ?1 AND conversation_id = ?2",
            rusqlite::params![key.project_id, key.conversation_id],
        )?;
        Ok(())
    }
}

/// Receives messages appended to a conversation outside the main
/// generation flow (tool calls and results produced by the engine).
#[async_trait]
pub trait HistoryObserver: Send + Sync {
    async fn message_appended(&self, key: &ConversationKey, message: HistoryMessage);
}

enum WriteOp {
    Save(Vec<HistoryMessage>),
    Delete,
}

/// Two-tier conversation history.
///
/// The cache answers every read once warm. Durable writes are fire-and-forget:
/// a failure is logged and never rolls back the in-memory copy. Writes for one
/// conversation are chained so the medium always ends on the latest snapshot.
pub struct HistoryStore {
    /// Never evicted: every conversation touched stays resident for the life
    /// of the process, trading memory for a store that never has to reconcile
    /// a reload with an in-flight write. Only `delete` drops an entry.
    cache: DashMap<ConversationKey, Vec<HistoryMessage>>,
    durable: Arc<dyn SnapshotStore>,
    /// Tail of the write chain per conversation.
    pending: Mutex<HashMap<ConversationKey, JoinHandle<()>>>,
}

impl HistoryStore {
    pub fn new(durable: Arc<dyn SnapshotStore>) -> Self {
        Self {
            cache: DashMap::new(),
            durable,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ordered messages for a conversation. Loads from the durable medium on
    /// a cold cache and populates the cache.
    #[instrument(skip(self), fields(conversation = %key))]
    pub async fn get(&self, key: &ConversationKey) -> Result<Vec<HistoryMessage>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }

        // A write may be in flight for a key that was evicted by `delete`;
        // wait for it so the load does not observe a stale row.
        self.flush(key).await;

        let durable = Arc::clone(&self.durable);
        let load_key = key.clone();
        let loaded = tokio::task::spawn_blocking(move || durable.load(&load_key))
            .await
            .map_err(|e| HistoryError::Task(e.to_string()))??
            .unwrap_or_default();
        debug!(messages = loaded.len(), "history cache miss, loaded from disk");

        // A concurrent `set` during the load wins over the disk copy.
        let entry = self.cache.entry(key.clone()).or_insert(loaded);
        Ok(entry.clone())
    }

    /// Replace the cached history and schedule a durable write.
    pub fn set(&self, key: &ConversationKey, messages: Vec<HistoryMessage>) {
        self.cache.insert(key.clone(), messages.clone());
        self.schedule(key, WriteOp::Save(messages));
    }

    /// Append one message (warming the cache first if needed).
    pub async fn append(&self, key: &ConversationKey, message: HistoryMessage) -> Result<()> {
        self.get(key).await?;
        let snapshot = {
            let mut entry = self.cache.entry(key.clone()).or_default();
            entry.push(message);
            entry.clone()
        };
        self.schedule(key, WriteOp::Save(snapshot));
        Ok(())
    }

    /// Edit a warm conversation in place. `f` runs under the cache lock and
    /// returns whether it changed anything; only then is a write scheduled.
    /// Returns false when the conversation is not cached or `f` declined.
    pub fn modify(
        &self,
        key: &ConversationKey,
        f: impl FnOnce(&mut Vec<HistoryMessage>) -> bool,
    ) -> bool {
        let snapshot = {
            let Some(mut entry) = self.cache.get_mut(key) else {
                return false;
            };
            if !f(&mut entry) {
                return false;
            }
            entry.clone()
        };
        self.schedule(key, WriteOp::Save(snapshot));
        true
    }

    /// Drop all messages, optionally keeping a leading system message.
    pub async fn clear(&self, key: &ConversationKey, keep_system_message: bool) -> Result<()> {
        let current = self.get(key).await?;
        let kept: Vec<HistoryMessage> = if keep_system_message {
            current.into_iter().filter(|m| m.is_system()).take(1).collect()
        } else {
            Vec::new()
        };
        self.set(key, kept);
        Ok(())
    }

    /// Forget a conversation entirely, in memory and on disk.
    pub fn delete(&self, key: &ConversationKey) {
        self.cache.remove(key);
        self.schedule(key, WriteOp::Delete);
    }

    /// Number of conversations currently held in memory.
    pub fn cached_conversations(&self) -> usize {
        self.cache.len()
    }

    /// Wait until every write scheduled so far for `key` has reached the medium.
    pub async fn flush(&self, key: &ConversationKey) {
        let tail = self.pending.lock().unwrap().remove(key);
        if let Some(handle) = tail {
            let _ = handle.await;
        }
    }

    /// Wait for all pending writes (graceful shutdown).
    pub async fn flush_all(&self) {
        let tails: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in tails {
            let _ = handle.await;
        }
    }

    fn schedule(&self, key: &ConversationKey, op: WriteOp) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|_, handle| !handle.is_finished());

        let previous = pending.remove(key);
        let durable = Arc::clone(&self.durable);
        let write_key = key.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let log_key = write_key.clone();
            let result = tokio::task::spawn_blocking(move || match op {
                WriteOp::Save(messages) => durable.save(&write_key, &messages),
                WriteOp::Delete => durable.delete(&write_key),
            })
            .await;
            match result {
                Ok(Ok(())) => debug!(conversation = %log_key, "history snapshot written"),
                Ok(Err(e)) => {
                    warn!(conversation = %log_key, error = %e, "history snapshot write failed")
                }
                Err(e) => {
                    warn!(conversation = %log_key, error = %e, "history snapshot task failed")
                }
            }
        });
        pending.insert(key.clone(), handle);
    }
}

#[async_trait]
impl HistoryObserver for HistoryStore {
    async fn message_appended(&self, key: &ConversationKey, message: HistoryMessage) {
        if let Err(e) = self.append(key, message).await {
            warn!(conversation = %key, error = %e, "failed to record appended message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sqlite_store() -> Arc<SqliteSnapshotStore> {
        Arc::new(SqliteSnapshotStore::new(Connection::open_in_memory().unwrap()).unwrap())
    }

    fn key() -> ConversationKey {
        ConversationKey::new("p1", "c1")
    }

    /// Medium that rejects every write and counts attempts.
    struct FailingStore {
        saves: AtomicUsize,
    }

    impl SnapshotStore for FailingStore {
        fn load(&self, _key: &ConversationKey) -> Result<Option<Vec<HistoryMessage>>> {
            Ok(None)
        }
        fn save(&self, _key: &ConversationKey, _messages: &[HistoryMessage]) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(HistoryError::Task("disk full".into()))
        }
        fn delete(&self, _key: &ConversationKey) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn set_then_flush_persists_snapshot() {
        let durable = sqlite_store();
        let store = HistoryStore::new(durable.clone());
        store.set(&key(), vec![HistoryMessage::user("hi"), HistoryMessage::assistant("yo")]);
        store.flush(&key()).await;

        let on_disk = durable.load(&key()).unwrap().unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk[0].content, "hi");
    }

    #[tokio::test]
    async fn cold_get_loads_from_disk() {
        let durable = sqlite_store();
        durable
            .save(&key(), &[HistoryMessage::system("sys"), HistoryMessage::user("q")])
            .unwrap();

        let store = HistoryStore::new(durable);
        assert_eq!(store.cached_conversations(), 0);
        let msgs = store.get(&key()).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(store.cached_conversations(), 1);
    }

    #[tokio::test]
    async fn writes_land_in_order() {
        let durable = sqlite_store();
        let store = HistoryStore::new(durable.clone());
        for i in 0..20 {
            store
                .append(&key(), HistoryMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        store.flush_all().await;
        let on_disk = durable.load(&key()).unwrap().unwrap();
        assert_eq!(on_disk.len(), 20);
        assert_eq!(on_disk.last().unwrap().content, "m19");
    }

    #[tokio::test]
    async fn clear_keeps_only_system_message() {
        let store = HistoryStore::new(sqlite_store());
        store.set(
            &key(),
            vec![
                HistoryMessage::system("sys"),
                HistoryMessage::user("a"),
                HistoryMessage::assistant("b"),
            ],
        );
        store.clear(&key(), true).await.unwrap();
        let msgs = store.get(&key()).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::System);

        store.clear(&key(), false).await.unwrap();
        assert!(store.get(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_disk_row() {
        let durable = sqlite_store();
        let store = HistoryStore::new(durable.clone());
        store.set(&key(), vec![HistoryMessage::user("a")]);
        store.delete(&key());
        store.flush(&key()).await;
        assert!(durable.load(&key()).unwrap().is_none());
        assert!(store.get(&key()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_authoritative() {
        let failing = Arc::new(FailingStore {
            saves: AtomicUsize::new(0),
        });
        let store = HistoryStore::new(failing.clone());
        store.append(&key(), HistoryMessage::user("kept")).await.unwrap();
        store.flush(&key()).await;

        assert_eq!(failing.saves.load(Ordering::SeqCst), 1);
        let msgs = store.get(&key()).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "kept");
    }

    #[tokio::test]
    async fn modify_only_touches_warm_conversations() {
        let durable = sqlite_store();
        let store = HistoryStore::new(durable.clone());
        assert!(!store.modify(&key(), |_| true));

        store.set(&key(), vec![HistoryMessage::user("a")]);
        assert!(!store.modify(&key(), |msgs| msgs.len() > 1));
        assert!(store.modify(&key(), |msgs| {
            msgs.push(HistoryMessage::user("b"));
            true
        }));
        store.flush(&key()).await;
        assert_eq!(durable.load(&key()).unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn observer_appends() {
        let store = HistoryStore::new(sqlite_store());
        store
            .message_appended(&key(), HistoryMessage::tool_result("call-1", "todo_write", "ok"))
            .await;
        let msgs = store.get(&key()).await.unwrap();
        assert_eq!(msgs[0].role, Role::Tool);
        assert_eq!(msgs[0].tool_call_id.as_deref(), Some("call-1"));
    }
}
