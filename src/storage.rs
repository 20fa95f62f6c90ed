//! Storage engine integration trait.
//!
//! The loader never touches document persistence directly: everything goes
//! through [`StorageEngine`], which models the storage side of replication as
//! per-operation transactions (one call, one transaction, released before any
//! network wait).
//!
//! [`InMemoryStorage`] is a complete in-process implementation used by tests
//! and standalone mode.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One entry of a change vector: causal progress contributed by one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVectorEntry {
    pub db_id: Uuid,
    pub etag: u64,
}

/// Per-origin-database map of etags representing causal progress.
pub type ChangeVector = Vec<ChangeVectorEntry>;

/// A single replicated document change. `data == None` marks a tombstone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub key: String,
    /// Etag assigned by the origin database; batches are ordered by it.
    pub etag: u64,
    pub collection: String,
    pub change_vector: ChangeVector,
    /// Document body, or `None` for a deletion marker.
    pub data: Option<serde_json::Value>,
}

impl DocumentChange {
    /// Whether this change records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }
}

/// What the loader needs from the storage engine.
///
/// Each method is one scoped transaction: implementations must not hold
/// storage locks across the returned future's await points longer than the
/// operation itself requires, and the loader never calls these while blocked
/// on network I/O.
pub trait StorageEngine: Send + Sync + 'static {
    /// Current change vector of the whole database.
    fn database_change_vector(&self) -> BoxFuture<'_, ChangeVector>;

    /// Highest etag assigned locally.
    fn last_etag(&self) -> BoxFuture<'_, u64>;

    /// Highest etag already replicated from the given source database.
    fn last_replicated_etag_from(&self, source_db_id: Uuid) -> BoxFuture<'_, u64>;

    /// Document changes (including tombstones) with etag strictly greater
    /// than `etag`, in increasing etag order, at most `limit` entries.
    fn changes_after(&self, etag: u64, limit: usize) -> BoxFuture<'_, Vec<DocumentChange>>;

    /// Apply a replicated batch through the write path.
    ///
    /// Returns the highest source etag applied, which becomes the new
    /// last-accepted etag reported back to the source. Either the whole batch
    /// applies or the call errors; a partial silent skip is not allowed.
    fn apply_batch(
        &self,
        source_db_id: Uuid,
        changes: Vec<DocumentChange>,
    ) -> BoxFuture<'_, u64>;

    /// Whether more than `limit` tombstones exist past `etag`.
    fn has_tombstones_after(&self, etag: u64, limit: usize) -> BoxFuture<'_, bool>;

    /// Watch channel bumped to the new last etag on every local write.
    /// Outgoing connections use it to wake promptly instead of polling.
    fn subscribe_changes(&self) -> watch::Receiver<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// InMemoryStorage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct StoreInner {
    /// Changes ordered by local etag.
    by_etag: BTreeMap<u64, DocumentChange>,
    /// Current etag per key, for overwrite cleanup.
    by_key: HashMap<String, u64>,
    last_etag: u64,
    /// Highest etag applied per source database.
    replicated_from: HashMap<Uuid, u64>,
    change_vector: HashMap<Uuid, u64>,
}

/// In-process storage engine for tests and standalone mode.
pub struct InMemoryStorage {
    db_id: Uuid,
    inner: Mutex<StoreInner>,
    changes_tx: watch::Sender<u64>,
}

impl InMemoryStorage {
    /// Create an empty store owned by the given database id.
    pub fn new(db_id: Uuid) -> Self {
        let (changes_tx, _) = watch::channel(0);
        Self {
            db_id,
            inner: Mutex::new(StoreInner::default()),
            changes_tx,
        }
    }

    /// The owning database id.
    pub fn db_id(&self) -> Uuid {
        self.db_id
    }

    /// Write a document locally, assigning the next etag.
    pub fn put(&self, key: &str, collection: &str, data: serde_json::Value) -> u64 {
        self.write(key, collection, Some(data))
    }

    /// Delete a document locally, leaving a tombstone.
    pub fn delete(&self, key: &str, collection: &str) -> u64 {
        self.write(key, collection, None)
    }

    fn write(&self, key: &str, collection: &str, data: Option<serde_json::Value>) -> u64 {
        let etag = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.last_etag += 1;
            let etag = inner.last_etag;
            if let Some(old) = inner.by_key.insert(key.to_string(), etag) {
                inner.by_etag.remove(&old);
            }
            let own_etag = etag;
            inner.change_vector.insert(self.db_id, own_etag);
            let change_vector = inner
                .change_vector
                .iter()
                .map(|(db_id, etag)| ChangeVectorEntry {
                    db_id: *db_id,
                    etag: *etag,
                })
                .collect();
            inner.by_etag.insert(
                etag,
                DocumentChange {
                    key: key.to_string(),
                    etag,
                    collection: collection.to_string(),
                    change_vector,
                    data,
                },
            );
            etag
        };
        let _ = self.changes_tx.send(etag);
        etag
    }

    /// Fetch a document body by key. `None` if absent or tombstoned.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let etag = inner.by_key.get(key)?;
        inner.by_etag.get(etag).and_then(|c| c.data.clone())
    }

    /// Number of live (non-tombstone) documents.
    pub fn document_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_etag.values().filter(|c| !c.is_tombstone()).count()
    }
}

impl StorageEngine for InMemoryStorage {
    fn database_change_vector(&self) -> BoxFuture<'_, ChangeVector> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner
                .change_vector
                .iter()
                .map(|(db_id, etag)| ChangeVectorEntry {
                    db_id: *db_id,
                    etag: *etag,
                })
                .collect())
        })
    }

    fn last_etag(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner.last_etag)
        })
    }

    fn last_replicated_etag_from(&self, source_db_id: Uuid) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner.replicated_from.get(&source_db_id).copied().unwrap_or(0))
        })
    }

    fn changes_after(&self, etag: u64, limit: usize) -> BoxFuture<'_, Vec<DocumentChange>> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner
                .by_etag
                .range(etag + 1..)
                .take(limit)
                .map(|(_, change)| change.clone())
                .collect())
        })
    }

    fn apply_batch(
        &self,
        source_db_id: Uuid,
        changes: Vec<DocumentChange>,
    ) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            if source_db_id == self.db_id {
                return Err(ReplicationError::Storage(
                    "batch claims to originate from this database".to_string(),
                ));
            }
            let last_applied = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let mut last_applied =
                    inner.replicated_from.get(&source_db_id).copied().unwrap_or(0);
                for change in changes {
                    last_applied = last_applied.max(change.etag);
                    // Replicated writes get local etags; origin change
                    // vectors merge entry-wise by max.
                    inner.last_etag += 1;
                    let local_etag = inner.last_etag;
                    for entry in &change.change_vector {
                        let current =
                            inner.change_vector.entry(entry.db_id).or_insert(0);
                        *current = (*current).max(entry.etag);
                    }
                    let own_etag = local_etag;
                    inner.change_vector.insert(self.db_id, own_etag);
                    if let Some(old) = inner.by_key.insert(change.key.clone(), local_etag)
                    {
                        inner.by_etag.remove(&old);
                    }
                    inner.by_etag.insert(
                        local_etag,
                        DocumentChange {
                            etag: local_etag,
                            ..change
                        },
                    );
                }
                inner.replicated_from.insert(source_db_id, last_applied);
                last_applied
            };
            let last_etag = {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.last_etag
            };
            let _ = self.changes_tx.send(last_etag);
            Ok(last_applied)
        })
    }

    fn has_tombstones_after(&self, etag: u64, limit: usize) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Ok(inner
                .by_etag
                .range(etag + 1..)
                .filter(|(_, c)| c.is_tombstone())
                .nth(limit)
                .is_some())
        })
    }

    fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_assigns_increasing_etags() {
        let store = InMemoryStorage::new(Uuid::new_v4());
        let e1 = store.put("users/1", "users", json!({"name": "ayende"}));
        let e2 = store.put("users/2", "users", json!({"name": "oren"}));
        assert!(e2 > e1);
        assert_eq!(store.last_etag().await.unwrap(), e2);
    }

    #[tokio::test]
    async fn test_changes_after_ordered_and_limited() {
        let store = InMemoryStorage::new(Uuid::new_v4());
        for i in 0..10 {
            store.put(&format!("users/{i}"), "users", json!({"n": i}));
        }
        let changes = store.changes_after(3, 4).await.unwrap();
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].etag, 4);
        assert!(changes.windows(2).all(|w| w[0].etag < w[1].etag));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry_per_key() {
        let store = InMemoryStorage::new(Uuid::new_v4());
        store.put("users/1", "users", json!({"v": 1}));
        let e2 = store.put("users/1", "users", json!({"v": 2}));
        let changes = store.changes_after(0, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].etag, e2);
        assert_eq!(store.get("users/1"), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let store = InMemoryStorage::new(Uuid::new_v4());
        store.put("users/1", "users", json!({"v": 1}));
        store.delete("users/1", "users");
        assert_eq!(store.get("users/1"), None);

        let changes = store.changes_after(0, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_tombstone());
        assert!(store.has_tombstones_after(0, 0).await.unwrap());
        assert!(!store.has_tombstones_after(0, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_batch_tracks_source_progress() {
        let source_id = Uuid::new_v4();
        let store = InMemoryStorage::new(Uuid::new_v4());
        let changes = vec![
            DocumentChange {
                key: "users/1".to_string(),
                etag: 5,
                collection: "users".to_string(),
                change_vector: vec![ChangeVectorEntry { db_id: source_id, etag: 5 }],
                data: Some(json!({"v": 1})),
            },
            DocumentChange {
                key: "users/2".to_string(),
                etag: 9,
                collection: "users".to_string(),
                change_vector: vec![ChangeVectorEntry { db_id: source_id, etag: 9 }],
                data: Some(json!({"v": 2})),
            },
        ];
        let accepted = store.apply_batch(source_id, changes).await.unwrap();
        assert_eq!(accepted, 9);
        assert_eq!(store.last_replicated_etag_from(source_id).await.unwrap(), 9);
        assert_eq!(store.document_count(), 2);

        // Change vector carries the source's progress
        let cv = store.database_change_vector().await.unwrap();
        let source_entry = cv.iter().find(|e| e.db_id == source_id).unwrap();
        assert_eq!(source_entry.etag, 9);
    }

    #[tokio::test]
    async fn test_apply_batch_rejects_self_origin() {
        let db_id = Uuid::new_v4();
        let store = InMemoryStorage::new(db_id);
        let result = store.apply_batch(db_id, vec![]).await;
        assert!(matches!(result, Err(ReplicationError::Storage(_))));
    }

    #[tokio::test]
    async fn test_subscribe_changes_wakes_on_write() {
        let store = InMemoryStorage::new(Uuid::new_v4());
        let mut rx = store.subscribe_changes();
        assert_eq!(*rx.borrow_and_update(), 0);

        store.put("users/1", "users", json!({}));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}
