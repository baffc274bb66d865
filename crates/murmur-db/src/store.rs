//! Async facade over [`Database`] for the message log.
//!
//! Every call runs on the blocking pool via `spawn_blocking`, so async
//! callers never hold their own locks across SQLite I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::Database;
use crate::error::StoreError;
use crate::models::{MessageRow, NewMessage};

#[derive(Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Append a record. The timestamp is taken here, at insertion, never
    /// from the client.
    pub async fn append(&self, message: NewMessage) -> Result<MessageRow, StoreError> {
        self.append_then(message, |_| {}).await
    }

    /// Append, running `on_commit` on the blocking pool while the write is
    /// still exclusive. Hooks of concurrent appends run in id order, and run
    /// even if the awaiting task is dropped.
    pub async fn append_then<F>(&self, message: NewMessage, on_commit: F) -> Result<MessageRow, StoreError>
    where
        F: FnOnce(&MessageRow) + Send + 'static,
    {
        self.blocking(move |db| db.insert_message_then(&message, Utc::now(), on_commit))
            .await
    }

    /// Ascending by timestamp, ties by insertion order. `since(UNIX_EPOCH)`
    /// is the full history.
    pub async fn since(&self, since: DateTime<Utc>) -> Result<Vec<MessageRow>, StoreError> {
        self.blocking(move |db| db.get_messages_since(since)).await
    }

    pub async fn due_for_warning(&self, cutoff: DateTime<Utc>) -> Result<Vec<MessageRow>, StoreError> {
        self.blocking(move |db| db.get_unwarned_before(cutoff)).await
    }

    pub async fn mark_warned(&self, ids: Vec<i64>) -> Result<usize, StoreError> {
        self.blocking(move |db| db.mark_warned(&ids)).await
    }

    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.blocking(move |db| db.delete_messages_before(cutoff))
            .await
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.blocking(|db| db.message_count()).await
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TempDatabase;
    use std::sync::Mutex;

    fn store() -> (MessageStore, TempDatabase) {
        let db = TempDatabase::new("store_test").unwrap();
        (MessageStore::new(db.db()), db)
    }

    fn broadcast(sender: &str, body: &str) -> NewMessage {
        NewMessage {
            sender: sender.into(),
            recipient: None,
            iv: vec![0; 12],
            tag: vec![0; 16],
            ciphertext: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn append_assigns_insertion_time() {
        let (store, _db) = store();
        let before = Utc::now();
        let row = store.append(broadcast("alice", "hi")).await.unwrap();
        let after = Utc::now();

        assert!(row.created_at.timestamp_millis() >= before.timestamp_millis());
        assert!(row.created_at <= after);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_replayed_in_id_order() {
        let (store, _db) = store();
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.append(broadcast("alice", &i.to_string())).await.unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let rows = store.since(DateTime::<Utc>::UNIX_EPOCH).await.unwrap();
        assert_eq!(rows.len(), 20);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id && w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn warn_then_delete_lifecycle() {
        let (store, _db) = store();
        let row = store.append(broadcast("alice", "bye")).await.unwrap();

        let due = store.due_for_warning(row.created_at).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(store.mark_warned(vec![row.id]).await.unwrap(), 1);
        assert!(store.due_for_warning(row.created_at).await.unwrap().is_empty());

        assert_eq!(store.delete_older_than(row.created_at).await.unwrap(), 1);
        assert!(store.since(DateTime::<Utc>::UNIX_EPOCH).await.unwrap().is_empty());
        assert_eq!(store.mark_warned(vec![row.id]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_hooks_run_in_id_order() {
        let (store, _db) = store();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append_then(broadcast("alice", &i.to_string()), move |row| {
                        order.lock().unwrap().push(row.id)
                    })
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order.len(), 20);
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }
}
