use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use murmur_crypto::{Envelope, KeyRing, decrypt_message, encrypt_message, message_aad};
use murmur_db::{MessageRow, MessageStore, NewMessage};
use murmur_types::events::GatewayEvent;
use murmur_types::models::{ChatMessage, MessageContent};

use crate::error::GatewayError;
use crate::registry::{ConnectionId, EventSender, PresenceChange, Registry};

/// Committed messages waiting for fan-out, in id order.
type Outbox = Arc<std::sync::Mutex<VecDeque<ChatMessage>>>;

/// Routes messages between connected clients and the message store.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Registry,
    store: MessageStore,
    keys: KeyRing,

    /// Filled by the store's commit hook while the writer is held, so entries
    /// are in id order. Drained only under `delivering`.
    outbox: Outbox,

    /// One drainer at a time, so every connection sees the outbox order.
    /// Never held across store I/O.
    delivering: Mutex<()>,
}

impl Dispatcher {
    pub fn new(store: MessageStore, keys: KeyRing) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry: Registry::new(),
                store,
                keys,
                outbox: Outbox::default(),
                delivering: Mutex::new(()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    /// Register an authenticated connection and queue `Ready` and the user's
    /// full visible history on it ahead of any other event.
    ///
    /// Until the history is queued the connection is registered against a
    /// private buffer. Buffered messages already covered by the history are
    /// dropped, the rest follow it in order. On a storage failure the
    /// connection is removed again and no presence change is announced.
    pub async fn join(
        &self,
        conn_id: ConnectionId,
        username: &str,
        tx: EventSender,
    ) -> Result<(), GatewayError> {
        let (buffer_tx, mut buffer_rx) = mpsc::unbounded_channel();
        let changes = self.inner.registry.join(conn_id, username, buffer_tx).await;

        let rows = match self.inner.store.since(DateTime::<Utc>::UNIX_EPOCH).await {
            Ok(rows) => rows,
            Err(e) => {
                self.inner.registry.leave(conn_id).await;
                warn!(%conn_id, username, error = %e, "History unavailable, join aborted");
                return Err(e.into());
            }
        };

        let replayed_up_to = rows.iter().map(|row| row.id).max().unwrap_or(0);
        let history: Vec<ChatMessage> = rows
            .iter()
            .filter(|row| row.is_visible_to(username))
            .map(|row| self.open_row(row))
            .collect();
        let replayed = history.len();
        let ready = GatewayEvent::Ready {
            username: username.to_string(),
            online_users: self.inner.registry.online_users().await,
        };

        let attached = self
            .inner
            .registry
            .replace_queue(conn_id, tx, |tx| {
                let _ = tx.send(ready);
                let _ = tx.send(GatewayEvent::History { messages: history });
                while let Ok(event) = buffer_rx.try_recv() {
                    let replayed = matches!(
                        &event,
                        GatewayEvent::MessageCreate { message } if message.id <= replayed_up_to
                    );
                    if !replayed {
                        let _ = tx.send(event);
                    }
                }
            })
            .await;
        if !attached {
            debug!(%conn_id, username, "Connection left during replay");
            return Ok(());
        }

        info!(%conn_id, username, replayed, "Connection joined");
        self.announce(changes).await;
        Ok(())
    }

    /// Remove a connection. Nothing is delivered to it afterwards.
    pub async fn leave(&self, conn_id: ConnectionId) {
        let changes = self.inner.registry.leave(conn_id).await;
        self.announce(changes).await;
    }

    /// Encrypt, persist, then fan out a message.
    ///
    /// Broadcasts go to every connection, the sender's own included. Directed
    /// messages go to the recipient's and the sender's connections; an
    /// offline recipient gets it from history on their next join. Nothing is
    /// delivered if the append fails.
    pub async fn send_message(
        &self,
        conn_id: ConnectionId,
        sender: &str,
        content: &str,
        recipient: Option<&str>,
    ) -> Result<ChatMessage, GatewayError> {
        let key = self.inner.keys.user_key(sender)?;
        let aad = message_aad(sender, recipient);
        let envelope = encrypt_message(&key, content.as_bytes(), &aad)?;

        let record = NewMessage {
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            iv: envelope.iv,
            tag: envelope.tag,
            ciphertext: envelope.ciphertext,
        };

        let outbox = self.inner.outbox.clone();
        let text = content.to_string();
        let row = self
            .inner
            .store
            .append_then(record, move |row| {
                outbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(plaintext_message(row, text));
            })
            .await
            .map_err(|e| {
                warn!(%conn_id, sender, error = %e, "Message not stored, dropping");
                e
            })?;

        self.flush().await;
        Ok(plaintext_message(&row, content.to_string()))
    }

    /// Tell every live connection of `username` that `message_count` of their
    /// messages expire at `delete_at`. Returns the number of connections
    /// reached; zero means the warning was dropped.
    pub async fn notify_retention(
        &self,
        username: &str,
        message_count: u64,
        delete_at: DateTime<Utc>,
    ) -> usize {
        let event = GatewayEvent::RetentionWarning {
            message_count,
            delete_at,
        };
        self.inner.registry.send_to_user(username, &event).await
    }

    /// Decrypt a stored record for delivery. Records that fail authentication
    /// keep their place in history with an `Undecryptable` body.
    pub fn open_row(&self, row: &MessageRow) -> ChatMessage {
        let content = match self.decrypt_row(row) {
            Ok(text) => MessageContent::Text { text },
            Err(reason) => {
                warn!(id = row.id, sender = %row.sender, %reason, "Stored message is undecryptable");
                MessageContent::Undecryptable
            }
        };

        ChatMessage {
            id: row.id,
            sender: row.sender.clone(),
            recipient: row.recipient.clone(),
            content,
            timestamp: row.created_at,
        }
    }

    fn decrypt_row(&self, row: &MessageRow) -> Result<String, String> {
        let key = self.inner.keys.user_key(&row.sender).map_err(|e| e.to_string())?;
        let envelope = Envelope {
            iv: row.iv.clone(),
            tag: row.tag.clone(),
            ciphertext: row.ciphertext.clone(),
        };
        let aad = message_aad(&row.sender, row.recipient.as_deref());
        let plaintext = decrypt_message(&key, &envelope, &aad).map_err(|e| e.to_string())?;
        String::from_utf8(plaintext).map_err(|_| "plaintext is not UTF-8".to_string())
    }

    /// Deliver everything in the outbox, oldest first. Also picks up
    /// messages whose sender stopped waiting after the commit.
    async fn flush(&self) {
        let _delivering = self.inner.delivering.lock().await;
        loop {
            let next = self
                .inner
                .outbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(message) = next else {
                break;
            };

            let id = message.id;
            let sender = message.sender.clone();
            let recipient = message.recipient.clone();
            let event = GatewayEvent::MessageCreate { message };
            let delivered = match recipient.as_deref() {
                None => self.inner.registry.send_to_all(&event).await,
                Some(to) => {
                    self.inner
                        .registry
                        .send_to_users(&[to, sender.as_str()], &event)
                        .await
                }
            };
            debug!(id, %sender, ?recipient, delivered, "Message dispatched");
        }
    }

    async fn announce(&self, changes: Vec<PresenceChange>) {
        for change in changes {
            info!(
                username = %change.username,
                online = change.online,
                "Presence changed"
            );
            self.inner
                .registry
                .send_to_all(&GatewayEvent::PresenceUpdate {
                    username: change.username,
                    online: change.online,
                })
                .await;
        }
    }
}

fn plaintext_message(row: &MessageRow, text: String) -> ChatMessage {
    ChatMessage {
        id: row.id,
        sender: row.sender.clone(),
        recipient: row.recipient.clone(),
        content: MessageContent::Text { text },
        timestamp: row.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_db::testing::TempDatabase;
    use uuid::Uuid;

    fn dispatcher() -> (Dispatcher, TempDatabase) {
        let db = TempDatabase::new("dispatch_test").unwrap();
        let store = MessageStore::new(db.db());
        (Dispatcher::new(store, KeyRing::new([3u8; 32])), db)
    }

    fn drop_messages_table(d: &Dispatcher) {
        d.store()
            .database()
            .with_conn_mut(|conn| Ok(conn.execute_batch("DROP TABLE messages")?))
            .unwrap();
    }

    #[tokio::test]
    async fn ciphertext_is_stored_plaintext_is_delivered() {
        let (d, _db) = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        d.join(conn, "alice", tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        d.send_message(conn, "alice", "top secret", None).await.unwrap();

        let rows = d.store().since(DateTime::<Utc>::UNIX_EPOCH).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].ciphertext.windows(10).any(|w| w == b"top secret"));

        match rx.try_recv().unwrap() {
            GatewayEvent::MessageCreate { message } => {
                assert_eq!(message.text(), Some("top secret"));
                assert_eq!(message.id, rows[0].id);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn tampered_row_replays_as_undecryptable() {
        let (d, _db) = dispatcher();
        d.send_message(Uuid::new_v4(), "alice", "hello", None).await.unwrap();

        let mut row = d.store().since(DateTime::<Utc>::UNIX_EPOCH).await.unwrap().remove(0);
        assert_eq!(d.open_row(&row).text(), Some("hello"));

        row.ciphertext[0] ^= 0x01;
        assert_eq!(d.open_row(&row).content, MessageContent::Undecryptable);

        // Re-attributing a row to someone else also fails authentication.
        let mut forged = d.store().since(DateTime::<Utc>::UNIX_EPOCH).await.unwrap().remove(0);
        forged.sender = "mallory".into();
        assert_eq!(d.open_row(&forged).content, MessageContent::Undecryptable);
    }

    #[tokio::test]
    async fn failed_append_is_not_fanned_out() {
        let (d, _db) = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        d.join(conn, "alice", tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        drop_messages_table(&d);
        let err = d.send_message(conn, "alice", "lost", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_history_read_leaves_nothing_registered() {
        let (d, _db) = dispatcher();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        d.join(Uuid::new_v4(), "alice", alice_tx).await.unwrap();
        while alice_rx.try_recv().is_ok() {}

        drop_messages_table(&d);
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(d.join(Uuid::new_v4(), "bob", tx).await.is_err());

        assert!(!d.registry().is_online("bob").await);
        assert_eq!(d.registry().connection_count().await, 1);
        assert!(rx.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn messages_committed_during_replay_follow_history_once() {
        let (d, _db) = dispatcher();
        for i in 0..5 {
            d.send_message(Uuid::new_v4(), "alice", &format!("old {}", i), None)
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = d.clone();
        let writer = tokio::spawn(async move {
            for i in 0..20 {
                sender
                    .send_message(Uuid::new_v4(), "alice", &format!("new {}", i), None)
                    .await
                    .unwrap();
            }
        });
        d.join(Uuid::new_v4(), "bob", tx).await.unwrap();
        writer.await.unwrap();

        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Ready { .. }));
        let mut ids: Vec<i64> = match rx.try_recv().unwrap() {
            GatewayEvent::History { messages } => messages.iter().map(|m| m.id).collect(),
            other => panic!("expected History, got {:?}", other),
        };
        assert!(ids.len() >= 5);
        while let Ok(event) = rx.try_recv() {
            if let GatewayEvent::MessageCreate { message } = event {
                ids.push(message.id);
            }
        }
        assert_eq!(ids.len(), 25);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn committed_message_is_delivered_by_the_next_sender() {
        let (d, _db) = dispatcher();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        d.join(conn, "alice", tx).await.unwrap();
        while rx.try_recv().is_ok() {}

        // A sender that stops waiting after its append commits.
        d.store()
            .append_then(
                NewMessage {
                    sender: "alice".into(),
                    recipient: None,
                    iv: vec![0; 12],
                    tag: vec![0; 16],
                    ciphertext: vec![],
                },
                {
                    let outbox = d.inner.outbox.clone();
                    move |row| {
                        outbox
                            .lock()
                            .unwrap()
                            .push_back(plaintext_message(row, "orphan".into()))
                    }
                },
            )
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        d.send_message(conn, "alice", "next", None).await.unwrap();
        let texts: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                GatewayEvent::MessageCreate { message } => message.text().map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["orphan", "next"]);
    }
}
