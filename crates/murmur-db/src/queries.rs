use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::Database;
use crate::error::StoreError;
use crate::models::{MessageRow, NewMessage, UserRow};

const MESSAGE_COLUMNS: &str =
    "id, sender, recipient, iv, tag, ciphertext, created_at, warned";

impl Database {
    // -- Users --

    /// Insert a user. Returns `false` if the username is already taken.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<bool, StoreError> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (username, password) VALUES (?1, ?2)",
                (username, password_hash),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    // -- Messages --

    /// Append a message stamped with `now`, or with the newest stored
    /// timestamp if the clock has gone backwards, so id order and timestamp
    /// order never disagree.
    pub fn insert_message(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<MessageRow, StoreError> {
        self.insert_message_then(message, now, |_| {})
    }

    /// [`insert_message`](Self::insert_message), calling `on_commit` with the
    /// stored row before the writer is released. Hooks therefore run in id
    /// order. Not called if the insert fails.
    pub fn insert_message_then<F>(
        &self,
        message: &NewMessage,
        now: DateTime<Utc>,
        on_commit: F,
    ) -> Result<MessageRow, StoreError>
    where
        F: FnOnce(&MessageRow),
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let newest: Option<i64> =
                tx.query_row("SELECT MAX(created_at) FROM messages", [], |row| row.get(0))?;
            let created_ms = newest.map_or(now.timestamp_millis(), |n| n.max(now.timestamp_millis()));

            tx.execute(
                "INSERT INTO messages (sender, recipient, iv, tag, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    message.sender,
                    message.recipient,
                    message.iv,
                    message.tag,
                    message.ciphertext,
                    created_ms
                ],
            )?;
            let id = tx.last_insert_rowid();
            let created_at = millis_to_datetime(id, created_ms)?;
            tx.commit()?;

            let row = MessageRow {
                id,
                sender: message.sender.clone(),
                recipient: message.recipient.clone(),
                iv: message.iv.clone(),
                tag: message.tag.clone(),
                ciphertext: message.ciphertext.clone(),
                created_at,
                warned: false,
            };
            on_commit(&row);
            Ok(row)
        })
    }

    /// Messages created at or after `since`, oldest first. Ties on the
    /// timestamp fall back to insertion order.
    pub fn get_messages_since(&self, since: DateTime<Utc>) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE created_at >= ?1
                     ORDER BY created_at ASC, id ASC"
                ),
                since.timestamp_millis(),
            )
        })
    }

    /// Unwarned messages created at or before `cutoff`.
    pub fn get_unwarned_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<MessageRow>, StoreError> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE warned = 0 AND created_at <= ?1
                     ORDER BY created_at ASC, id ASC"
                ),
                cutoff.timestamp_millis(),
            )
        })
    }

    /// Flip `warned` on the given ids. Only rows that were not yet warned are
    /// counted, so repeating the call reports zero.
    pub fn mark_warned(&self, ids: &[i64]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut updated = 0;
            {
                let mut stmt =
                    tx.prepare("UPDATE messages SET warned = 1 WHERE id = ?1 AND warned = 0")?;
                for id in ids {
                    updated += stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    /// Permanently delete messages created at or before `cutoff`.
    pub fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn_mut(|conn| {
            let deleted = conn.execute(
                "DELETE FROM messages WHERE created_at <= ?1",
                [cutoff.timestamp_millis()],
            )?;
            Ok(deleted)
        })
    }

    pub fn message_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                username: row.get(0)?,
                password: row.get(1)?,
                created_at: row.get(2)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(conn: &Connection, sql: &str, millis: i64) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([millis], read_message)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    let created_ms: i64 = row.get(6)?;
    let created_at = DateTime::from_timestamp_millis(created_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(6, created_ms))?;

    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        iv: row.get(3)?,
        tag: row.get(4)?,
        ciphertext: row.get(5)?,
        created_at,
        warned: row.get::<_, i64>(7)? != 0,
    })
}

fn millis_to_datetime(id: i64, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("created_at {} out of range", millis),
    })
}
