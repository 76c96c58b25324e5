//! Durable worker queue: visibility-timeout receives, per-entry batch send
//! failures, and dead-lettering past a configured receive count. Operators
//! drain the dead-letter table manually.

use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

/// Max entries per publish batch.
pub const SEND_BATCH_LIMIT: usize = 10;

pub struct JobQueue {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub body: String,
    pub chunk_index: i64,
    pub chunk_size: i64,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: String,
    pub chunk_index: i64,
    pub chunk_size: i64,
    pub receive_count: i64,
}

impl JobQueue {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.run_migrations()?;
        Ok(queue)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let queue = Self {
            conn: Mutex::new(conn),
        };
        queue.run_migrations()?;
        Ok(queue)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id            TEXT PRIMARY KEY,
                body          TEXT NOT NULL,
                chunk_index   INTEGER NOT NULL,
                chunk_size    INTEGER NOT NULL,
                enqueued_at   INTEGER NOT NULL,
                visible_at    INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_visible ON messages(visible_at, enqueued_at);

            CREATE TABLE IF NOT EXISTS dead_letters (
                id            TEXT PRIMARY KEY,
                body          TEXT NOT NULL,
                chunk_index   INTEGER NOT NULL,
                chunk_size    INTEGER NOT NULL,
                enqueued_at   INTEGER NOT NULL,
                dead_at       INTEGER NOT NULL,
                receive_count INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Publish up to [`SEND_BATCH_LIMIT`] entries. Returns the ids that
    /// failed; the caller owns retrying those.
    pub fn send_batch(
        &self,
        entries: &[QueueEntry],
        now_epoch: i64,
    ) -> anyhow::Result<Vec<String>> {
        anyhow::ensure!(
            entries.len() <= SEND_BATCH_LIMIT,
            "send batch of {} exceeds the limit of {SEND_BATCH_LIMIT}",
            entries.len()
        );
        let conn = self.conn.lock().unwrap();
        let mut failed = Vec::new();
        for entry in entries {
            let outcome = conn.execute(
                "INSERT INTO messages (id, body, chunk_index, chunk_size, enqueued_at, visible_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![entry.id, entry.body, entry.chunk_index, entry.chunk_size, now_epoch],
            );
            if let Err(e) = outcome {
                tracing::warn!("queue publish failed for message {}: {e}", entry.id);
                failed.push(entry.id.clone());
            }
        }
        Ok(failed)
    }

    /// Receive at most one visible message, extending its invisibility by
    /// `visibility_secs`. A message already received `max_receive_count`
    /// times moves to the dead-letter table instead of being handed out.
    pub fn receive(
        &self,
        visibility_secs: i64,
        max_receive_count: i64,
        now_epoch: i64,
    ) -> anyhow::Result<Option<ReceivedMessage>> {
        let conn = self.conn.lock().unwrap();
        loop {
            let candidate = conn
                .query_row(
                    "SELECT id, body, chunk_index, chunk_size, enqueued_at, receive_count \
                     FROM messages WHERE visible_at <= ?1 \
                     ORDER BY enqueued_at, id LIMIT 1",
                    params![now_epoch],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, body, chunk_index, chunk_size, enqueued_at, receive_count)) = candidate
            else {
                return Ok(None);
            };

            if receive_count >= max_receive_count {
                conn.execute(
                    "INSERT OR REPLACE INTO dead_letters \
                     (id, body, chunk_index, chunk_size, enqueued_at, dead_at, receive_count) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, body, chunk_index, chunk_size, enqueued_at, now_epoch, receive_count],
                )?;
                conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                tracing::warn!(
                    "message {id} dead-lettered after {receive_count} receives (chunk {chunk_index})"
                );
                continue;
            }

            conn.execute(
                "UPDATE messages SET receive_count = receive_count + 1, visible_at = ?2 \
                 WHERE id = ?1",
                params![id, now_epoch + visibility_secs],
            )?;
            return Ok(Some(ReceivedMessage {
                id,
                body,
                chunk_index,
                chunk_size,
                receive_count: receive_count + 1,
            }));
        }
    }

    /// Acknowledge successful processing.
    pub fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    pub fn depth(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }

    pub fn dead_letter_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?)
    }
}
