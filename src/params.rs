//! External parameter store. System coordination state lives here, apart
//! from user data, so the two have independent lifecycles and access
//! policies. The orchestrator's idempotency lock is a single named
//! parameter holding the timestamp of the run that took it.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

/// Well-known name of the orchestrator's nightly lock.
pub const ORCHESTRATOR_LOCK: &str = "/commute/orchestrator/nightly-lock";

pub struct ParamStore {
    conn: Mutex<Connection>,
}

impl ParamStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS parameters (
                name  TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM parameters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put_param(&self, name: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO parameters (name, value) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET value = ?2",
            params![name, value],
        )?;
        Ok(())
    }

    pub fn delete_param(&self, name: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute("DELETE FROM parameters WHERE name = ?1", params![name])?;
        Ok(count > 0)
    }

    /// Take the nightly lock. A holder younger than `staleness` means a
    /// duplicate invocation and the caller must abort; an older holder is a
    /// crashed run and is overwritten.
    pub fn acquire_nightly_lock(
        &self,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> anyhow::Result<bool> {
        if let Some(raw) = self.get_param(ORCHESTRATOR_LOCK)? {
            match raw.parse::<DateTime<Utc>>() {
                Ok(held_at) if now - held_at < staleness => {
                    tracing::info!(
                        "orchestrator lock held since {held_at}, aborting duplicate invocation"
                    );
                    return Ok(false);
                }
                Ok(held_at) => {
                    tracing::warn!("orchestrator lock from {held_at} is stale, overwriting");
                }
                Err(_) => {
                    tracing::warn!("orchestrator lock value {raw:?} unparseable, overwriting");
                }
            }
        }
        self.put_param(ORCHESTRATOR_LOCK, &now.to_rfc3339())?;
        Ok(true)
    }

    /// Release is idempotent; a missing lock is covered by staleness anyway.
    pub fn release_nightly_lock(&self) -> anyhow::Result<()> {
        if !self.delete_param(ORCHESTRATOR_LOCK)? {
            tracing::warn!("orchestrator lock already absent on release");
        }
        Ok(())
    }
}
