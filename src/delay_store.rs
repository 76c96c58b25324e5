//! Per-city, per-day delay data written by the nightly scrapers and read by
//! the forecast worker. Rows carry a TTL epoch: readers ignore expired rows
//! and writers purge them opportunistically, standing in for the store's
//! native expiry.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::batch::{BatchGetPage, BatchTable, WriteOp};
use crate::models::delay::{EventDay, EventRecord, HourlyPrecip, WeatherDay};

pub struct DelayStore {
    conn: Mutex<Connection>,
}

/// `(city_key, date)`: the composite key for both record types.
pub type DayKey = (String, String);

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl DelayStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations().unwrap();
        store
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS weather_days (
                city_key   TEXT NOT NULL,
                date       TEXT NOT NULL,
                hourly     TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                ttl        INTEGER NOT NULL,
                PRIMARY KEY (city_key, date)
            );

            CREATE TABLE IF NOT EXISTS event_days (
                city_key   TEXT NOT NULL,
                date       TEXT NOT NULL,
                events     TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                ttl        INTEGER NOT NULL,
                PRIMARY KEY (city_key, date)
            );
            ",
        )?;
        Ok(())
    }

    // ── Weather records ──

    pub fn put_weather_day(&self, day: &WeatherDay) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO weather_days (city_key, date, hourly, fetched_at, ttl) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(city_key, date) DO UPDATE SET \
               hourly = excluded.hourly, fetched_at = excluded.fetched_at, ttl = excluded.ttl",
            params![
                day.city_key,
                day.date,
                serde_json::to_string(&day.hourly).unwrap(),
                day.fetched_at,
                day.ttl,
            ],
        )?;
        Ok(())
    }

    pub fn get_weather_day(
        &self,
        city_key: &str,
        date: &str,
        now_epoch: i64,
    ) -> anyhow::Result<Option<WeatherDay>> {
        let conn = self.conn.lock().unwrap();
        let day = conn
            .query_row(
                "SELECT city_key, date, hourly, fetched_at, ttl FROM weather_days \
                 WHERE city_key = ?1 AND date = ?2 AND ttl > ?3",
                params![city_key, date, now_epoch],
                |row| {
                    Ok(WeatherDay {
                        city_key: row.get(0)?,
                        date: row.get(1)?,
                        hourly: json_col::<Vec<HourlyPrecip>>(2, row.get::<_, String>(2)?)?,
                        fetched_at: row.get(3)?,
                        ttl: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(day)
    }

    // ── Event records ──

    pub fn put_event_day(&self, day: &EventDay) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_days (city_key, date, events, fetched_at, ttl) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(city_key, date) DO UPDATE SET \
               events = excluded.events, fetched_at = excluded.fetched_at, ttl = excluded.ttl",
            params![
                day.city_key,
                day.date,
                serde_json::to_string(&day.events).unwrap(),
                day.fetched_at,
                day.ttl,
            ],
        )?;
        Ok(())
    }

    pub fn get_event_day(
        &self,
        city_key: &str,
        date: &str,
        now_epoch: i64,
    ) -> anyhow::Result<Option<EventDay>> {
        let conn = self.conn.lock().unwrap();
        let day = conn
            .query_row(
                "SELECT city_key, date, events, fetched_at, ttl FROM event_days \
                 WHERE city_key = ?1 AND date = ?2 AND ttl > ?3",
                params![city_key, date, now_epoch],
                |row| {
                    Ok(EventDay {
                        city_key: row.get(0)?,
                        date: row.get(1)?,
                        events: json_col::<Vec<EventRecord>>(2, row.get::<_, String>(2)?)?,
                        fetched_at: row.get(3)?,
                        ttl: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(day)
    }

    /// Drop rows whose TTL has passed. Called from the scraper write paths.
    pub fn purge_expired(&self, now_epoch: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let weather = conn.execute("DELETE FROM weather_days WHERE ttl <= ?1", params![now_epoch])?;
        let events = conn.execute("DELETE FROM event_days WHERE ttl <= ?1", params![now_epoch])?;
        Ok(weather + events)
    }
}

// ── Batch views ──

pub struct WeatherBatchView<'a> {
    pub store: &'a DelayStore,
    pub now_epoch: i64,
}

#[async_trait]
impl BatchTable for WeatherBatchView<'_> {
    type Key = DayKey;
    type Record = WeatherDay;

    async fn batch_get_page(
        &self,
        keys: &[DayKey],
    ) -> anyhow::Result<BatchGetPage<DayKey, WeatherDay>> {
        let mut found = Vec::with_capacity(keys.len());
        for (city_key, date) in keys {
            if let Some(day) = self.store.get_weather_day(city_key, date, self.now_epoch)? {
                found.push(((city_key.clone(), date.clone()), day));
            }
        }
        Ok(BatchGetPage {
            found,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_write_page(
        &self,
        ops: Vec<WriteOp<DayKey, WeatherDay>>,
    ) -> anyhow::Result<Vec<WriteOp<DayKey, WeatherDay>>> {
        for op in ops {
            match op {
                WriteOp::Put(_, day) => self.store.put_weather_day(&day)?,
                WriteOp::Delete((city_key, date)) => {
                    let conn = self.store.conn.lock().unwrap();
                    conn.execute(
                        "DELETE FROM weather_days WHERE city_key = ?1 AND date = ?2",
                        params![city_key, date],
                    )?;
                }
            }
        }
        Ok(Vec::new())
    }
}

pub struct EventBatchView<'a> {
    pub store: &'a DelayStore,
    pub now_epoch: i64,
}

#[async_trait]
impl BatchTable for EventBatchView<'_> {
    type Key = DayKey;
    type Record = EventDay;

    async fn batch_get_page(
        &self,
        keys: &[DayKey],
    ) -> anyhow::Result<BatchGetPage<DayKey, EventDay>> {
        let mut found = Vec::with_capacity(keys.len());
        for (city_key, date) in keys {
            if let Some(day) = self.store.get_event_day(city_key, date, self.now_epoch)? {
                found.push(((city_key.clone(), date.clone()), day));
            }
        }
        Ok(BatchGetPage {
            found,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_write_page(
        &self,
        ops: Vec<WriteOp<DayKey, EventDay>>,
    ) -> anyhow::Result<Vec<WriteOp<DayKey, EventDay>>> {
        for op in ops {
            match op {
                WriteOp::Put(_, day) => self.store.put_event_day(&day)?,
                WriteOp::Delete((city_key, date)) => {
                    let conn = self.store.conn.lock().unwrap();
                    conn.execute(
                        "DELETE FROM event_days WHERE city_key = ?1 AND date = ?2",
                        params![city_key, date],
                    )?;
                }
            }
        }
        Ok(Vec::new())
    }
}
