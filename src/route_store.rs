//! Core per-user store: profiles, routes, schedules, forecasts, and the
//! city index. The city index is co-located so the route-lifecycle
//! transactions are real transactions; conditional expressions become
//! conditioned statements whose affected-row counts decide commit/rollback.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;

use crate::batch::{BatchGetPage, BatchTable, WriteOp};
use crate::models::city::CityRecord;
use crate::models::message::RouteRef;
use crate::models::route::{
    Forecast, MAX_ROUTES_PER_USER, Profile, Route, Schedule, Waypoint,
};

/// Outcomes of the lifecycle transactions that map to user-visible statuses.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("route not found")]
    NotFound,
    #[error("Maximum of {MAX_ROUTES_PER_USER} routes per user")]
    RouteCapExceeded,
    #[error("city active-route counter already at zero")]
    CityCounterDrift,
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

/// City metadata written alongside a route create.
#[derive(Debug, Clone)]
pub struct CityUpsert {
    pub city_key: String,
    pub city: String,
    pub country_code: String,
    pub city_lat: f64,
    pub city_lng: f64,
}

/// Route fields an update request may carry. `None` = untouched.
#[derive(Debug, Default, Clone)]
pub struct RouteFieldUpdates {
    pub title: Option<String>,
    pub origin: Option<Waypoint>,
    pub destination: Option<Waypoint>,
    pub intermediates: Option<Vec<Waypoint>>,
    pub travel_mode: Option<String>,
    pub static_duration_mins: Option<i64>,
    pub traffic_duration_mins: Option<i64>,
    pub distance_meters: Option<i64>,
    pub geometry: Option<String>,
    pub user_active: Option<bool>,
}

/// Schedule fields an update request may carry.
#[derive(Debug, Default, Clone)]
pub struct ScheduleFieldUpdates {
    pub arrive_by: Option<String>,
    pub timezone: Option<String>,
    pub days_of_week: Option<Vec<String>>,
}

impl RouteFieldUpdates {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.origin.is_none()
            && self.destination.is_none()
            && self.intermediates.is_none()
            && self.travel_mode.is_none()
            && self.static_duration_mins.is_none()
            && self.traffic_duration_mins.is_none()
            && self.distance_meters.is_none()
            && self.geometry.is_none()
            && self.user_active.is_none()
    }

    /// Whether any updated field feeds the recommendation math.
    pub fn affects_forecast(&self) -> bool {
        self.origin.is_some()
            || self.destination.is_some()
            || self.intermediates.is_some()
            || self.travel_mode.is_some()
            || self.static_duration_mins.is_some()
            || self.traffic_duration_mins.is_some()
    }
}

impl ScheduleFieldUpdates {
    pub fn is_empty(&self) -> bool {
        self.arrive_by.is_none() && self.timezone.is_none() && self.days_of_week.is_none()
    }
}

pub struct RouteStore {
    conn: Mutex<Connection>,
}

fn json_col<T: DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn route_from_row(row: &rusqlite::Row) -> rusqlite::Result<Route> {
    Ok(Route {
        route_id: row.get(0)?,
        title: row.get(1)?,
        origin: json_col(2, row.get::<_, String>(2)?)?,
        destination: json_col(3, row.get::<_, String>(3)?)?,
        intermediates: json_col(4, row.get::<_, String>(4)?)?,
        travel_mode: row.get(5)?,
        static_duration_mins: row.get(6)?,
        traffic_duration_mins: row.get(7)?,
        distance_meters: row.get(8)?,
        city_key: row.get(9)?,
        city_lat: row.get(10)?,
        city_lng: row.get(11)?,
        user_active: row.get(12)?,
        geometry: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

const ROUTE_COLS: &str = "route_id, title, origin, destination, intermediates, travel_mode, \
     static_duration_mins, traffic_duration_mins, distance_meters, city_key, city_lat, city_lng, \
     user_active, geometry, created_at, updated_at";

fn schedule_from_row(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        route_id: row.get(0)?,
        arrive_by: row.get(1)?,
        timezone: row.get(2)?,
        days_of_week: json_col(3, row.get::<_, String>(3)?)?,
        ttl: row.get(4)?,
        active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const SCHEDULE_COLS: &str =
    "route_id, arrive_by, timezone, days_of_week, ttl, active, created_at, updated_at";

fn city_from_row(row: &rusqlite::Row) -> rusqlite::Result<CityRecord> {
    Ok(CityRecord {
        city_key: row.get(0)?,
        city: row.get(1)?,
        country_code: row.get(2)?,
        city_lat: row.get(3)?,
        city_lng: row.get(4)?,
        active_route_count: row.get(5)?,
        first_registered_at: row.get(6)?,
        last_active_at: row.get(7)?,
    })
}

const CITY_COLS: &str = "city_key, city, country_code, city_lat, city_lng, active_route_count, \
     first_registered_at, last_active_at";

impl RouteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS profiles (
                user_id     TEXT PRIMARY KEY,
                email       TEXT NOT NULL DEFAULT '',
                route_count INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routes (
                user_id              TEXT NOT NULL,
                route_id             TEXT NOT NULL,
                title                TEXT NOT NULL,
                origin               TEXT NOT NULL,
                destination          TEXT NOT NULL,
                intermediates        TEXT NOT NULL DEFAULT '[]',
                travel_mode          TEXT NOT NULL,
                static_duration_mins INTEGER NOT NULL,
                traffic_duration_mins INTEGER,
                distance_meters      INTEGER,
                city_key             TEXT NOT NULL,
                city_lat             REAL NOT NULL,
                city_lng             REAL NOT NULL,
                user_active          INTEGER NOT NULL DEFAULT 1,
                geometry             TEXT,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                PRIMARY KEY (user_id, route_id)
            );
            CREATE INDEX IF NOT EXISTS idx_routes_city ON routes(city_key);

            CREATE TABLE IF NOT EXISTS schedules (
                user_id      TEXT NOT NULL,
                route_id     TEXT NOT NULL,
                arrive_by    TEXT NOT NULL,
                timezone     TEXT NOT NULL,
                days_of_week TEXT NOT NULL DEFAULT '[]',
                ttl          INTEGER NOT NULL,
                active       INTEGER NOT NULL DEFAULT 1,
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (user_id, route_id)
            );

            CREATE TABLE IF NOT EXISTS forecasts (
                user_id      TEXT NOT NULL,
                route_id     TEXT NOT NULL,
                days         TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, route_id)
            );

            CREATE TABLE IF NOT EXISTS city_index (
                city_key           TEXT PRIMARY KEY,
                city               TEXT NOT NULL,
                country_code       TEXT NOT NULL,
                city_lat           REAL NOT NULL,
                city_lng           REAL NOT NULL,
                active_route_count INTEGER NOT NULL DEFAULT 0 CHECK(active_route_count >= 0),
                first_registered_at TEXT NOT NULL,
                last_active_at     TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Profile operations ──

    /// Idempotent profile creation for the identity post-confirmation hook.
    /// Returns `false` when the profile already existed (`created_at` and
    /// `route_count` are left untouched).
    pub fn create_profile(&self, user_id: &str, email: &str, now: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "INSERT INTO profiles (user_id, email, route_count, created_at) VALUES (?1, ?2, 0, ?3) \
             ON CONFLICT(user_id) DO NOTHING",
            params![user_id, email, now],
        )?;
        Ok(count > 0)
    }

    pub fn get_profile(&self, user_id: &str) -> anyhow::Result<Option<Profile>> {
        let conn = self.conn.lock().unwrap();
        let profile = conn
            .query_row(
                "SELECT user_id, email, route_count, created_at FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Profile {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                        route_count: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    // ── Route lifecycle transactions ──

    /// Create: one transaction covering the profile counter (capped), the
    /// route, its schedule, and the city-index counter bump.
    pub fn create_route(
        &self,
        user_id: &str,
        route: &Route,
        schedule: &Schedule,
        city: &CityUpsert,
        now: &str,
    ) -> Result<(), LifecycleError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Counter bump conditioned on the cap; zero rows means at the limit.
        let bumped = tx.execute(
            "INSERT INTO profiles (user_id, email, route_count, created_at) VALUES (?1, '', 1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET route_count = route_count + 1 \
             WHERE route_count < ?3",
            params![user_id, now, MAX_ROUTES_PER_USER],
        )?;
        if bumped == 0 {
            return Err(LifecycleError::RouteCapExceeded);
        }

        tx.execute(
            "INSERT INTO routes (user_id, route_id, title, origin, destination, intermediates, \
             travel_mode, static_duration_mins, traffic_duration_mins, distance_meters, city_key, \
             city_lat, city_lng, user_active, geometry, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                user_id,
                route.route_id,
                route.title,
                serde_json::to_string(&route.origin).unwrap(),
                serde_json::to_string(&route.destination).unwrap(),
                serde_json::to_string(&route.intermediates).unwrap(),
                route.travel_mode,
                route.static_duration_mins,
                route.traffic_duration_mins,
                route.distance_meters,
                route.city_key,
                route.city_lat,
                route.city_lng,
                route.user_active,
                route.geometry,
                route.created_at,
                route.updated_at,
            ],
        )?;

        tx.execute(
            "INSERT INTO schedules (user_id, route_id, arrive_by, timezone, days_of_week, ttl, \
             active, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
            params![
                user_id,
                schedule.route_id,
                schedule.arrive_by,
                schedule.timezone,
                serde_json::to_string(&schedule.days_of_week).unwrap(),
                schedule.ttl,
                now,
            ],
        )?;

        // first_registered_at sticks on conflict; the counter and metadata move.
        tx.execute(
            "INSERT INTO city_index (city_key, city, country_code, city_lat, city_lng, \
             active_route_count, first_registered_at, last_active_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6) \
             ON CONFLICT(city_key) DO UPDATE SET \
               city = excluded.city, country_code = excluded.country_code, \
               city_lat = excluded.city_lat, city_lng = excluded.city_lng, \
               active_route_count = active_route_count + 1, \
               last_active_at = excluded.last_active_at",
            params![
                city.city_key,
                city.city,
                city.country_code,
                city.city_lat,
                city.city_lng,
                now,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Update: applies only the requested field sets, both stamped with
    /// `updated_at = now`; a schedule update also refreshes its TTL.
    pub fn update_route(
        &self,
        user_id: &str,
        route_id: &str,
        route_updates: &RouteFieldUpdates,
        schedule_updates: &ScheduleFieldUpdates,
        schedule_ttl: i64,
        now: &str,
    ) -> Result<(), LifecycleError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if !route_updates.is_empty() {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut push = |col: &str, v: Box<dyn rusqlite::types::ToSql>, values: &mut Vec<_>| {
                values.push(v);
                sets.push(format!("{col} = ?{}", values.len()));
            };
            if let Some(ref v) = route_updates.title {
                push("title", Box::new(v.clone()), &mut values);
            }
            if let Some(ref v) = route_updates.origin {
                push("origin", Box::new(serde_json::to_string(v).unwrap()), &mut values);
            }
            if let Some(ref v) = route_updates.destination {
                push("destination", Box::new(serde_json::to_string(v).unwrap()), &mut values);
            }
            if let Some(ref v) = route_updates.intermediates {
                push("intermediates", Box::new(serde_json::to_string(v).unwrap()), &mut values);
            }
            if let Some(ref v) = route_updates.travel_mode {
                push("travel_mode", Box::new(v.clone()), &mut values);
            }
            if let Some(v) = route_updates.static_duration_mins {
                push("static_duration_mins", Box::new(v), &mut values);
            }
            if let Some(v) = route_updates.traffic_duration_mins {
                push("traffic_duration_mins", Box::new(v), &mut values);
            }
            if let Some(v) = route_updates.distance_meters {
                push("distance_meters", Box::new(v), &mut values);
            }
            if let Some(ref v) = route_updates.geometry {
                push("geometry", Box::new(v.clone()), &mut values);
            }
            if let Some(v) = route_updates.user_active {
                push("user_active", Box::new(v), &mut values);
            }
            push("updated_at", Box::new(now.to_string()), &mut values);

            let sql = format!(
                "UPDATE routes SET {} WHERE user_id = ?{} AND route_id = ?{}",
                sets.join(", "),
                values.len() + 1,
                values.len() + 2,
            );
            values.push(Box::new(user_id.to_string()));
            values.push(Box::new(route_id.to_string()));
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let count = tx.execute(&sql, refs.as_slice())?;
            if count == 0 {
                return Err(LifecycleError::NotFound);
            }
        }

        if !schedule_updates.is_empty() {
            let mut sets: Vec<String> = Vec::new();
            let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
            let mut push = |col: &str, v: Box<dyn rusqlite::types::ToSql>, values: &mut Vec<_>| {
                values.push(v);
                sets.push(format!("{col} = ?{}", values.len()));
            };
            if let Some(ref v) = schedule_updates.arrive_by {
                push("arrive_by", Box::new(v.clone()), &mut values);
            }
            if let Some(ref v) = schedule_updates.timezone {
                push("timezone", Box::new(v.clone()), &mut values);
            }
            if let Some(ref v) = schedule_updates.days_of_week {
                push("days_of_week", Box::new(serde_json::to_string(v).unwrap()), &mut values);
            }
            push("ttl", Box::new(schedule_ttl), &mut values);
            push("updated_at", Box::new(now.to_string()), &mut values);

            let sql = format!(
                "UPDATE schedules SET {} WHERE user_id = ?{} AND route_id = ?{}",
                sets.join(", "),
                values.len() + 1,
                values.len() + 2,
            );
            values.push(Box::new(user_id.to_string()));
            values.push(Box::new(route_id.to_string()));
            let refs: Vec<&dyn rusqlite::types::ToSql> =
                values.iter().map(|v| v.as_ref()).collect();
            let count = tx.execute(&sql, refs.as_slice())?;
            if count == 0 {
                return Err(LifecycleError::NotFound);
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Delete step 1: stop the next orchestrator run from picking the route
    /// up; the short TTL lets the store expire the marker row.
    pub fn deactivate_schedule(
        &self,
        user_id: &str,
        route_id: &str,
        ttl: i64,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE schedules SET active = 0, ttl = ?3 WHERE user_id = ?1 AND route_id = ?2",
            params![user_id, route_id, ttl],
        )?;
        Ok(count > 0)
    }

    /// Delete step 2: route removal, city counter decrement (underflow
    /// guarded), and profile counter decrement, atomically.
    pub fn delete_route(
        &self,
        user_id: &str,
        route_id: &str,
        city_key: &str,
        now: &str,
    ) -> Result<(), LifecycleError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let deleted = tx.execute(
            "DELETE FROM routes WHERE user_id = ?1 AND route_id = ?2",
            params![user_id, route_id],
        )?;
        if deleted == 0 {
            return Err(LifecycleError::NotFound);
        }

        let decremented = tx.execute(
            "UPDATE city_index SET active_route_count = active_route_count - 1, \
             last_active_at = ?2 WHERE city_key = ?1 AND active_route_count > 0",
            params![city_key, now],
        )?;
        if decremented == 0 {
            return Err(LifecycleError::CityCounterDrift);
        }

        tx.execute(
            "UPDATE profiles SET route_count = route_count - 1 WHERE user_id = ?1",
            params![user_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Compensation when the city counter has drifted to zero: remove the
    /// route and fix the profile counter without touching the city index.
    pub fn delete_route_compensating(
        &self,
        user_id: &str,
        route_id: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM routes WHERE user_id = ?1 AND route_id = ?2",
            params![user_id, route_id],
        )?;
        if deleted > 0 {
            tx.execute(
                "UPDATE profiles SET route_count = route_count - 1 WHERE user_id = ?1",
                params![user_id],
            )?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    // ── Route / schedule / forecast reads ──

    pub fn get_route(&self, user_id: &str, route_id: &str) -> anyhow::Result<Option<Route>> {
        let conn = self.conn.lock().unwrap();
        let route = conn
            .query_row(
                &format!("SELECT {ROUTE_COLS} FROM routes WHERE user_id = ?1 AND route_id = ?2"),
                params![user_id, route_id],
                route_from_row,
            )
            .optional()?;
        Ok(route)
    }

    pub fn list_routes(&self, user_id: &str) -> anyhow::Result<Vec<Route>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ROUTE_COLS} FROM routes WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![user_id], route_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_schedule(&self, user_id: &str, route_id: &str) -> anyhow::Result<Option<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let schedule = conn
            .query_row(
                &format!(
                    "SELECT {SCHEDULE_COLS} FROM schedules WHERE user_id = ?1 AND route_id = ?2"
                ),
                params![user_id, route_id],
                schedule_from_row,
            )
            .optional()?;
        Ok(schedule)
    }

    pub fn list_schedules(&self, user_id: &str) -> anyhow::Result<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEDULE_COLS} FROM schedules WHERE user_id = ?1"
        ))?;
        let rows = stmt
            .query_map(params![user_id], schedule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_forecast(&self, user_id: &str, route_id: &str) -> anyhow::Result<Option<Forecast>> {
        let conn = self.conn.lock().unwrap();
        let forecast = conn
            .query_row(
                "SELECT route_id, days, generated_at FROM forecasts \
                 WHERE user_id = ?1 AND route_id = ?2",
                params![user_id, route_id],
                |row| {
                    Ok(Forecast {
                        route_id: row.get(0)?,
                        days: json_col(1, row.get::<_, String>(1)?)?,
                        generated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(forecast)
    }

    pub fn list_forecasts(&self, user_id: &str) -> anyhow::Result<Vec<Forecast>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT route_id, days, generated_at FROM forecasts WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(Forecast {
                    route_id: row.get(0)?,
                    days: json_col(1, row.get::<_, String>(1)?)?,
                    generated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn put_forecast(&self, user_id: &str, forecast: &Forecast) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO forecasts (user_id, route_id, days, generated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(user_id, route_id) DO UPDATE SET \
               days = excluded.days, generated_at = excluded.generated_at",
            params![
                user_id,
                forecast.route_id,
                serde_json::to_string(&forecast.days).unwrap(),
                forecast.generated_at,
            ],
        )?;
        Ok(())
    }

    /// Missing forecasts are not an error; invalidation is best-effort.
    pub fn delete_forecast(&self, user_id: &str, route_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM forecasts WHERE user_id = ?1 AND route_id = ?2",
            params![user_id, route_id],
        )?;
        Ok(count > 0)
    }

    // ── Orchestrator scan ──

    /// One keyset-paginated page of live schedules, projected to the queue
    /// message shape. `after` is the last (user_id, route_id) of the
    /// previous page.
    pub fn scan_schedules_page(
        &self,
        after: Option<(&str, &str)>,
        limit: usize,
        now_epoch: i64,
    ) -> anyhow::Result<Vec<RouteRef>> {
        let conn = self.conn.lock().unwrap();
        let (cursor_user, cursor_route) = after.unwrap_or(("", ""));
        let mut stmt = conn.prepare(
            "SELECT user_id, route_id, arrive_by, timezone, days_of_week FROM schedules \
             WHERE active = 1 AND ttl > ?1 AND (user_id, route_id) > (?2, ?3) \
             ORDER BY user_id, route_id LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![now_epoch, cursor_user, cursor_route, limit as i64],
                |row| {
                    Ok(RouteRef {
                        user_id: row.get(0)?,
                        route_id: row.get(1)?,
                        arrive_by: row.get(2)?,
                        timezone: row.get(3)?,
                        days_of_week: json_col(4, row.get::<_, String>(4)?)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drop schedule rows whose TTL has passed (deleted routes' markers and
    /// stale schedules never refreshed by an update).
    pub fn purge_expired_schedules(&self, now_epoch: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM schedules WHERE ttl <= ?1",
            params![now_epoch],
        )?;
        Ok(count)
    }

    pub fn count_live_schedules(&self, now_epoch: i64) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM schedules WHERE active = 1 AND ttl > ?1",
            params![now_epoch],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ── City index ──

    pub fn active_cities(&self) -> anyhow::Result<Vec<CityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CITY_COLS} FROM city_index WHERE active_route_count > 0 ORDER BY city_key"
        ))?;
        let rows = stmt
            .query_map([], city_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_city(&self, city_key: &str) -> anyhow::Result<Option<CityRecord>> {
        let conn = self.conn.lock().unwrap();
        let city = conn
            .query_row(
                &format!("SELECT {CITY_COLS} FROM city_index WHERE city_key = ?1"),
                params![city_key],
                city_from_row,
            )
            .optional()?;
        Ok(city)
    }

    #[cfg(test)]
    pub fn force_city_counter(&self, city_key: &str, value: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE city_index SET active_route_count = ?2 WHERE city_key = ?1",
            params![city_key, value],
        )?;
        Ok(())
    }
}

// ── Batch views over the core store ──

/// Read view for the worker's chunk loads, keyed by (user_id, route_id).
pub struct RouteBatchView<'a>(pub &'a RouteStore);

#[async_trait]
impl BatchTable for RouteBatchView<'_> {
    type Key = (String, String);
    type Record = Route;

    async fn batch_get_page(
        &self,
        keys: &[(String, String)],
    ) -> anyhow::Result<BatchGetPage<(String, String), Route>> {
        let mut found = Vec::with_capacity(keys.len());
        for (user_id, route_id) in keys {
            if let Some(route) = self.0.get_route(user_id, route_id)? {
                found.push(((user_id.clone(), route_id.clone()), route));
            }
        }
        Ok(BatchGetPage {
            found,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_write_page(
        &self,
        _ops: Vec<WriteOp<(String, String), Route>>,
    ) -> anyhow::Result<Vec<WriteOp<(String, String), Route>>> {
        anyhow::bail!("routes mutate only through the lifecycle transactions")
    }
}

/// Write view for the worker's nightly forecast output.
pub struct ForecastBatchView<'a>(pub &'a RouteStore);

#[async_trait]
impl BatchTable for ForecastBatchView<'_> {
    type Key = (String, String);
    type Record = Forecast;

    async fn batch_get_page(
        &self,
        keys: &[(String, String)],
    ) -> anyhow::Result<BatchGetPage<(String, String), Forecast>> {
        let mut found = Vec::with_capacity(keys.len());
        for (user_id, route_id) in keys {
            if let Some(forecast) = self.0.get_forecast(user_id, route_id)? {
                found.push(((user_id.clone(), route_id.clone()), forecast));
            }
        }
        Ok(BatchGetPage {
            found,
            unprocessed: Vec::new(),
        })
    }

    async fn batch_write_page(
        &self,
        ops: Vec<WriteOp<(String, String), Forecast>>,
    ) -> anyhow::Result<Vec<WriteOp<(String, String), Forecast>>> {
        for op in ops {
            match op {
                WriteOp::Put((user_id, _), forecast) => self.0.put_forecast(&user_id, &forecast)?,
                WriteOp::Delete((user_id, route_id)) => {
                    self.0.delete_forecast(&user_id, &route_id)?;
                }
            }
        }
        Ok(Vec::new())
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use std::collections::HashMap;

    const NOW: &str = "2026-08-01T10:00:00Z";

    fn create(store: &RouteStore, user: &str, route_id: &str) {
        store.create_profile(user, "a@example.com", NOW).unwrap();
        store
            .create_route(
                user,
                &route(route_id, "IE#DUBLIN"),
                &schedule(route_id, &["MON", "FRI"]),
                &city("IE#DUBLIN"),
                NOW,
            )
            .unwrap();
    }

    #[test]
    fn test_profile_creation_is_idempotent() {
        let store = store();
        assert!(store.create_profile("u1", "a@example.com", NOW).unwrap());
        assert!(!store.create_profile("u1", "a@example.com", "2027-01-01T00:00:00Z").unwrap());
        let profile = store.get_profile("u1").unwrap().unwrap();
        assert_eq!(profile.created_at, NOW, "createdAt must not be overwritten");
        assert_eq!(profile.route_count, 0);
    }

    #[test]
    fn test_create_route_bumps_both_counters() {
        let store = store();
        create(&store, "u1", "r1");
        assert_eq!(store.get_profile("u1").unwrap().unwrap().route_count, 1);
        let city = store.get_city("IE#DUBLIN").unwrap().unwrap();
        assert_eq!(city.active_route_count, 1);
        assert_eq!(city.first_registered_at, NOW);
        assert!(store.get_schedule("u1", "r1").unwrap().is_some());
    }

    #[test]
    fn test_create_respects_route_cap() {
        let store = store();
        store.create_profile("u1", "a@example.com", NOW).unwrap();
        for i in 0..MAX_ROUTES_PER_USER {
            store
                .create_route(
                    "u1",
                    &route(&format!("r{i}"), "IE#DUBLIN"),
                    &schedule(&format!("r{i}"), &["MON"]),
                    &city("IE#DUBLIN"),
                    NOW,
                )
                .unwrap();
        }
        let err = store
            .create_route(
                "u1",
                &route("r-over", "IE#DUBLIN"),
                &schedule("r-over", &["MON"]),
                &city("IE#DUBLIN"),
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::RouteCapExceeded));
        // Nothing from the rejected transaction may persist.
        assert!(store.get_route("u1", "r-over").unwrap().is_none());
        assert_eq!(store.get_profile("u1").unwrap().unwrap().route_count, 20);
        assert_eq!(
            store.get_city("IE#DUBLIN").unwrap().unwrap().active_route_count,
            20
        );
    }

    #[test]
    fn test_create_delete_round_trip_restores_counters() {
        let store = store();
        create(&store, "u1", "r1");
        create(&store, "u1", "r2");

        store.deactivate_schedule("u1", "r2", 0).unwrap();
        store.delete_route("u1", "r2", "IE#DUBLIN", NOW).unwrap();

        assert_eq!(store.get_profile("u1").unwrap().unwrap().route_count, 1);
        assert_eq!(
            store.get_city("IE#DUBLIN").unwrap().unwrap().active_route_count,
            1
        );
        assert!(store.get_route("u1", "r2").unwrap().is_none());
    }

    #[test]
    fn test_delete_with_drifted_city_counter() {
        let store = store();
        create(&store, "u1", "r1");
        store.force_city_counter("IE#DUBLIN", 0).unwrap();

        let err = store.delete_route("u1", "r1", "IE#DUBLIN", NOW).unwrap_err();
        assert!(matches!(err, LifecycleError::CityCounterDrift));
        // The conditioned transaction must not have removed the route.
        assert!(store.get_route("u1", "r1").unwrap().is_some());

        // Compensation path: route and profile fixed, counter left at zero.
        assert!(store.delete_route_compensating("u1", "r1").unwrap());
        assert!(store.get_route("u1", "r1").unwrap().is_none());
        assert_eq!(store.get_profile("u1").unwrap().unwrap().route_count, 0);
        assert_eq!(
            store.get_city("IE#DUBLIN").unwrap().unwrap().active_route_count,
            0
        );
    }

    #[test]
    fn test_delete_missing_route_is_not_found() {
        let store = store();
        store.create_profile("u1", "a@example.com", NOW).unwrap();
        let err = store.delete_route("u1", "nope", "IE#DUBLIN", NOW).unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound));
    }

    #[test]
    fn test_update_unknown_route_is_not_found() {
        let store = store();
        let updates = RouteFieldUpdates {
            title: Some("New title".into()),
            ..Default::default()
        };
        let err = store
            .update_route("u1", "nope", &updates, &ScheduleFieldUpdates::default(), 0, NOW)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound));
    }

    #[test]
    fn test_update_route_and_schedule_fields() {
        let store = store();
        create(&store, "u1", "r1");
        let route_updates = RouteFieldUpdates {
            title: Some("Evening run".into()),
            static_duration_mins: Some(40),
            ..Default::default()
        };
        let schedule_updates = ScheduleFieldUpdates {
            arrive_by: Some("17:45".into()),
            days_of_week: Some(vec!["TUE".into()]),
            ..Default::default()
        };
        store
            .update_route("u1", "r1", &route_updates, &schedule_updates, 99, "2026-08-02T00:00:00Z")
            .unwrap();

        let route = store.get_route("u1", "r1").unwrap().unwrap();
        assert_eq!(route.title, "Evening run");
        assert_eq!(route.static_duration_mins, 40);
        assert_eq!(route.updated_at, "2026-08-02T00:00:00Z");
        let schedule = store.get_schedule("u1", "r1").unwrap().unwrap();
        assert_eq!(schedule.arrive_by, "17:45");
        assert_eq!(schedule.days_of_week, vec!["TUE".to_string()]);
        assert_eq!(schedule.ttl, 99);
    }

    #[test]
    fn test_route_count_invariant_across_lifecycle() {
        let store = store();
        create(&store, "u1", "r1");
        create(&store, "u1", "r2");
        create(&store, "u1", "r3");
        store.deactivate_schedule("u1", "r1", 0).unwrap();
        store.delete_route("u1", "r1", "IE#DUBLIN", NOW).unwrap();

        let profile = store.get_profile("u1").unwrap().unwrap();
        let routes = store.list_routes("u1").unwrap();
        assert_eq!(profile.route_count, routes.len() as i64);
        let city = store.get_city("IE#DUBLIN").unwrap().unwrap();
        assert_eq!(city.active_route_count, routes.len() as i64);
    }

    #[test]
    fn test_forecast_affecting_fields() {
        // Geometry and presentation fields never cost the user a forecast;
        // anything feeding the departure math does.
        let affecting = [
            RouteFieldUpdates { origin: Some(waypoint(53.0, -6.0, "A")), ..Default::default() },
            RouteFieldUpdates { destination: Some(waypoint(53.0, -6.0, "B")), ..Default::default() },
            RouteFieldUpdates { intermediates: Some(Vec::new()), ..Default::default() },
            RouteFieldUpdates { travel_mode: Some("WALK".into()), ..Default::default() },
            RouteFieldUpdates { static_duration_mins: Some(30), ..Default::default() },
            RouteFieldUpdates { traffic_duration_mins: Some(35), ..Default::default() },
        ];
        for updates in &affecting {
            assert!(updates.affects_forecast(), "{updates:?}");
        }
        let benign = [
            RouteFieldUpdates { title: Some("New".into()), ..Default::default() },
            RouteFieldUpdates { geometry: Some("poly".into()), ..Default::default() },
            RouteFieldUpdates { distance_meters: Some(5000), ..Default::default() },
            RouteFieldUpdates { user_active: Some(false), ..Default::default() },
        ];
        for updates in &benign {
            assert!(!updates.affects_forecast(), "{updates:?}");
        }
    }

    #[test]
    fn test_title_update_leaves_forecast_while_arrive_by_invalidates() {
        // The update handler deletes the forecast exactly when
        // affects_forecast() or a schedule field says so; replay that
        // decision against the store.
        let store = store();
        create(&store, "u1", "r1");
        let forecast = Forecast {
            route_id: "r1".into(),
            days: HashMap::new(),
            generated_at: NOW.into(),
        };
        store.put_forecast("u1", &forecast).unwrap();

        let title_only = RouteFieldUpdates { title: Some("Renamed".into()), ..Default::default() };
        let no_schedule = ScheduleFieldUpdates::default();
        store.update_route("u1", "r1", &title_only, &no_schedule, 0, NOW).unwrap();
        if title_only.affects_forecast() || !no_schedule.is_empty() {
            store.delete_forecast("u1", "r1").unwrap();
        }
        assert!(store.get_forecast("u1", "r1").unwrap().is_some());

        let arrive_by = ScheduleFieldUpdates { arrive_by: Some("09:00".into()), ..Default::default() };
        let no_route = RouteFieldUpdates::default();
        store.update_route("u1", "r1", &no_route, &arrive_by, 0, NOW).unwrap();
        if no_route.affects_forecast() || !arrive_by.is_empty() {
            store.delete_forecast("u1", "r1").unwrap();
        }
        assert!(store.get_forecast("u1", "r1").unwrap().is_none());
    }

    #[test]
    fn test_forecast_put_replace_delete() {
        let store = store();
        create(&store, "u1", "r1");
        let mut days = HashMap::new();
        days.insert(
            "MON".to_string(),
            crate::models::route::DayForecast {
                forecast_date: "2026-08-03".into(),
                recommendation: crate::models::route::Recommendation {
                    adjusted_depart_by: "2026-08-03T07:55:00Z".into(),
                    extra_buffer_mins: 10,
                    reasoning: "Rain expected".into(),
                },
                has_weather_data: true,
                has_event_data: false,
            },
        );
        let forecast = Forecast {
            route_id: "r1".into(),
            days,
            generated_at: NOW.into(),
        };
        store.put_forecast("u1", &forecast).unwrap();
        assert!(store.get_forecast("u1", "r1").unwrap().is_some());

        // Wholesale replace on the nightly rerun.
        let replacement = Forecast {
            route_id: "r1".into(),
            days: HashMap::new(),
            generated_at: "2026-08-02T00:10:00Z".into(),
        };
        store.put_forecast("u1", &replacement).unwrap();
        let stored = store.get_forecast("u1", "r1").unwrap().unwrap();
        assert!(stored.days.is_empty());

        assert!(store.delete_forecast("u1", "r1").unwrap());
        assert!(!store.delete_forecast("u1", "r1").unwrap(), "missing is non-fatal");
    }

    #[test]
    fn test_scan_schedules_pagination_and_ttl_filter() {
        let store = store();
        for i in 0..5 {
            create(&store, "u1", &format!("r{i}"));
        }
        create(&store, "u2", "r9");
        // Deactivated and expired rows drop out of the scan.
        store.deactivate_schedule("u1", "r4", 0).unwrap();

        let now_epoch = 1_900_000_000;
        let mut seen = Vec::new();
        let mut cursor: Option<(String, String)> = None;
        loop {
            let page = store
                .scan_schedules_page(
                    cursor.as_ref().map(|(u, r)| (u.as_str(), r.as_str())),
                    2,
                    now_epoch,
                )
                .unwrap();
            if page.is_empty() {
                break;
            }
            cursor = page
                .last()
                .map(|r| (r.user_id.clone(), r.route_id.clone()));
            seen.extend(page);
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|r| !(r.user_id == "u1" && r.route_id == "r4")));
        assert_eq!(seen.last().unwrap().user_id, "u2");
    }

    #[test]
    fn test_purge_expired_schedules() {
        let store = store();
        create(&store, "u1", "r1");
        create(&store, "u1", "r2");
        store.deactivate_schedule("u1", "r1", 100).unwrap();
        let purged = store.purge_expired_schedules(200).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_schedule("u1", "r1").unwrap().is_none());
        assert!(store.get_schedule("u1", "r2").unwrap().is_some());
    }

    #[test]
    fn test_active_cities_filters_zero_counts() {
        let store = store();
        create(&store, "u1", "r1");
        store.force_city_counter("IE#DUBLIN", 0).unwrap();
        assert!(store.active_cities().unwrap().is_empty());
        store.force_city_counter("IE#DUBLIN", 2).unwrap();
        assert_eq!(store.active_cities().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_batch_view_reads_chunk() {
        let store = store();
        create(&store, "u1", "r1");
        create(&store, "u2", "r9");
        let view = RouteBatchView(&store);
        let keys = vec![
            ("u1".to_string(), "r1".to_string()),
            ("u2".to_string(), "r9".to_string()),
            ("u3".to_string(), "ghost".to_string()),
        ];
        let got = crate::batch::batch_get(&view, keys).await.unwrap();
        assert_eq!(got.len(), 2, "missing routes are tolerated");
    }

    #[tokio::test]
    async fn test_forecast_batch_view_writes() {
        let store = store();
        create(&store, "u1", "r1");
        let view = ForecastBatchView(&store);
        let forecast = Forecast {
            route_id: "r1".into(),
            days: HashMap::new(),
            generated_at: NOW.into(),
        };
        let ops = vec![WriteOp::Put(("u1".to_string(), "r1".to_string()), forecast)];
        let shortfall = crate::batch::batch_write(&view, ops).await.unwrap();
        assert_eq!(shortfall, 0);
        assert!(store.get_forecast("u1", "r1").unwrap().is_some());
    }
}
