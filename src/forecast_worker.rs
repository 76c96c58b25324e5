//! Queue consumers producing the nightly forecast records. One message at a
//! time per consumer; per-route failures are counted and skipped, while a
//! message that cannot be processed at all is left for redelivery so the
//! queue drives it toward the dead-letter table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::batch::{WriteOp, batch_get, batch_write};
use crate::config::QueueConfig;
use crate::delay_store::{DelayStore, EventBatchView, WeatherBatchView};
use crate::geo::within_corridor;
use crate::models::delay::{EventDay, EventRecord, WeatherDay};
use crate::models::message::{ChunkMessage, RouteRef};
use crate::models::route::{DayForecast, Forecast, Route};
use crate::queue::JobQueue;
use crate::recommend::{RecommendationInput, recommend};
use crate::route_store::{ForecastBatchView, RouteBatchView, RouteStore};
use crate::timemath::{iso_utc, local_time_to_utc, next_date_for_day};

#[derive(Debug, Default)]
pub struct WorkerReport {
    pub routes: usize,
    pub skipped: usize,
    pub forecasts_written: usize,
    pub shortfall: usize,
}

pub fn spawn_forecast_workers(
    queue: Arc<JobQueue>,
    routes: Arc<RouteStore>,
    delays: Arc<DelayStore>,
    config: QueueConfig,
    concurrency: usize,
) {
    for worker_id in 0..concurrency {
        let queue = queue.clone();
        let routes = routes.clone();
        let delays = delays.clone();
        let config = config.clone();
        tokio::spawn(async move {
            loop {
                let received = queue.receive(
                    config.visibility_secs,
                    config.max_receive_count,
                    Utc::now().timestamp(),
                );
                match received {
                    Ok(Some(msg)) => {
                        match process_message(&routes, &delays, &msg.body, Utc::now()).await {
                            Ok(report) => {
                                if let Err(e) = queue.delete(&msg.id) {
                                    tracing::error!("worker {worker_id}: ack failed: {e}");
                                }
                                tracing::info!(
                                    "worker {worker_id}: chunk {} done, {} routes ({} skipped)",
                                    msg.chunk_index,
                                    report.routes,
                                    report.skipped,
                                );
                            }
                            Err(e) => {
                                // No ack: redelivery, then the dead-letter
                                // table after max receives.
                                tracing::error!(
                                    "worker {worker_id}: message {} failed (receive {}): {e}",
                                    msg.id,
                                    msg.receive_count,
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(std::time::Duration::from_secs(config.poll_idle_secs))
                            .await;
                    }
                    Err(e) => {
                        tracing::error!("worker {worker_id}: receive failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(config.poll_idle_secs))
                            .await;
                    }
                }
            }
        });
    }
}

pub async fn process_message(
    routes: &RouteStore,
    delays: &DelayStore,
    body: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<WorkerReport> {
    let message: ChunkMessage = serde_json::from_str(body)?;
    let today = now.date_naive();
    let now_epoch = now.timestamp();

    let keys: Vec<(String, String)> = message
        .routes
        .iter()
        .map(|r| (r.user_id.clone(), r.route_id.clone()))
        .collect();
    let route_map = batch_get(&RouteBatchView(routes), keys).await?;

    // Distinct cities in the chunk and the union of day names decide which
    // delay records to pull.
    let city_keys: HashSet<&str> = route_map.values().map(|r| r.city_key.as_str()).collect();
    let day_union: HashSet<&str> = message
        .routes
        .iter()
        .flat_map(|r| r.days_of_week.iter().map(|d| d.as_str()))
        .collect();

    let date_for_day: HashMap<String, NaiveDate> = day_union
        .iter()
        .filter_map(|&day| next_date_for_day(day, today).map(|date| (day.to_string(), date)))
        .collect();

    let pairs: Vec<(String, String)> = city_keys
        .iter()
        .flat_map(|city_key| {
            date_for_day.values().map(|date| {
                (city_key.to_string(), date.format("%Y-%m-%d").to_string())
            })
        })
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();

    let weather_map = batch_get(
        &WeatherBatchView {
            store: delays,
            now_epoch,
        },
        pairs.clone(),
    )
    .await?;
    let event_map = batch_get(
        &EventBatchView {
            store: delays,
            now_epoch,
        },
        pairs,
    )
    .await?;

    let generated_at = iso_utc(now);
    let mut skipped = 0usize;
    let mut ops = Vec::new();
    for route_ref in &message.routes {
        let Some(route) = route_map.get(&(route_ref.user_id.clone(), route_ref.route_id.clone()))
        else {
            skipped += 1;
            tracing::warn!(
                "schedule references missing route {}/{}, skipping",
                route_ref.user_id,
                route_ref.route_id,
            );
            continue;
        };
        match build_forecast(route_ref, route, &date_for_day, &weather_map, &event_map, &generated_at)
        {
            Ok(Some(forecast)) => ops.push(WriteOp::Put(
                (route_ref.user_id.clone(), route_ref.route_id.clone()),
                forecast,
            )),
            Ok(None) => {}
            Err(e) => {
                skipped += 1;
                tracing::warn!(
                    "forecast failed for route {}/{}, skipping: {e}",
                    route_ref.user_id,
                    route_ref.route_id,
                );
            }
        }
    }

    let forecasts_written = ops.len();
    let shortfall = batch_write(&ForecastBatchView(routes), ops).await?;

    Ok(WorkerReport {
        routes: message.routes.len(),
        skipped,
        forecasts_written,
        shortfall,
    })
}

/// One route's day map. Returns `None` for a schedule selecting no days, so
/// the route keeps reading as pending/empty rather than active.
fn build_forecast(
    route_ref: &RouteRef,
    route: &Route,
    date_for_day: &HashMap<String, NaiveDate>,
    weather_map: &HashMap<(String, String), WeatherDay>,
    event_map: &HashMap<(String, String), EventDay>,
    generated_at: &str,
) -> anyhow::Result<Option<Forecast>> {
    let mut days: HashMap<String, DayForecast> = HashMap::new();

    for day in &route_ref.days_of_week {
        let Some(date) = date_for_day.get(day) else {
            tracing::warn!("unknown day name {day:?} on route {}, skipping day", route.route_id);
            continue;
        };
        let date_str = date.format("%Y-%m-%d").to_string();
        let delay_key = (route.city_key.clone(), date_str.clone());

        let weather = weather_map.get(&delay_key);
        let event_day = event_map.get(&delay_key);

        let arrive_by_utc = local_time_to_utc(&route_ref.arrive_by, &route_ref.timezone, *date);

        // Commute-window first, then corridor.
        let corridor_events: Vec<EventRecord> = event_day
            .map(|d| {
                d.events
                    .iter()
                    .filter(|e| e.start_time.as_str() <= route_ref.arrive_by.as_str())
                    .filter(|e| {
                        within_corridor(
                            e.lat,
                            e.lng,
                            route.origin.coords(),
                            route.destination.coords(),
                        )
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let recommendation = recommend(&RecommendationInput {
            hourly: weather.map(|w| w.hourly.as_slice()).unwrap_or(&[]),
            corridor_events: &corridor_events,
            arrive_by_utc: &arrive_by_utc,
            static_duration_mins: Some(route.static_duration_mins),
            forecast_date: *date,
        })?;

        days.insert(
            day.clone(),
            DayForecast {
                forecast_date: date_str,
                recommendation,
                has_weather_data: weather.is_some(),
                has_event_data: event_day.is_some(),
            },
        );
    }

    if days.is_empty() {
        return Ok(None);
    }
    Ok(Some(Forecast {
        route_id: route_ref.route_id.clone(),
        days,
        generated_at: generated_at.to_string(),
    }))
}
