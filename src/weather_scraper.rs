//! Nightly weather scrape: one concurrent fetch per active city, sliced
//! into day records for offsets 1..7 and batch-written with an 8-day TTL.
//! No user-specific filtering happens here; cost stays O(active cities).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;

use crate::batch::{WriteOp, batch_write};
use crate::delay_store::{DelayStore, WeatherBatchView};
use crate::models::delay::WeatherDay;
use crate::providers::weather::WeatherClient;
use crate::route_store::RouteStore;
use crate::timemath::{iso_utc, next_run_delay};

/// Day offsets scraped each night: tomorrow through a week out, never today.
pub const DAY_OFFSETS: std::ops::RangeInclusive<i64> = 1..=7;
const TTL_DAYS: i64 = 8;

#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub cities: usize,
    pub failed_cities: usize,
    pub records_written: usize,
    pub shortfall: usize,
}

pub fn spawn_weather_scraper(
    routes: Arc<RouteStore>,
    delays: Arc<DelayStore>,
    client: WeatherClient,
    hour_utc: u32,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(next_run_delay(hour_utc, Utc::now())).await;
            match run_weather_scrape(&routes, &delays, &client, Utc::now()).await {
                Ok(report) => tracing::info!(
                    "weather scrape: {} cities ({} failed), {} records, shortfall {}",
                    report.cities,
                    report.failed_cities,
                    report.records_written,
                    report.shortfall,
                ),
                Err(e) => tracing::error!("weather scraper error: {e}"),
            }
        }
    });
}

pub async fn run_weather_scrape(
    routes: &RouteStore,
    delays: &DelayStore,
    client: &WeatherClient,
    now: DateTime<Utc>,
) -> anyhow::Result<ScrapeReport> {
    let cities = routes.active_cities()?;
    delays.purge_expired(now.timestamp())?;

    let ttl = (now + Duration::days(TTL_DAYS)).timestamp();
    let fetched_at = iso_utc(now);
    let today = now.date_naive();

    let outcomes = join_all(cities.iter().map(|city| async move {
        (city, client.fetch_hourly(city.city_lat, city.city_lng).await)
    }))
    .await;

    let mut ops = Vec::new();
    let mut failed_cities = 0;
    for (city, outcome) in outcomes {
        match outcome {
            Ok(forecast) => {
                for offset in DAY_OFFSETS {
                    let date = (today + Duration::days(offset)).format("%Y-%m-%d").to_string();
                    let day = WeatherDay {
                        city_key: city.city_key.clone(),
                        date: date.clone(),
                        hourly: forecast.day_slice(&date),
                        fetched_at: fetched_at.clone(),
                        ttl,
                    };
                    ops.push(WriteOp::Put((city.city_key.clone(), date), day));
                }
            }
            Err(e) => {
                failed_cities += 1;
                tracing::warn!("weather fetch failed for {}: {e}", city.city_key);
            }
        }
    }

    let records_written = ops.len();
    let view = WeatherBatchView {
        store: delays,
        now_epoch: now.timestamp(),
    };
    let shortfall = batch_write(&view, ops).await?;

    Ok(ScrapeReport {
        cities: cities.len(),
        failed_cities,
        records_written,
        shortfall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay_store::DelayStore;
    use crate::route_store::test_fixtures;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn active_city_store() -> crate::route_store::RouteStore {
        let store = test_fixtures::store();
        store.create_profile("u1", "a@example.com", "2026-08-01T00:00:00Z").unwrap();
        store
            .create_route(
                "u1",
                &test_fixtures::route("r1", "IE#DUBLIN"),
                &test_fixtures::schedule("r1", &["MON"]),
                &test_fixtures::city("IE#DUBLIN"),
                "2026-08-01T00:00:00Z",
            )
            .unwrap();
        store
    }

    fn payload_for(dates: &[&str]) -> serde_json::Value {
        let mut time = Vec::new();
        let mut precipitation = Vec::new();
        for date in dates {
            for hour in 0..24 {
                time.push(format!("{date}T{hour:02}:00"));
                precipitation.push(if hour == 8 { 0.7 } else { 0.0 });
            }
        }
        serde_json::json!({ "hourly": { "time": time, "precipitation": precipitation } })
    }

    #[tokio::test]
    async fn test_scrape_writes_seven_day_records() {
        let server = MockServer::start().await;
        let dates: Vec<String> = (0..8)
            .map(|offset| format!("2026-08-{:02}", 1 + offset))
            .collect();
        let date_refs: Vec<&str> = dates.iter().map(|d| d.as_str()).collect();
        Mock::given(method("GET"))
            .and(path("/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload_for(&date_refs)))
            .expect(1)
            .mount(&server)
            .await;

        let routes = active_city_store();
        let delays = DelayStore::open_in_memory();
        let client = WeatherClient::new(&server.uri());
        let now: DateTime<Utc> = "2026-08-01T23:00:00Z".parse().unwrap();

        let report = run_weather_scrape(&routes, &delays, &client, now).await.unwrap();
        assert_eq!(report.cities, 1);
        assert_eq!(report.failed_cities, 0);
        assert_eq!(report.records_written, 7);

        // Never "today"; always tomorrow through day 7.
        assert!(delays
            .get_weather_day("IE#DUBLIN", "2026-08-01", now.timestamp())
            .unwrap()
            .is_none());
        let day = delays
            .get_weather_day("IE#DUBLIN", "2026-08-02", now.timestamp())
            .unwrap()
            .unwrap();
        assert_eq!(day.hourly[8].precipitation_mm, 0.7);
        assert!(delays
            .get_weather_day("IE#DUBLIN", "2026-08-08", now.timestamp())
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_provider_failure_is_isolated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forecast"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let routes = active_city_store();
        let delays = DelayStore::open_in_memory();
        let client = WeatherClient::new(&server.uri());
        let now: DateTime<Utc> = "2026-08-01T23:00:00Z".parse().unwrap();

        let report = run_weather_scrape(&routes, &delays, &client, now).await.unwrap();
        assert_eq!(report.failed_cities, 1);
        assert_eq!(report.records_written, 0);
    }

    #[tokio::test]
    async fn test_no_active_cities_means_no_fetches() {
        let server = MockServer::start().await;
        // No mock mounted: any request would fail the scrape.
        let routes = test_fixtures::store();
        let delays = DelayStore::open_in_memory();
        let client = WeatherClient::new(&server.uri());
        let report = run_weather_scrape(&routes, &delays, &client, Utc::now()).await.unwrap();
        assert_eq!(report.cities, 0);
        assert_eq!(report.records_written, 0);
    }
}
