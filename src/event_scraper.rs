//! Nightly event scrape. Same shape as the weather scraper: fan out over
//! active cities, isolate per-city failures, batch-write day records. The
//! provider is paginated and rate-limited, which the client absorbs; here
//! events are bucketed by their local start date into offsets 1..7.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;

use crate::batch::{WriteOp, batch_write};
use crate::delay_store::{DelayStore, EventBatchView};
use crate::models::delay::{EventDay, EventRecord};
use crate::providers::events::EventClient;
use crate::route_store::RouteStore;
use crate::timemath::{iso_utc, next_run_delay};
use crate::weather_scraper::{DAY_OFFSETS, ScrapeReport};

const TTL_DAYS: i64 = 8;

pub fn spawn_event_scraper(
    routes: Arc<RouteStore>,
    delays: Arc<DelayStore>,
    client: Arc<EventClient>,
    hour_utc: u32,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(next_run_delay(hour_utc, Utc::now())).await;
            match run_event_scrape(&routes, &delays, &client, Utc::now()).await {
                Ok(report) => tracing::info!(
                    "event scrape: {} cities ({} failed), {} records, shortfall {}",
                    report.cities,
                    report.failed_cities,
                    report.records_written,
                    report.shortfall,
                ),
                Err(e) => tracing::error!("event scraper error: {e}"),
            }
        }
    });
}

pub async fn run_event_scrape(
    routes: &RouteStore,
    delays: &DelayStore,
    client: &EventClient,
    now: DateTime<Utc>,
) -> anyhow::Result<ScrapeReport> {
    let cities = routes.active_cities()?;
    delays.purge_expired(now.timestamp())?;

    let ttl = (now + Duration::days(TTL_DAYS)).timestamp();
    let fetched_at = iso_utc(now);
    let today = now.date_naive();

    // Search window covers the same days the records will name.
    let window_start = (today + Duration::days(*DAY_OFFSETS.start()))
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let window_end = (today + Duration::days(*DAY_OFFSETS.end()))
        .and_hms_opt(23, 59, 59)
        .expect("end of day is always valid")
        .and_utc();
    let start = iso_utc(window_start);
    let end = iso_utc(window_end);

    let outcomes = join_all(cities.iter().map(|city| {
        let start = start.clone();
        let end = end.clone();
        async move {
            (
                city,
                client.fetch_events(city.city_lat, city.city_lng, &start, &end).await,
            )
        }
    }))
    .await;

    let mut ops = Vec::new();
    let mut failed_cities = 0;
    for (city, outcome) in outcomes {
        match outcome {
            Ok(fetched) => {
                let mut by_date: HashMap<String, Vec<EventRecord>> = HashMap::new();
                for event in fetched {
                    by_date.entry(event.local_date.clone()).or_default().push(EventRecord {
                        name: event.name,
                        venue: event.venue,
                        lat: event.lat,
                        lng: event.lng,
                        start_time: event.start_time,
                        url: event.url,
                    });
                }
                // Every offset gets a record; an empty list still proves the
                // day was scraped.
                for offset in DAY_OFFSETS {
                    let date = (today + Duration::days(offset)).format("%Y-%m-%d").to_string();
                    let day = EventDay {
                        city_key: city.city_key.clone(),
                        date: date.clone(),
                        events: by_date.remove(&date).unwrap_or_default(),
                        fetched_at: fetched_at.clone(),
                        ttl,
                    };
                    ops.push(WriteOp::Put((city.city_key.clone(), date), day));
                }
            }
            Err(e) => {
                failed_cities += 1;
                tracing::warn!("event fetch failed for {}: {e}", city.city_key);
            }
        }
    }

    let records_written = ops.len();
    let view = EventBatchView {
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
    use crate::route_store::test_fixtures;
    use crate::secrets::StaticSecretResolver;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn active_city_store() -> RouteStore {
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

    fn page_body(events: Vec<serde_json::Value>) -> serde_json::Value {
        serde_json::json!({
            "_embedded": { "events": events },
            "page": { "size": 200, "totalElements": 0, "totalPages": 1, "number": 0 }
        })
    }

    fn provider_event(name: &str, local_date: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "url": "https://example.com/e",
            "dates": { "start": { "localDate": local_date, "localTime": "18:00:00" } },
            "_embedded": { "venues": [
                { "name": "Arena", "location": { "latitude": "53.3674", "longitude": "-6.2591" } }
            ]}
        })
    }

    #[tokio::test]
    async fn test_scrape_buckets_events_by_local_date() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(vec![
                provider_event("concert", "2026-08-03"),
                provider_event("match", "2026-08-03"),
                provider_event("parade", "2026-08-05"),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let routes = active_city_store();
        let delays = DelayStore::open_in_memory();
        let client = EventClient::new(
            &server.uri(),
            std::sync::Arc::new(StaticSecretResolver("k".into())),
        );
        let now: DateTime<Utc> = "2026-08-01T23:00:00Z".parse().unwrap();

        let report = run_event_scrape(&routes, &delays, &client, now).await.unwrap();
        assert_eq!(report.records_written, 7);

        let busy = delays
            .get_event_day("IE#DUBLIN", "2026-08-03", now.timestamp())
            .unwrap()
            .unwrap();
        assert_eq!(busy.events.len(), 2);
        let quiet = delays
            .get_event_day("IE#DUBLIN", "2026-08-04", now.timestamp())
            .unwrap()
            .unwrap();
        assert!(quiet.events.is_empty(), "scraped-but-empty days still get a record");
    }

    #[tokio::test]
    async fn test_provider_failure_is_isolated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let routes = active_city_store();
        let delays = DelayStore::open_in_memory();
        let client = EventClient::new(
            &server.uri(),
            std::sync::Arc::new(StaticSecretResolver("k".into())),
        );
        let report = run_event_scrape(&routes, &delays, &client, Utc::now()).await.unwrap();
        assert_eq!(report.failed_cities, 1);
        assert_eq!(report.records_written, 0);
    }
}
