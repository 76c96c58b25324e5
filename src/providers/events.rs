//! Event provider client: paginated, geo-bounded discovery search. Page 0
//! reveals `totalPages`; remaining pages are fetched concurrently, capped at
//! five (the provider stops serving past ~1000 results and rate-limits at
//! about 5 req/s). The API key comes from the secret resolver, once per
//! process.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::secrets::{EVENTS_API_KEY, SecretResolver};

const HTTP_TIMEOUT_SECS: u64 = 10;
const PAGE_SIZE: u32 = 200;
pub const PAGE_CAP: usize = 5;
pub const SEARCH_RADIUS_KM: u32 = 25;

pub struct EventClient {
    client: reqwest::Client,
    base_url: String,
    secrets: Arc<dyn SecretResolver>,
    api_key: OnceCell<String>,
}

/// One event as extracted from the provider, before day-bucketing.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEvent {
    pub name: String,
    pub venue: String,
    pub lat: f64,
    pub lng: f64,
    /// Local calendar date (`YYYY-MM-DD`) at the venue.
    pub local_date: String,
    /// Local wall-clock `"HH:MM"`; midnight when the provider omits it.
    pub start_time: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedEvents>,
    page: PageInfo,
}

#[derive(Debug, Deserialize)]
struct EmbeddedEvents {
    events: Vec<ProviderEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ProviderEvent {
    name: Option<String>,
    url: Option<String>,
    dates: Option<EventDates>,
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedVenues>,
}

#[derive(Debug, Deserialize)]
struct EventDates {
    start: Option<EventStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventStart {
    local_date: Option<String>,
    local_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddedVenues {
    venues: Vec<ProviderVenue>,
}

#[derive(Debug, Deserialize)]
struct ProviderVenue {
    name: Option<String>,
    location: Option<VenueLocation>,
}

/// Venue coordinates arrive as strings; anything non-finite is dropped.
#[derive(Debug, Deserialize)]
struct VenueLocation {
    latitude: Option<String>,
    longitude: Option<String>,
}

fn extract_event(raw: ProviderEvent) -> Option<FetchedEvent> {
    let name = raw.name?;
    let start = raw.dates.and_then(|d| d.start)?;
    let local_date = start.local_date?;
    let start_time = start
        .local_time
        .as_deref()
        .and_then(|t| t.get(0..5))
        .unwrap_or("00:00")
        .to_string();

    let venue = raw.embedded.and_then(|e| e.venues.into_iter().next())?;
    let location = venue.location?;
    let lat: f64 = location.latitude?.parse().ok()?;
    let lng: f64 = location.longitude?.parse().ok()?;
    if !lat.is_finite() || !lng.is_finite() {
        return None;
    }

    Some(FetchedEvent {
        name,
        venue: venue.name.unwrap_or_default(),
        lat,
        lng,
        local_date,
        start_time,
        url: raw.url.unwrap_or_default(),
    })
}

impl EventClient {
    pub fn new(base_url: &str, secrets: Arc<dyn SecretResolver>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secrets,
            api_key: OnceCell::new(),
        }
    }

    async fn api_key(&self) -> anyhow::Result<&str> {
        let key = self
            .api_key
            .get_or_try_init(|| self.secrets.resolve(EVENTS_API_KEY))
            .await?;
        Ok(key.as_str())
    }

    async fn fetch_page(
        &self,
        lat: f64,
        lng: f64,
        start: &str,
        end: &str,
        page: usize,
    ) -> anyhow::Result<SearchResponse> {
        let url = format!("{}/events.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("apikey", self.api_key().await?.to_string()),
                ("latlong", format!("{lat},{lng}")),
                ("radius", SEARCH_RADIUS_KM.to_string()),
                ("unit", "km".to_string()),
                ("startDateTime", start.to_string()),
                ("endDateTime", end.to_string()),
                ("size", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
                ("sort", "date,asc".to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("event provider returned HTTP {}", response.status());
        }
        Ok(response.json().await?)
    }

    /// All events near a coordinate within `[start, end]`. Later pages that
    /// fail are logged and skipped; the first page decides the page count.
    pub async fn fetch_events(
        &self,
        lat: f64,
        lng: f64,
        start: &str,
        end: &str,
    ) -> anyhow::Result<Vec<FetchedEvent>> {
        let first = self.fetch_page(lat, lng, start, end, 0).await?;
        let total_pages = (first.page.total_pages as usize).min(PAGE_CAP);

        let mut events: Vec<FetchedEvent> = first
            .embedded
            .map(|e| e.events.into_iter().filter_map(extract_event).collect())
            .unwrap_or_default();

        let rest = join_all(
            (1..total_pages).map(|page| self.fetch_page(lat, lng, start, end, page)),
        )
        .await;
        for (offset, outcome) in rest.into_iter().enumerate() {
            match outcome {
                Ok(response) => {
                    if let Some(embedded) = response.embedded {
                        events.extend(embedded.events.into_iter().filter_map(extract_event));
                    }
                }
                Err(e) => {
                    tracing::warn!("event page {} failed, skipping: {e}", offset + 1);
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::StaticSecretResolver;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_event(name: &str, lat: &str, lng: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "url": format!("https://example.com/{name}"),
            "dates": { "start": { "localDate": "2026-08-03", "localTime": "18:00:00" } },
            "_embedded": { "venues": [
                { "name": "Arena", "location": { "latitude": lat, "longitude": lng } }
            ]}
        })
    }

    fn page_body(events: Vec<serde_json::Value>, total_pages: u32) -> serde_json::Value {
        serde_json::json!({
            "_embedded": { "events": events },
            "page": { "size": 200, "totalElements": 0, "totalPages": total_pages, "number": 0 }
        })
    }

    fn client(server: &MockServer) -> EventClient {
        EventClient::new(
            &server.uri(),
            Arc::new(StaticSecretResolver("test-key".into())),
        )
    }

    #[tokio::test]
    async fn test_single_page_fetch_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .and(query_param("apikey", "test-key"))
            .and(query_param("radius", "25"))
            .and(query_param("unit", "km"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                vec![provider_event("concert", "53.3674", "-6.2591")],
                1,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let events = client(&server)
            .fetch_events(53.3498, -6.2603, "2026-08-02T00:00:00Z", "2026-08-08T23:59:59Z")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "concert");
        assert_eq!(events[0].start_time, "18:00");
        assert_eq!(events[0].local_date, "2026-08-03");
    }

    #[tokio::test]
    async fn test_pagination_fetches_remaining_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .and(query_param("page", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                vec![provider_event("first", "53.36", "-6.25")],
                2,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                vec![provider_event("second", "53.37", "-6.26")],
                2,
            )))
            .expect(1)
            .mount(&server)
            .await;

        let events = client(&server)
            .fetch_events(53.3498, -6.2603, "s", "e")
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_page_count_capped_at_five() {
        let server = MockServer::start().await;
        for page in 0..PAGE_CAP {
            Mock::given(method("GET"))
                .and(path("/events.json"))
                .and(query_param("page", page.to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                    vec![provider_event(&format!("e{page}"), "53.36", "-6.25")],
                    40,
                )))
                .expect(1)
                .mount(&server)
                .await;
        }
        // Pages 5.. must never be requested; no mock is mounted for them and
        // an unexpected request would 404 and surface in the count below.

        let events = client(&server)
            .fetch_events(53.3498, -6.2603, "s", "e")
            .await
            .unwrap();
        assert_eq!(events.len(), PAGE_CAP);
    }

    #[tokio::test]
    async fn test_drops_events_with_bad_coordinates() {
        let server = MockServer::start().await;
        let mut bad = provider_event("no-coords", "53.36", "-6.25");
        bad["_embedded"]["venues"][0]["location"] = serde_json::json!(null);
        let unparseable = provider_event("nan", "not-a-number", "-6.25");
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
                vec![provider_event("good", "53.36", "-6.25"), bad, unparseable],
                1,
            )))
            .mount(&server)
            .await;

        let events = client(&server)
            .fetch_events(53.3498, -6.2603, "s", "e")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "good");
    }

    #[tokio::test]
    async fn test_failed_first_page_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events.json"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        assert!(client(&server).fetch_events(53.0, -6.0, "s", "e").await.is_err());
    }
}
