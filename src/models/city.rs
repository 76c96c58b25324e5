use serde::{Deserialize, Serialize};

/// Per-city index entry driving scraper selection. A city is *active* while
/// `active_route_count > 0`; the lifecycle transactions keep the counter in
/// step with the routes pointing at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityRecord {
    pub city_key: String,
    pub city: String,
    pub country_code: String,
    pub city_lat: f64,
    pub city_lng: f64,
    pub active_route_count: i64,
    pub first_registered_at: String,
    pub last_active_at: String,
}
