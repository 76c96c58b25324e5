use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HourlyPrecip {
    /// UTC hour of day, 0..=23.
    pub hour: u32,
    pub precipitation_mm: f64,
}

/// One city-day of hourly precipitation, sliced from the provider's 8-day
/// UTC payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherDay {
    pub city_key: String,
    /// `YYYY-MM-DD` (UTC).
    pub date: String,
    pub hourly: Vec<HourlyPrecip>,
    pub fetched_at: String,
    pub ttl: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub name: String,
    pub venue: String,
    pub lat: f64,
    pub lng: f64,
    /// Local wall-clock "HH:MM" on the record's date.
    pub start_time: String,
    pub url: String,
}

/// One city-day of nearby public events, bucketed by local start date.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDay {
    pub city_key: String,
    pub date: String,
    pub events: Vec<EventRecord>,
    pub fetched_at: String,
    pub ttl: i64,
}
