use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Allowed travel modes for a route.
pub const TRAVEL_MODES: [&str; 5] = ["DRIVE", "TRANSIT", "WALK", "TWO_WHEELER", "BICYCLE"];

/// Upper bound on routes per user, enforced transactionally on create.
pub const MAX_ROUTES_PER_USER: i64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaypointLocation {
    pub lat_lng: LatLng,
}

/// A pre-resolved place: the geocoding collaborator hands these in whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub location: WaypointLocation,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_id: Option<String>,
}

impl Waypoint {
    pub fn coords(&self) -> (f64, f64) {
        (
            self.location.lat_lng.latitude,
            self.location.lat_lng.longitude,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub email: String,
    pub route_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub route_id: String,
    pub title: String,
    pub origin: Waypoint,
    pub destination: Waypoint,
    #[serde(default)]
    pub intermediates: Vec<Waypoint>,
    pub travel_mode: String,
    /// Baseline journey time in minutes; the single source of truth for
    /// departure arithmetic.
    pub static_duration_mins: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_duration_mins: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<i64>,
    pub city_key: String,
    pub city_lat: f64,
    pub city_lng: f64,
    pub user_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub route_id: String,
    /// Local wall-clock "HH:MM"; `timezone` is the canonical tiebreaker.
    pub arrive_by: String,
    pub timezone: String,
    pub days_of_week: Vec<String>,
    pub ttl: i64,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// ISO-8601 UTC instant with whole-second precision.
    pub adjusted_depart_by: String,
    pub extra_buffer_mins: i64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayForecast {
    pub forecast_date: String,
    pub recommendation: Recommendation,
    pub has_weather_data: bool,
    pub has_event_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub route_id: String,
    /// Keyed by day name; always a subset of the schedule's daysOfWeek.
    pub days: HashMap<String, DayForecast>,
    pub generated_at: String,
}

// ── Request shapes ──

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRouteRequest {
    pub title: String,
    pub origin: Waypoint,
    pub destination: Waypoint,
    #[serde(default)]
    pub intermediates: Vec<Waypoint>,
    pub travel_mode: String,
    /// `"<n>s"` or integer seconds; rounded up to minutes on ingest.
    pub static_duration: String,
    pub traffic_duration: Option<String>,
    pub distance_meters: Option<i64>,
    pub geometry: Option<String>,
    pub city: String,
    pub country_code: String,
    pub arrive_by: String,
    pub timezone: String,
    #[serde(default)]
    pub days_of_week: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRouteRequest {
    pub route_id: String,
    pub title: Option<String>,
    pub origin: Option<Waypoint>,
    pub destination: Option<Waypoint>,
    pub intermediates: Option<Vec<Waypoint>>,
    pub travel_mode: Option<String>,
    pub static_duration: Option<String>,
    pub traffic_duration: Option<String>,
    pub distance_meters: Option<i64>,
    pub geometry: Option<String>,
    pub user_active: Option<bool>,
    pub arrive_by: Option<String>,
    pub timezone: Option<String>,
    pub days_of_week: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRouteRequest {
    pub route_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmUserRequest {
    pub user_id: String,
    pub email: String,
}

// ── Response shapes ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteWithSchedule {
    #[serde(flatten)]
    pub route: Route,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
    pub forecast_status: String,
}

/// `active` iff a forecast exists; `pending` iff the schedule selects at
/// least one day but no forecast has been produced yet; `empty` otherwise.
pub fn forecast_status(schedule: Option<&Schedule>, forecast: Option<&Forecast>) -> &'static str {
    if forecast.is_some() {
        "active"
    } else if schedule.is_some_and(|s| !s.days_of_week.is_empty()) {
        "pending"
    } else {
        "empty"
    }
}
