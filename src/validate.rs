//! Request validation for the route lifecycle. Everything here rejects at
//! the API boundary with a specific reason; nothing invalid reaches the
//! store.

use std::sync::OnceLock;

use regex::Regex;

use crate::models::route::{
    CreateRouteRequest, TRAVEL_MODES, UpdateRouteRequest, Waypoint,
};
use crate::route_store::{RouteFieldUpdates, ScheduleFieldUpdates};
use crate::timemath::{DAY_NAMES, parse_hhmm};
use crate::util::parse_duration_mins;

pub const MAX_TITLE_LEN: usize = 48;

fn timezone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Region/City pairs, nested ids, and bare zones like "UTC".
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]+(/[A-Za-z0-9_+\-]+)*$").unwrap())
}

/// Normalised city shard key: `"<CC>#<CITY>"`, country upper-cased, city
/// upper-snake-cased.
pub fn normalize_city_key(country_code: &str, city: &str) -> String {
    let cc = country_code.trim().to_uppercase();
    let city_part: String = city
        .trim()
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    format!("{cc}#{city_part}")
}

pub fn validate_title(title: &str) -> Result<(), String> {
    if title.trim().is_empty() {
        return Err("title must not be empty".to_string());
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(format!("title must be at most {MAX_TITLE_LEN} characters"));
    }
    Ok(())
}

pub fn validate_waypoint(field: &str, waypoint: &Waypoint) -> Result<(), String> {
    let (lat, lng) = waypoint.coords();
    if !(-90.0..=90.0).contains(&lat) || !lat.is_finite() {
        return Err(format!("{field}: latitude {lat} out of range"));
    }
    if !(-180.0..=180.0).contains(&lng) || !lng.is_finite() {
        return Err(format!("{field}: longitude {lng} out of range"));
    }
    if waypoint.label.trim().is_empty() {
        return Err(format!("{field}: label must not be empty"));
    }
    Ok(())
}

pub fn validate_travel_mode(mode: &str) -> Result<(), String> {
    if TRAVEL_MODES.contains(&mode) {
        Ok(())
    } else {
        Err(format!("invalid travelMode: {mode}"))
    }
}

pub fn validate_days_of_week(days: &[String]) -> Result<(), String> {
    for day in days {
        if !DAY_NAMES.contains(&day.as_str()) {
            return Err(format!("invalid day of week: {day}"));
        }
    }
    Ok(())
}

pub fn validate_arrive_by(arrive_by: &str) -> Result<(), String> {
    parse_hhmm(arrive_by)
        .map(|_| ())
        .ok_or_else(|| format!("arriveBy must be HH:MM, got {arrive_by:?}"))
}

pub fn validate_timezone(timezone: &str) -> Result<(), String> {
    if timezone_re().is_match(timezone) {
        Ok(())
    } else {
        Err(format!("timezone must be an IANA identifier, got {timezone:?}"))
    }
}

/// A create request with durations parsed and the city key normalised.
#[derive(Debug)]
pub struct ValidatedCreate {
    pub city_key: String,
    pub static_duration_mins: i64,
    pub traffic_duration_mins: Option<i64>,
}

pub fn validate_create(req: &CreateRouteRequest) -> Result<ValidatedCreate, String> {
    validate_title(&req.title)?;
    validate_waypoint("origin", &req.origin)?;
    validate_waypoint("destination", &req.destination)?;
    for (i, waypoint) in req.intermediates.iter().enumerate() {
        validate_waypoint(&format!("intermediates[{i}]"), waypoint)?;
    }
    validate_travel_mode(&req.travel_mode)?;
    validate_days_of_week(&req.days_of_week)?;
    validate_arrive_by(&req.arrive_by)?;
    validate_timezone(&req.timezone)?;

    if req.city.trim().is_empty() {
        return Err("city must not be empty".to_string());
    }
    let cc = req.country_code.trim();
    if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("countryCode must be two letters, got {cc:?}"));
    }

    let static_duration_mins =
        parse_duration_mins(&req.static_duration).map_err(|e| e.to_string())?;
    let traffic_duration_mins = match &req.traffic_duration {
        Some(raw) => Some(parse_duration_mins(raw).map_err(|e| e.to_string())?),
        None => None,
    };

    Ok(ValidatedCreate {
        city_key: normalize_city_key(&req.country_code, &req.city),
        static_duration_mins,
        traffic_duration_mins,
    })
}

/// Partition an update request into the route and schedule field sets,
/// re-validating each provided field. Rejects a request carrying neither.
pub fn validate_update(
    req: &UpdateRouteRequest,
) -> Result<(RouteFieldUpdates, ScheduleFieldUpdates), String> {
    if let Some(ref title) = req.title {
        validate_title(title)?;
    }
    if let Some(ref origin) = req.origin {
        validate_waypoint("origin", origin)?;
    }
    if let Some(ref destination) = req.destination {
        validate_waypoint("destination", destination)?;
    }
    if let Some(ref intermediates) = req.intermediates {
        for (i, waypoint) in intermediates.iter().enumerate() {
            validate_waypoint(&format!("intermediates[{i}]"), waypoint)?;
        }
    }
    if let Some(ref mode) = req.travel_mode {
        validate_travel_mode(mode)?;
    }
    if let Some(ref arrive_by) = req.arrive_by {
        validate_arrive_by(arrive_by)?;
    }
    if let Some(ref timezone) = req.timezone {
        validate_timezone(timezone)?;
    }
    if let Some(ref days) = req.days_of_week {
        validate_days_of_week(days)?;
    }

    let static_duration_mins = match &req.static_duration {
        Some(raw) => Some(parse_duration_mins(raw).map_err(|e| e.to_string())?),
        None => None,
    };
    let traffic_duration_mins = match &req.traffic_duration {
        Some(raw) => Some(parse_duration_mins(raw).map_err(|e| e.to_string())?),
        None => None,
    };

    let route_updates = RouteFieldUpdates {
        title: req.title.clone(),
        origin: req.origin.clone(),
        destination: req.destination.clone(),
        intermediates: req.intermediates.clone(),
        travel_mode: req.travel_mode.clone(),
        static_duration_mins,
        traffic_duration_mins,
        distance_meters: req.distance_meters,
        geometry: req.geometry.clone(),
        user_active: req.user_active,
    };
    let schedule_updates = ScheduleFieldUpdates {
        arrive_by: req.arrive_by.clone(),
        timezone: req.timezone.clone(),
        days_of_week: req.days_of_week.clone(),
    };

    if route_updates.is_empty() && schedule_updates.is_empty() {
        return Err("update carries no recognised fields".to_string());
    }
    Ok((route_updates, schedule_updates))
}
