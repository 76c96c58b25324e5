use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};

use crate::AppState;
use crate::auth::UserId;
use crate::models::route::*;
use crate::route_store::{CityUpsert, LifecycleError};
use crate::timemath::iso_utc;
use crate::validate;

/// Schedules expire two weeks after their last create/update.
const SCHEDULE_TTL_DAYS: i64 = 14;
/// Delete marks the schedule for expiry a day out.
const DELETE_MARKER_TTL_HOURS: i64 = 24;

fn lifecycle_status(e: LifecycleError) -> (StatusCode, String) {
    match e {
        LifecycleError::NotFound => (StatusCode::NOT_FOUND, "route not found".to_string()),
        LifecycleError::RouteCapExceeded => (StatusCode::BAD_REQUEST, e.to_string()),
        LifecycleError::CityCounterDrift | LifecycleError::Store(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn create_route(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(req): Json<CreateRouteRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let validated = validate::validate_create(&req).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let now = Utc::now();
    let now_str = iso_utc(now);
    let route_id = uuid::Uuid::new_v4().to_string();
    let (origin_lat, origin_lng) = req.origin.coords();

    let route = Route {
        route_id: route_id.clone(),
        title: req.title.clone(),
        origin: req.origin.clone(),
        destination: req.destination.clone(),
        intermediates: req.intermediates.clone(),
        travel_mode: req.travel_mode.clone(),
        static_duration_mins: validated.static_duration_mins,
        traffic_duration_mins: validated.traffic_duration_mins,
        distance_meters: req.distance_meters,
        city_key: validated.city_key.clone(),
        city_lat: origin_lat,
        city_lng: origin_lng,
        user_active: true,
        geometry: req.geometry.clone(),
        created_at: now_str.clone(),
        updated_at: now_str.clone(),
    };
    let schedule = Schedule {
        route_id: route_id.clone(),
        arrive_by: req.arrive_by.clone(),
        timezone: req.timezone.clone(),
        days_of_week: req.days_of_week.clone(),
        ttl: (now + Duration::days(SCHEDULE_TTL_DAYS)).timestamp(),
        active: true,
        created_at: now_str.clone(),
        updated_at: now_str.clone(),
    };
    let city = CityUpsert {
        city_key: validated.city_key,
        city: req.city.clone(),
        country_code: req.country_code.to_uppercase(),
        city_lat: origin_lat,
        city_lng: origin_lng,
    };

    state
        .routes
        .create_route(&user_id, &route, &schedule, &city, &now_str)
        .map_err(lifecycle_status)?;

    // Full shape back so the client renders without re-fetching.
    let status = forecast_status(Some(&schedule), None).to_string();
    Ok((
        StatusCode::CREATED,
        Json(RouteWithSchedule {
            route,
            schedule: Some(schedule),
            forecast: None,
            forecast_status: status,
        }),
    ))
}

/// Names of the fields an update applied, echoed back to the client.
fn updated_field_names(req: &UpdateRouteRequest) -> Vec<&'static str> {
    let mut names = Vec::new();
    let mut add = |present: bool, name: &'static str| {
        if present {
            names.push(name);
        }
    };
    add(req.title.is_some(), "title");
    add(req.origin.is_some(), "origin");
    add(req.destination.is_some(), "destination");
    add(req.intermediates.is_some(), "intermediates");
    add(req.travel_mode.is_some(), "travelMode");
    add(req.static_duration.is_some(), "staticDuration");
    add(req.traffic_duration.is_some(), "trafficDuration");
    add(req.distance_meters.is_some(), "distanceMeters");
    add(req.geometry.is_some(), "geometry");
    add(req.user_active.is_some(), "userActive");
    add(req.arrive_by.is_some(), "arriveBy");
    add(req.timezone.is_some(), "timezone");
    add(req.days_of_week.is_some(), "daysOfWeek");
    names
}

pub async fn update_route(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(req): Json<UpdateRouteRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (route_updates, schedule_updates) =
        validate::validate_update(&req).map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    let now = Utc::now();
    let schedule_ttl = (now + Duration::days(SCHEDULE_TTL_DAYS)).timestamp();
    state
        .routes
        .update_route(
            &user_id,
            &req.route_id,
            &route_updates,
            &schedule_updates,
            schedule_ttl,
            &iso_utc(now),
        )
        .map_err(lifecycle_status)?;

    // A stale forecast is worse than none: drop it whenever a
    // forecast-affecting route field or any schedule field changed.
    if route_updates.affects_forecast() || !schedule_updates.is_empty() {
        if let Err(e) = state.routes.delete_forecast(&user_id, &req.route_id) {
            tracing::warn!("forecast invalidation failed for {}/{}: {e}", user_id, req.route_id);
        }
    }

    Ok(Json(serde_json::json!({
        "routeId": req.route_id,
        "updates": updated_field_names(&req),
    })))
}

pub async fn delete_route(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(req): Json<DeleteRouteRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let route = state
        .routes
        .get_route(&user_id, &req.route_id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "route not found".to_string()))?;

    let now = Utc::now();
    let marker_ttl = (now + Duration::hours(DELETE_MARKER_TTL_HOURS)).timestamp();
    state
        .routes
        .deactivate_schedule(&user_id, &req.route_id, marker_ttl)
        .map_err(internal)?;

    match state
        .routes
        .delete_route(&user_id, &req.route_id, &route.city_key, &iso_utc(now))
    {
        Ok(()) => {}
        Err(LifecycleError::CityCounterDrift) => {
            tracing::warn!(
                "city counter for {} already at zero while deleting {}/{}, compensating",
                route.city_key,
                user_id,
                req.route_id,
            );
            state
                .routes
                .delete_route_compensating(&user_id, &req.route_id)
                .map_err(internal)?;
        }
        Err(e) => return Err(lifecycle_status(e)),
    }

    if let Err(e) = state.routes.delete_forecast(&user_id, &req.route_id) {
        tracing::warn!("forecast cleanup failed for {}/{}: {e}", user_id, req.route_id);
    }

    Ok(Json(serde_json::json!({ "routeId": req.route_id })))
}

pub async fn fetch_routes(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let profile = state.routes.get_profile(&user_id).map_err(internal)?;
    let routes = state.routes.list_routes(&user_id).map_err(internal)?;
    let schedules = state.routes.list_schedules(&user_id).map_err(internal)?;
    let forecasts = state.routes.list_forecasts(&user_id).map_err(internal)?;

    let active_route_count = schedules
        .iter()
        .filter(|s| s.active && !s.days_of_week.is_empty())
        .count();

    let with_schedules: Vec<RouteWithSchedule> = routes
        .into_iter()
        .map(|route| {
            let schedule = schedules.iter().find(|s| s.route_id == route.route_id).cloned();
            let forecast = forecasts.iter().find(|f| f.route_id == route.route_id).cloned();
            let status = forecast_status(schedule.as_ref(), forecast.as_ref()).to_string();
            RouteWithSchedule {
                route,
                schedule,
                forecast,
                forecast_status: status,
            }
        })
        .collect();

    let route_count = profile.as_ref().map(|p| p.route_count).unwrap_or(0);
    Ok(Json(serde_json::json!({
        "userId": user_id,
        "profile": profile,
        "routeCount": route_count,
        "activeRouteCount": active_route_count,
        "maxRoutes": MAX_ROUTES_PER_USER,
        "routes": with_schedules,
    })))
}
