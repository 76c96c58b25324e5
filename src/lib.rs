pub mod auth;
pub mod batch;
pub mod config;
pub mod delay_store;
pub mod event_scraper;
pub mod forecast_worker;
pub mod geo;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod params;
pub mod providers;
pub mod queue;
pub mod recommend;
pub mod route_store;
pub mod secrets;
pub mod timemath;
pub mod util;
pub mod validate;
pub mod weather_scraper;

use std::sync::Arc;

use queue::JobQueue;
use route_store::RouteStore;

#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<RouteStore>,
    pub queue: Arc<JobQueue>,
}
