use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::delete, routing::get, routing::post, routing::put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use commute_api::config::CommuteConfig;
use commute_api::delay_store::DelayStore;
use commute_api::params::ParamStore;
use commute_api::providers::events::EventClient;
use commute_api::providers::weather::WeatherClient;
use commute_api::queue::JobQueue;
use commute_api::route_store::RouteStore;
use commute_api::secrets::EnvSecretResolver;
use commute_api::{AppState, event_scraper, forecast_worker, handlers, orchestrator, weather_scraper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("commute_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("COMMUTE_CONFIG").unwrap_or_else(|_| "./commute.toml".to_string());
    let config = CommuteConfig::load(&config_path)?;

    let core_db_path =
        std::env::var("COMMUTE_CORE_DB").unwrap_or_else(|_| "./commute_core.db".to_string());
    let delay_db_path =
        std::env::var("COMMUTE_DELAY_DB").unwrap_or_else(|_| "./commute_delay.db".to_string());
    let queue_db_path =
        std::env::var("COMMUTE_QUEUE_DB").unwrap_or_else(|_| "./commute_queue.db".to_string());
    let param_db_path =
        std::env::var("COMMUTE_PARAM_DB").unwrap_or_else(|_| "./commute_params.db".to_string());

    let routes = Arc::new(RouteStore::open(&core_db_path)?);
    tracing::info!("core store opened at {core_db_path}");
    let delays = Arc::new(DelayStore::open(&delay_db_path)?);
    let queue = Arc::new(JobQueue::open(&queue_db_path)?);
    let params = Arc::new(ParamStore::open(&param_db_path)?);

    let weather_client = WeatherClient::new(&config.providers.weather_url);
    let event_client = Arc::new(EventClient::new(
        &config.providers.events_url,
        Arc::new(EnvSecretResolver),
    ));

    // Nightly pipeline: scrapers at 23:00, orchestrator at 00:00, and the
    // worker pool consuming continuously.
    weather_scraper::spawn_weather_scraper(
        routes.clone(),
        delays.clone(),
        weather_client,
        config.pipeline.scraper_hour_utc,
    );
    event_scraper::spawn_event_scraper(
        routes.clone(),
        delays.clone(),
        event_client,
        config.pipeline.scraper_hour_utc,
    );
    orchestrator::spawn_orchestrator(
        routes.clone(),
        queue.clone(),
        params.clone(),
        config.pipeline.clone(),
    );
    forecast_worker::spawn_forecast_workers(
        queue.clone(),
        routes.clone(),
        delays.clone(),
        config.queue.clone(),
        config.pipeline.worker_concurrency,
    );

    let state = AppState {
        routes,
        queue,
    };

    let app = Router::new()
        // Route lifecycle
        .route("/api/v1/routes/create", post(handlers::routes::create_route))
        .route("/api/v1/routes/update", put(handlers::routes::update_route))
        .route("/api/v1/routes/delete", delete(handlers::routes::delete_route))
        .route("/api/v1/routes/fetch", get(handlers::routes::fetch_routes))
        // Identity-provider hook
        .route("/api/v1/hooks/confirm-user", post(handlers::hooks::confirm_user))
        // Operations
        .route("/api/v1/pipeline/stats", get(handlers::stats::pipeline_stats))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port: u16 = std::env::var("COMMUTE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("commute-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
