use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `commute.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CommuteConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_weather_url")]
    pub weather_url: String,
    #[serde(default = "default_events_url")]
    pub events_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            weather_url: default_weather_url(),
            events_url: default_events_url(),
        }
    }
}

fn default_weather_url() -> String {
    "https://api.open-meteo.com/v1".to_string()
}

fn default_events_url() -> String {
    "https://app.ticketmaster.com/discovery/v2".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// UTC hour both scrapers fire.
    #[serde(default = "default_scraper_hour")]
    pub scraper_hour_utc: u32,
    /// UTC hour the orchestrator fires.
    #[serde(default)]
    pub orchestrator_hour_utc: u32,
    /// Routes per queue message.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Schedule-scan page size.
    #[serde(default = "default_scan_page")]
    pub scan_page_size: usize,
    /// Lock age past which a previous run counts as crashed.
    #[serde(default = "default_lock_staleness")]
    pub lock_staleness_mins: i64,
    /// Concurrent queue consumers.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scraper_hour_utc: default_scraper_hour(),
            orchestrator_hour_utc: 0,
            chunk_size: default_chunk_size(),
            scan_page_size: default_scan_page(),
            lock_staleness_mins: default_lock_staleness(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

fn default_scraper_hour() -> u32 {
    23
}

fn default_chunk_size() -> usize {
    1000
}

fn default_scan_page() -> usize {
    500
}

fn default_lock_staleness() -> i64 {
    60
}

fn default_worker_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_visibility")]
    pub visibility_secs: i64,
    #[serde(default = "default_max_receives")]
    pub max_receive_count: i64,
    /// Consumer sleep when the queue is empty.
    #[serde(default = "default_poll_idle")]
    pub poll_idle_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_secs: default_visibility(),
            max_receive_count: default_max_receives(),
            poll_idle_secs: default_poll_idle(),
        }
    }
}

fn default_visibility() -> i64 {
    300
}

fn default_max_receives() -> i64 {
    3
}

fn default_poll_idle() -> u64 {
    5
}

impl CommuteConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: CommuteConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
