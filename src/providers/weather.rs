//! Weather provider client: one GET per coordinate pair covering 8 days of
//! hourly precipitation in UTC. A failed fetch is non-fatal upstream; the
//! city simply contributes no weather data that night.

use std::time::Duration;

use serde::Deserialize;

use crate::models::delay::HourlyPrecip;

const HTTP_TIMEOUT_SECS: u64 = 10;
const FORECAST_DAYS: u32 = 8;

#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: reqwest::Client,
    base_url: String,
}

/// The provider's hourly block: parallel arrays of UTC timestamps
/// (`YYYY-MM-DDTHH:MM`) and millimetres of precipitation.
#[derive(Debug, Clone, Deserialize)]
pub struct HourlyForecast {
    pub time: Vec<String>,
    pub precipitation: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    hourly: HourlyForecast,
}

impl HourlyForecast {
    /// Slice the 24 hours of one UTC date out of the 8-day payload. Hours
    /// the provider omitted read as 0 mm.
    pub fn day_slice(&self, date: &str) -> Vec<HourlyPrecip> {
        let mut hours = vec![0.0f64; 24];
        for (ts, precip) in self.time.iter().zip(self.precipitation.iter()) {
            let Some(rest) = ts.strip_prefix(date) else {
                continue;
            };
            let Some(hour) = rest
                .strip_prefix('T')
                .and_then(|t| t.get(0..2))
                .and_then(|h| h.parse::<usize>().ok())
            else {
                continue;
            };
            if hour < 24 {
                hours[hour] = precip.unwrap_or(0.0);
            }
        }
        hours
            .into_iter()
            .enumerate()
            .map(|(hour, precipitation_mm)| HourlyPrecip {
                hour: hour as u32,
                precipitation_mm,
            })
            .collect()
    }
}

impl WeatherClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch_hourly(&self, lat: f64, lng: f64) -> anyhow::Result<HourlyForecast> {
        let url = format!("{}/forecast", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("latitude", format!("{lat:.4}")),
                ("longitude", format!("{lng:.4}")),
                ("hourly", "precipitation".to_string()),
                ("timezone", "UTC".to_string()),
                ("forecast_days", FORECAST_DAYS.to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("weather provider returned HTTP {}", response.status());
        }
        let parsed: ForecastResponse = response.json().await?;
        anyhow::ensure!(
            parsed.hourly.time.len() == parsed.hourly.precipitation.len(),
            "weather provider returned misaligned hourly arrays"
        );
        Ok(parsed.hourly)
    }
}
