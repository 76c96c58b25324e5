//! Deterministic recommendation rules. This function is the single swap
//! point for alternative engines; the worker depends only on its signature.

use chrono::{Duration, NaiveDate};

use crate::models::delay::{EventRecord, HourlyPrecip};
use crate::models::route::Recommendation;
use crate::timemath::{iso_utc, parse_hhmm};

/// Commute-window precipitation above this adds the rain buffer.
pub const RAIN_THRESHOLD_MM: f64 = 0.5;
pub const RAIN_BUFFER_MINS: i64 = 10;
/// Each corridor event adds this.
pub const EVENT_BUFFER_MINS: i64 = 30;

const RAIN_REASON: &str = "Rain expected during your commute window - allow extra time";

#[derive(Debug)]
pub struct RecommendationInput<'a> {
    /// Hourly precipitation for the forecast date (UTC hours); empty when no
    /// weather data was scraped.
    pub hourly: &'a [HourlyPrecip],
    /// Events already filtered to the commute window and corridor.
    pub corridor_events: &'a [EventRecord],
    /// Arrival deadline as UTC `"HH:MM"`.
    pub arrive_by_utc: &'a str,
    pub static_duration_mins: Option<i64>,
    pub forecast_date: NaiveDate,
}

/// Apply the phase-1 rules. A missing static duration is a hard error: there
/// is no departure arithmetic without it.
pub fn recommend(input: &RecommendationInput) -> anyhow::Result<Recommendation> {
    let static_mins = input
        .static_duration_mins
        .ok_or_else(|| anyhow::anyhow!("route has no static duration"))?;
    let (hour, min) = parse_hhmm(input.arrive_by_utc)
        .ok_or_else(|| anyhow::anyhow!("invalid arrival time {:?}", input.arrive_by_utc))?;
    let arrive_mins = (hour * 60 + min) as i64;
    let arrive_hour = arrive_mins / 60;
    let depart_hour = (arrive_mins - static_mins).div_euclid(60);

    let window_precip: f64 = input
        .hourly
        .iter()
        .filter(|p| (p.hour as i64) >= depart_hour && (p.hour as i64) <= arrive_hour)
        .map(|p| p.precipitation_mm)
        .sum();

    let mut extra_buffer_mins = 0i64;
    let mut reasons: Vec<String> = Vec::new();

    if window_precip > RAIN_THRESHOLD_MM {
        extra_buffer_mins += RAIN_BUFFER_MINS;
        reasons.push(RAIN_REASON.to_string());
    }
    for event in input.corridor_events {
        extra_buffer_mins += EVENT_BUFFER_MINS;
        reasons.push(format!("Event near your route: {}", event.name));
    }

    // May go negative; midnight arithmetic then lands on the previous day.
    let depart_mins = arrive_mins - static_mins - extra_buffer_mins;
    let midnight = input
        .forecast_date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    let adjusted_depart_by = iso_utc(midnight + Duration::minutes(depart_mins));

    let reasoning = if reasons.is_empty() {
        "No delays expected on your route".to_string()
    } else {
        reasons.join("; ")
    };

    Ok(Recommendation {
        adjusted_depart_by,
        extra_buffer_mins,
        reasoning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_day() -> Vec<HourlyPrecip> {
        (0..24)
            .map(|hour| HourlyPrecip {
                hour,
                precipitation_mm: 0.0,
            })
            .collect()
    }

    fn rain_at(hour: u32, mm: f64) -> Vec<HourlyPrecip> {
        let mut day = dry_day();
        day[hour as usize].precipitation_mm = mm;
        day
    }

    fn corridor_event(name: &str) -> EventRecord {
        EventRecord {
            name: name.to_string(),
            venue: "Arena".to_string(),
            lat: 53.3674,
            lng: -6.2591,
            start_time: "18:00".to_string(),
            url: String::new(),
        }
    }

    fn next_monday() -> NaiveDate {
        NaiveDate::parse_from_str("2026-01-12", "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_rain_only_scenario() {
        // 0.7 mm at the commute hour, winter offset 0: depart shifts by 10.
        let hourly = rain_at(8, 0.7);
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &[],
            arrive_by_utc: "08:30",
            static_duration_mins: Some(25),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        assert_eq!(rec.extra_buffer_mins, 10);
        assert!(rec.reasoning.contains("Rain expected"));
        assert_eq!(rec.adjusted_depart_by, "2026-01-12T07:55:00Z");
    }

    #[test]
    fn test_event_on_corridor_scenario() {
        let hourly = dry_day();
        let events = vec![corridor_event("Stadium concert")];
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &events,
            arrive_by_utc: "18:30",
            static_duration_mins: Some(25),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        assert_eq!(rec.extra_buffer_mins, 30);
        assert!(rec.reasoning.contains("Stadium concert"));
        assert_eq!(rec.adjusted_depart_by, "2026-01-12T17:35:00Z");
    }

    #[test]
    fn test_rain_and_two_events_scenario() {
        let hourly = rain_at(8, 1.2);
        let events = vec![corridor_event("Concert"), corridor_event("Match")];
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &events,
            arrive_by_utc: "08:30",
            static_duration_mins: Some(25),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        assert_eq!(rec.extra_buffer_mins, 70);
    }

    #[test]
    fn test_midnight_crossing_departure() {
        let hourly = dry_day();
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &[],
            arrive_by_utc: "00:30",
            static_duration_mins: Some(45),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        // No clamping: departure lands on the previous calendar day.
        assert_eq!(rec.adjusted_depart_by, "2026-01-11T23:45:00Z");
    }

    #[test]
    fn test_rain_at_exact_threshold_adds_nothing() {
        let hourly = rain_at(8, 0.5);
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &[],
            arrive_by_utc: "08:30",
            static_duration_mins: Some(25),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        assert_eq!(rec.extra_buffer_mins, 0);
        assert_eq!(rec.reasoning, "No delays expected on your route");
    }

    #[test]
    fn test_window_spans_depart_through_arrive_hours() {
        // Arrive 09:10, 70 min journey: window is hours 8..=9. Rain at 7
        // must not count.
        let mut hourly = rain_at(7, 5.0);
        hourly[8].precipitation_mm = 0.3;
        hourly[9].precipitation_mm = 0.3;
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &[],
            arrive_by_utc: "09:10",
            static_duration_mins: Some(70),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        // 0.6 mm across the window clears the threshold.
        assert_eq!(rec.extra_buffer_mins, 10);
    }

    #[test]
    fn test_buffer_formula_invariant() {
        for (rain_mm, event_count, expected) in
            [(0.0, 0, 0), (0.6, 0, 10), (0.0, 3, 90), (2.0, 2, 70)]
        {
            let hourly = rain_at(8, rain_mm);
            let events: Vec<EventRecord> = (0..event_count)
                .map(|i| corridor_event(&format!("e{i}")))
                .collect();
            let input = RecommendationInput {
                hourly: &hourly,
                corridor_events: &events,
                arrive_by_utc: "08:30",
                static_duration_mins: Some(25),
                forecast_date: next_monday(),
            };
            let rec = recommend(&input).unwrap();
            assert_eq!(rec.extra_buffer_mins, expected, "rain={rain_mm} events={event_count}");
        }
    }

    #[test]
    fn test_missing_static_duration_is_an_error() {
        let hourly = dry_day();
        let input = RecommendationInput {
            hourly: &hourly,
            corridor_events: &[],
            arrive_by_utc: "08:30",
            static_duration_mins: None,
            forecast_date: next_monday(),
        };
        assert!(recommend(&input).is_err());
    }

    #[test]
    fn test_empty_hourly_means_no_rain_buffer() {
        let input = RecommendationInput {
            hourly: &[],
            corridor_events: &[],
            arrive_by_utc: "08:30",
            static_duration_mins: Some(25),
            forecast_date: next_monday(),
        };
        let rec = recommend(&input).unwrap();
        assert_eq!(rec.extra_buffer_mins, 0);
    }
}
