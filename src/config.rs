use std::env;
use std::time::Duration;

use crate::engine::phase::{DurationPreset, PhaseDurations};
use crate::engine::reconciler::{DEFAULT_FRESHNESS_WINDOW, DEFAULT_TICK_INTERVAL};
use crate::error::AppError;
use crate::models::coordinate::Coordinate;

pub const DEFAULT_ETA_REFRESH: Duration = Duration::from_secs(30);
pub const DEFAULT_HUB: Coordinate = Coordinate::new(10.7626, 106.6602);

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub tick_interval_ms: u64,
    pub freshness_window_ms: u64,
    pub eta_refresh_secs: u64,
    pub phase_preset: DurationPreset,
    pub default_hub: Coordinate,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            tick_interval_ms: parse_or_default("TICK_INTERVAL_MS", 1000)?,
            freshness_window_ms: parse_or_default("FRESHNESS_WINDOW_MS", 3000)?,
            eta_refresh_secs: parse_or_default("ETA_REFRESH_SECS", 30)?,
            phase_preset: parse_or_default("PHASE_PRESET", DurationPreset::PassiveClient)?,
            default_hub: Coordinate::new(
                parse_or_default("DEFAULT_HUB_LAT", DEFAULT_HUB.latitude)?,
                parse_or_default("DEFAULT_HUB_LNG", DEFAULT_HUB.longitude)?,
            ),
        })
    }

    pub fn tracking(&self) -> TrackingConfig {
        TrackingConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            freshness_window: Duration::from_millis(self.freshness_window_ms),
            eta_refresh: Duration::from_secs(self.eta_refresh_secs.max(1)),
            phase_durations: self.phase_preset.durations(),
            default_hub: Some(self.default_hub),
        }
    }
}

/// Timing and fallbacks for tracking sessions.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub tick_interval: Duration,
    pub freshness_window: Duration,
    pub eta_refresh: Duration,
    pub phase_durations: PhaseDurations,
    /// Departure point when the drone record names no hub or home pad.
    pub default_hub: Option<Coordinate>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            eta_refresh: DEFAULT_ETA_REFRESH,
            phase_durations: DurationPreset::PassiveClient.durations(),
            default_hub: Some(DEFAULT_HUB),
        }
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
