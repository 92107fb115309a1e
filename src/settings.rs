use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tokio::sync::watch;

use crate::models::Coordinate;

const LAST_MINUTE_OF_DAY: i64 = 24 * 60 - 1;
const RETIRED_PLACEHOLDER_ENDPOINT: &str = "https://example.com/location";

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSettings {
    #[serde(rename = "endpointURLString")]
    pub endpoint_url: String,
    pub bearer_token: String,
    pub home_latitude: f64,
    pub home_longitude: f64,
    pub moving_interval_seconds: f64,
    pub stationary_day_interval_minutes: i64,
    pub home_or_night_interval_minutes: i64,
    pub min_distance_meters: f64,
    pub day_starts_minutes_from_midnight: i64,
    pub day_ends_minutes_from_midnight: i64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:8787/ping".into(),
            bearer_token: String::new(),
            home_latitude: 37.332,
            home_longitude: -122.031,
            moving_interval_seconds: 30.0,
            stationary_day_interval_minutes: 15,
            home_or_night_interval_minutes: 30,
            min_distance_meters: 30.0,
            day_starts_minutes_from_midnight: 6 * 60,
            day_ends_minutes_from_midnight: 22 * 60,
        }
    }
}

impl TrackerSettings {
    pub fn home(&self) -> Coordinate {
        Coordinate::new(self.home_latitude, self.home_longitude)
    }

    pub fn set_home(&mut self, coordinate: Coordinate) {
        self.home_latitude = coordinate.latitude;
        self.home_longitude = coordinate.longitude;
    }

    pub fn trimmed_endpoint(&self) -> &str {
        self.endpoint_url.trim()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        let token = self.bearer_token.trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Every key the settings file has ever used. Current keys win; the legacy ones
/// are only consulted when their replacement is missing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSettings {
    #[serde(rename = "endpointURLString")]
    endpoint_url: Option<String>,
    bearer_token: Option<String>,
    home_latitude: Option<f64>,
    home_longitude: Option<f64>,
    moving_interval_seconds: Option<f64>,
    stationary_day_interval_minutes: Option<i64>,
    home_or_night_interval_minutes: Option<i64>,
    min_distance_meters: Option<f64>,
    day_starts_minutes_from_midnight: Option<i64>,
    day_ends_minutes_from_midnight: Option<i64>,

    // legacy (seconds-based intervals, hour-based night window)
    stationary_day_interval_seconds: Option<f64>,
    home_or_night_interval_seconds: Option<f64>,
    night_starts_hour: Option<i64>,
    night_ends_hour: Option<i64>,
}

impl StoredSettings {
    fn migrate(self) -> TrackerSettings {
        let defaults = TrackerSettings::default();

        let stationary_day_interval_minutes = interval_minutes(
            self.stationary_day_interval_minutes,
            self.stationary_day_interval_seconds,
            defaults.stationary_day_interval_minutes,
        );
        let home_or_night_interval_minutes = interval_minutes(
            self.home_or_night_interval_minutes,
            self.home_or_night_interval_seconds,
            defaults.home_or_night_interval_minutes,
        );

        let (day_start, day_end) = match (
            self.day_starts_minutes_from_midnight,
            self.day_ends_minutes_from_midnight,
        ) {
            (Some(start), Some(end)) => (clamp_day_minute(start), clamp_day_minute(end)),
            _ => {
                // The night window becomes the complement day window.
                let night_start = self.night_starts_hour.unwrap_or(22);
                let night_end = self.night_ends_hour.unwrap_or(6);
                (
                    clamp_day_minute(night_end.saturating_mul(60)),
                    clamp_day_minute(night_start.saturating_mul(60)),
                )
            }
        };

        TrackerSettings {
            endpoint_url: self.endpoint_url.unwrap_or(defaults.endpoint_url),
            bearer_token: self.bearer_token.unwrap_or(defaults.bearer_token),
            home_latitude: self.home_latitude.unwrap_or(defaults.home_latitude),
            home_longitude: self.home_longitude.unwrap_or(defaults.home_longitude),
            moving_interval_seconds: self
                .moving_interval_seconds
                .unwrap_or(defaults.moving_interval_seconds),
            stationary_day_interval_minutes,
            home_or_night_interval_minutes,
            min_distance_meters: self
                .min_distance_meters
                .unwrap_or(defaults.min_distance_meters),
            day_starts_minutes_from_midnight: day_start,
            day_ends_minutes_from_midnight: day_end,
        }
    }
}

fn interval_minutes(minutes: Option<i64>, legacy_seconds: Option<f64>, default: i64) -> i64 {
    match (minutes, legacy_seconds) {
        (Some(minutes), _) => minutes.max(1),
        (None, Some(seconds)) => ((seconds / 60.0).round() as i64).max(1),
        (None, None) => default,
    }
}

fn clamp_day_minute(value: i64) -> i64 {
    value.clamp(0, LAST_MINUTE_OF_DAY)
}

/// Decodes a settings document, migrating legacy keys and units. Returns the
/// settings plus whether migration changed anything that should be re-saved.
pub fn decode_settings(contents: &str) -> Result<(TrackerSettings, bool)> {
    let stored: StoredSettings =
        serde_json::from_str(contents).context("settings document is not valid JSON")?;
    let mut settings = stored.migrate();
    let mut migrated = false;

    if settings.trimmed_endpoint() == RETIRED_PLACEHOLDER_ENDPOINT {
        settings.endpoint_url = TrackerSettings::default().endpoint_url;
        migrated = true;
    }

    Ok((settings, migrated))
}

pub struct SettingsStore {
    path: PathBuf,
    data: watch::Sender<TrackerSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let (data, needs_save) = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match decode_settings(&contents) {
                Ok(decoded) => decoded,
                Err(err) => {
                    log::warn!("Ignoring unreadable settings at {}: {err:#}", path.display());
                    (TrackerSettings::default(), false)
                }
            }
        } else {
            (TrackerSettings::default(), false)
        };

        let store = Self {
            path,
            data: watch::Sender::new(data),
        };

        if needs_save {
            store.persist(&store.current())?;
        }

        Ok(store)
    }

    /// Snapshot of the settings as they are right now.
    pub fn current(&self) -> TrackerSettings {
        self.data.borrow().clone()
    }

    /// Change notifications. The value current at subscription time counts as seen.
    pub fn subscribe(&self) -> watch::Receiver<TrackerSettings> {
        self.data.subscribe()
    }

    /// Applies `mutate`, writes the result to disk and only then publishes it.
    /// The watch lock is held throughout, so concurrent updaters never lose a
    /// write and a failed save leaves the current value untouched.
    pub fn update<F>(&self, mutate: F) -> Result<TrackerSettings>
    where
        F: FnOnce(&mut TrackerSettings),
    {
        let mut outcome = Err(anyhow!("settings update was not applied"));
        self.data.send_if_modified(|settings| {
            let mut next = settings.clone();
            mutate(&mut next);
            if let Err(err) = self.persist(&next) {
                outcome = Err(err);
                return false;
            }
            let changed = *settings != next;
            *settings = next.clone();
            outcome = Ok(next);
            changed
        });
        outcome
    }

    pub fn set_home(&self, coordinate: Coordinate) -> Result<TrackerSettings> {
        self.update(|settings| settings.set_home(coordinate))
    }

    fn persist(&self, data: &TrackerSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
