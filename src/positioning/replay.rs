use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::models::{Coordinate, Sample};
use crate::tracking::HOME_REGION_IDENTIFIER;

use super::{
    AuthorizationStatus, CircularRegion, DesiredAccuracy, EventSink, PositioningSubsystem, Visit,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const MAXIMUM_REGION_RADIUS_METERS: f64 = 10_000.0;

fn unknown_speed() -> f64 {
    -1.0
}

fn default_accuracy() -> f64 {
    10.0
}

fn home_region() -> String {
    HOME_REGION_IDENTIFIER.to_string()
}

/// One line of a recorded positioning session (newline-delimited JSON).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReplayRecord {
    Fix {
        timestamp: Option<DateTime<Utc>>,
        latitude: f64,
        longitude: f64,
        #[serde(default = "default_accuracy")]
        accuracy: f64,
        #[serde(default = "unknown_speed")]
        speed: f64,
        #[serde(rename = "batteryLevel")]
        battery_level: Option<f32>,
    },
    Visit {
        arrival: Option<DateTime<Utc>>,
        latitude: f64,
        longitude: f64,
    },
    EnterRegion {
        #[serde(default = "home_region")]
        identifier: String,
    },
    ExitRegion {
        #[serde(default = "home_region")]
        identifier: String,
    },
    Authorization {
        status: AuthorizationStatus,
    },
    Error {
        message: String,
    },
}

#[derive(Debug)]
struct ReplayState {
    sink: Option<EventSink>,
    authorization: AuthorizationStatus,
    supports_background: bool,
    allows_background: bool,
    continuous: bool,
    significant_changes: bool,
    visits: bool,
    desired_accuracy: DesiredAccuracy,
    distance_filter: f64,
    regions: Vec<CircularRegion>,
    latest_fix: Option<Sample>,
}

/// Positioning subsystem backed by a recorded feed instead of hardware. It
/// honours the delivery contract: fixes only reach the tracker while
/// continuous or significant-change delivery is on, region events only for
/// monitored regions, visits only while visit monitoring is on.
pub struct ReplayPositioning {
    state: Mutex<ReplayState>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayStatus {
    pub continuous: bool,
    pub significant_changes: bool,
    pub visits: bool,
    pub allows_background: bool,
    pub desired_accuracy: DesiredAccuracy,
    pub distance_filter: f64,
    pub regions: Vec<CircularRegion>,
}

impl ReplayPositioning {
    pub fn new(authorization: AuthorizationStatus) -> Self {
        Self {
            state: Mutex::new(ReplayState {
                sink: None,
                authorization,
                supports_background: true,
                allows_background: false,
                continuous: false,
                significant_changes: false,
                visits: false,
                desired_accuracy: DesiredAccuracy::HundredMeters,
                distance_filter: 80.0,
                regions: Vec::new(),
                latest_fix: None,
            }),
        }
    }

    pub fn status(&self) -> ReplayStatus {
        let state = self.lock();
        ReplayStatus {
            continuous: state.continuous,
            significant_changes: state.significant_changes,
            visits: state.visits,
            allows_background: state.allows_background,
            desired_accuracy: state.desired_accuracy,
            distance_filter: state.distance_filter,
            regions: state.regions.clone(),
        }
    }

    pub fn deliver(&self, record: ReplayRecord) {
        match record {
            ReplayRecord::Fix {
                timestamp,
                latitude,
                longitude,
                accuracy,
                speed,
                battery_level,
            } => {
                let mut sample = Sample::new(
                    timestamp.unwrap_or_else(Utc::now),
                    Coordinate::new(latitude, longitude),
                    accuracy,
                )
                .with_speed(speed);
                sample.battery_level = battery_level;

                let sink = {
                    let mut state = self.lock();
                    state.latest_fix = Some(sample.clone());
                    (state.continuous || state.significant_changes)
                        .then(|| state.sink.clone())
                        .flatten()
                };
                if let Some(sink) = sink {
                    sink.did_update_locations(vec![sample]);
                }
            }
            ReplayRecord::Visit {
                arrival,
                latitude,
                longitude,
            } => {
                let sink = {
                    let state = self.lock();
                    state.visits.then(|| state.sink.clone()).flatten()
                };
                if let Some(sink) = sink {
                    sink.did_visit(Visit {
                        coordinate: Coordinate::new(latitude, longitude),
                        arrival: arrival.unwrap_or_else(Utc::now),
                    });
                }
            }
            ReplayRecord::EnterRegion { identifier } => {
                if let Some(sink) = self.sink_for_region(&identifier) {
                    sink.did_enter_region(&identifier);
                }
            }
            ReplayRecord::ExitRegion { identifier } => {
                if let Some(sink) = self.sink_for_region(&identifier) {
                    sink.did_exit_region(&identifier);
                }
            }
            ReplayRecord::Authorization { status } => self.change_authorization(status),
            ReplayRecord::Error { message } => {
                if let Some(sink) = self.sink() {
                    sink.did_fail(message);
                }
            }
        }
    }

    fn sink_for_region(&self, identifier: &str) -> Option<EventSink> {
        let state = self.lock();
        state
            .regions
            .iter()
            .any(|region| region.identifier == identifier)
            .then(|| state.sink.clone())
            .flatten()
    }

    fn change_authorization(&self, status: AuthorizationStatus) {
        let sink = {
            let mut state = self.lock();
            state.authorization = status;
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.authorization_changed(status);
        }
    }

    fn grant_if_undetermined(&self, status: AuthorizationStatus) {
        if self.authorization_status() == AuthorizationStatus::NotDetermined {
            self.change_authorization(status);
        }
    }

    fn sink(&self) -> Option<EventSink> {
        self.lock().sink.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PositioningSubsystem for ReplayPositioning {
    fn set_event_sink(&self, sink: EventSink) {
        self.lock().sink = Some(sink);
    }

    fn authorization_status(&self) -> AuthorizationStatus {
        self.lock().authorization
    }

    fn request_always_authorization(&self) {
        self.grant_if_undetermined(AuthorizationStatus::AuthorizedAlways);
    }

    fn request_when_in_use_authorization(&self) {
        self.grant_if_undetermined(AuthorizationStatus::AuthorizedWhenInUse);
    }

    fn request_location(&self) {
        let (sink, fix) = {
            let state = self.lock();
            (state.sink.clone(), state.latest_fix.clone())
        };
        let Some(sink) = sink else {
            return;
        };
        match fix {
            Some(mut fix) => {
                fix.timestamp = Utc::now();
                sink.did_update_locations(vec![fix]);
            }
            None => sink.did_fail("No location available yet."),
        }
    }

    fn start_updating_location(&self) {
        self.lock().continuous = true;
    }

    fn stop_updating_location(&self) {
        self.lock().continuous = false;
    }

    fn start_monitoring_significant_changes(&self) {
        self.lock().significant_changes = true;
    }

    fn stop_monitoring_significant_changes(&self) {
        self.lock().significant_changes = false;
    }

    fn start_monitoring_visits(&self) {
        self.lock().visits = true;
    }

    fn stop_monitoring_visits(&self) {
        self.lock().visits = false;
    }

    fn set_desired_accuracy(&self, accuracy: DesiredAccuracy) {
        self.lock().desired_accuracy = accuracy;
    }

    fn set_distance_filter(&self, meters: f64) {
        self.lock().distance_filter = meters;
    }

    fn supports_background_updates(&self) -> bool {
        self.lock().supports_background
    }

    fn set_allows_background_updates(&self, allowed: bool) {
        self.lock().allows_background = allowed;
    }

    fn region_monitoring_available(&self) -> bool {
        true
    }

    fn maximum_region_radius(&self) -> f64 {
        MAXIMUM_REGION_RADIUS_METERS
    }

    fn monitored_regions(&self) -> Vec<CircularRegion> {
        self.lock().regions.clone()
    }

    fn start_monitoring_region(&self, region: CircularRegion) {
        let mut state = self.lock();
        state
            .regions
            .retain(|existing| existing.identifier != region.identifier);
        state.regions.push(region);
    }

    fn stop_monitoring_region(&self, identifier: &str) {
        self.lock()
            .regions
            .retain(|region| region.identifier != identifier);
    }
}

/// Feeds newline-delimited [`ReplayRecord`]s into `positioning`, pausing
/// `pace` between records. Blank lines are ignored and malformed lines are
/// logged and skipped. Returns the number of records delivered.
pub async fn replay_feed<R>(
    positioning: Arc<ReplayPositioning>,
    reader: R,
    pace: Duration,
    cancel_token: CancellationToken,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut delivered = 0usize;
    let mut line_number = 0usize;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read replay feed")?,
            _ = cancel_token.cancelled() => {
                log_info!("replay feed cancelled after {} records", delivered);
                break;
            }
        };

        let Some(line) = line else {
            break;
        };
        line_number += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<ReplayRecord>(trimmed) {
            Ok(record) => {
                positioning.deliver(record);
                delivered += 1;
            }
            Err(err) => {
                log_warn!("skipping replay line {}: {err}", line_number);
                continue;
            }
        }

        if !pace.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(pace) => {}
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    log_info!("replay feed finished: {} records delivered", delivered);
    Ok(delivered)
}
