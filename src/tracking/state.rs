use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    models::{Coordinate, Sample},
    positioning::{AuthorizationStatus, CircularRegion},
};

use super::PingMode;

/// What observers may see of the tracker.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub is_tracking: bool,
    pub authorization_status: AuthorizationStatus,
    pub mode: PingMode,
    pub last_location: Option<Sample>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub continuous_updates_enabled: bool,
    pub upload_in_flight: bool,
    pub pending_set_home: bool,
}

/// Session state owned by the tracker task. Only `is_tracking` outlives the
/// process (through the preferences table).
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub is_tracking: bool,
    pub authorization_status: AuthorizationStatus,
    pub last_location: Option<Sample>,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_sent_location: Option<Coordinate>,
    pub last_mode: PingMode,
    pub last_error: Option<String>,
    pub continuous_updates_enabled: bool,
    /// Significant-change and visit delivery; doubles as "services are running".
    pub coarse_monitoring_enabled: bool,
    pub upload_in_flight: bool,
    pub pending_set_home_from_next_location: bool,
    pub installed_home_region: Option<CircularRegion>,
}

impl TrackerState {
    pub fn new(is_tracking: bool, authorization_status: AuthorizationStatus) -> Self {
        Self {
            is_tracking,
            authorization_status,
            last_location: None,
            last_ping_at: None,
            last_sent_at: None,
            last_sent_location: None,
            last_mode: PingMode::default(),
            last_error: None,
            continuous_updates_enabled: false,
            coarse_monitoring_enabled: false,
            upload_in_flight: false,
            pending_set_home_from_next_location: false,
            installed_home_region: None,
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            is_tracking: self.is_tracking,
            authorization_status: self.authorization_status,
            mode: self.last_mode,
            last_location: self.last_location.clone(),
            last_ping_at: self.last_ping_at,
            last_error: self.last_error.clone(),
            continuous_updates_enabled: self.continuous_updates_enabled,
            upload_in_flight: self.upload_in_flight,
            pending_set_home: self.pending_set_home_from_next_location,
        }
    }

    /// Returns the previous mode when `mode` differs from it.
    pub fn observe_mode(&mut self, mode: PingMode) -> Option<PingMode> {
        if mode == self.last_mode {
            return None;
        }
        Some(std::mem::replace(&mut self.last_mode, mode))
    }

    /// Claims the single upload slot. False when an upload is already out.
    pub fn try_begin_upload(&mut self) -> bool {
        if self.upload_in_flight {
            return false;
        }
        self.upload_in_flight = true;
        true
    }

    pub fn finish_upload(&mut self) {
        self.upload_in_flight = false;
    }

    pub fn record_sent(&mut self, sample: &Sample, at: DateTime<Utc>) {
        self.last_ping_at = Some(at);
        self.last_sent_at = Some(at);
        self.last_sent_location = Some(sample.coordinate);
        self.last_error = None;
    }

    pub fn take_pending_home(&mut self) -> bool {
        std::mem::take(&mut self.pending_set_home_from_next_location)
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}
