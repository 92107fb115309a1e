//! Contract with the platform positioning subsystem.
//!
//! The tracker drives the subsystem through [`PositioningSubsystem`] and hears
//! back through an [`EventSink`] registered once at construction. Sink methods
//! never block; every event is queued for the tracker task.

pub mod replay;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Coordinate, Sample};

pub use replay::{ReplayPositioning, ReplayRecord};

/// Accuracy assumed for a visit, which carries no accuracy of its own.
pub const VISIT_ACCURACY_METERS: f64 = 50.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizationStatus {
    NotDetermined,
    Restricted,
    Denied,
    AuthorizedWhenInUse,
    AuthorizedAlways,
}

impl AuthorizationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AuthorizationStatus::AuthorizedAlways => "Always",
            AuthorizationStatus::AuthorizedWhenInUse => "When In Use",
            AuthorizationStatus::NotDetermined => "Not Determined",
            AuthorizationStatus::Denied => "Denied",
            AuthorizationStatus::Restricted => "Restricted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DesiredAccuracy {
    NearestTenMeters,
    HundredMeters,
    Kilometer,
}

impl DesiredAccuracy {
    pub fn meters(&self) -> f64 {
        match self {
            DesiredAccuracy::NearestTenMeters => 10.0,
            DesiredAccuracy::HundredMeters => 100.0,
            DesiredAccuracy::Kilometer => 1_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircularRegion {
    pub identifier: String,
    pub center: Coordinate,
    pub radius_meters: f64,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Visit {
    pub coordinate: Coordinate,
    pub arrival: DateTime<Utc>,
}

impl Visit {
    pub fn to_sample(&self) -> Sample {
        Sample::new(self.arrival, self.coordinate, VISIT_ACCURACY_METERS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositioningEvent {
    AuthorizationChanged(AuthorizationStatus),
    LocationsUpdated(Vec<Sample>),
    Visited(Visit),
    EnteredRegion(String),
    ExitedRegion(String),
    Failed(String),
}

/// Callback surface handed to the subsystem. One method per event kind.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(PositioningEvent) + Send + Sync>,
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

impl EventSink {
    pub fn new<F>(deliver: F) -> Self
    where
        F: Fn(PositioningEvent) + Send + Sync + 'static,
    {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn authorization_changed(&self, status: AuthorizationStatus) {
        (self.deliver)(PositioningEvent::AuthorizationChanged(status));
    }

    pub fn did_update_locations(&self, samples: Vec<Sample>) {
        (self.deliver)(PositioningEvent::LocationsUpdated(samples));
    }

    pub fn did_visit(&self, visit: Visit) {
        (self.deliver)(PositioningEvent::Visited(visit));
    }

    pub fn did_enter_region(&self, identifier: &str) {
        (self.deliver)(PositioningEvent::EnteredRegion(identifier.to_string()));
    }

    pub fn did_exit_region(&self, identifier: &str) {
        (self.deliver)(PositioningEvent::ExitedRegion(identifier.to_string()));
    }

    pub fn did_fail(&self, message: impl Into<String>) {
        (self.deliver)(PositioningEvent::Failed(message.into()));
    }
}

/// Operations the tracker needs from the platform's location service. Calls
/// must return quickly; results arrive later through the [`EventSink`].
pub trait PositioningSubsystem: Send + Sync + 'static {
    fn set_event_sink(&self, sink: EventSink);

    fn authorization_status(&self) -> AuthorizationStatus;
    fn request_always_authorization(&self);
    fn request_when_in_use_authorization(&self);

    /// Ask for exactly one fresh fix (or a failure event).
    fn request_location(&self);

    fn start_updating_location(&self);
    fn stop_updating_location(&self);
    fn start_monitoring_significant_changes(&self);
    fn stop_monitoring_significant_changes(&self);
    fn start_monitoring_visits(&self);
    fn stop_monitoring_visits(&self);

    fn set_desired_accuracy(&self, accuracy: DesiredAccuracy);
    fn set_distance_filter(&self, meters: f64);

    /// Whether the current process packaging can receive fixes while suspended.
    fn supports_background_updates(&self) -> bool;
    fn set_allows_background_updates(&self, allowed: bool);

    fn region_monitoring_available(&self) -> bool;
    fn maximum_region_radius(&self) -> f64;
    fn monitored_regions(&self) -> Vec<CircularRegion>;
    fn start_monitoring_region(&self, region: CircularRegion);
    fn stop_monitoring_region(&self, identifier: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_forwards_each_event_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            EventSink::new(move |event| seen.lock().unwrap().push(event))
        };

        let arrival = Utc::now();
        sink.authorization_changed(AuthorizationStatus::Denied);
        sink.did_visit(Visit {
            coordinate: Coordinate::new(1.0, 2.0),
            arrival,
        });
        sink.did_enter_region("home");
        sink.did_fail("no fix");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen[0],
            PositioningEvent::AuthorizationChanged(AuthorizationStatus::Denied)
        );
        assert_eq!(seen[2], PositioningEvent::EnteredRegion("home".into()));
        assert_eq!(seen[3], PositioningEvent::Failed("no fix".into()));
    }

    #[test]
    fn visit_becomes_coarse_sample_without_speed() {
        let arrival = Utc::now();
        let sample = Visit {
            coordinate: Coordinate::new(3.0, 4.0),
            arrival,
        }
        .to_sample();
        assert_eq!(sample.timestamp, arrival);
        assert_eq!(sample.horizontal_accuracy, VISIT_ACCURACY_METERS);
        assert_eq!(sample.speed_mps(), None);
    }
}
