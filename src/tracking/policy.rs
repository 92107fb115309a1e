use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    models::{Coordinate, Sample},
    positioning::DesiredAccuracy,
    settings::TrackerSettings,
};

const MOVING_SPEED_THRESHOLD_MPS: f64 = 1.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PingMode {
    Moving,
    StationaryDay,
    HomeOrNight,
}

impl Default for PingMode {
    fn default() -> Self {
        PingMode::StationaryDay
    }
}

impl PingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingMode::Moving => "moving",
            PingMode::StationaryDay => "stationaryDay",
            PingMode::HomeOrNight => "homeOrNight",
        }
    }

    /// Whether continuous fixes are worth their battery cost in this mode.
    pub fn wants_continuous_updates(&self) -> bool {
        !matches!(self, PingMode::HomeOrNight)
    }
}

pub struct PingContext<'a> {
    pub timestamp: DateTime<Utc>,
    pub sample: &'a Sample,
    pub is_at_home: bool,
    pub is_day: bool,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub last_sent_location: Option<&'a Coordinate>,
    pub settings: &'a TrackerSettings,
}

impl PingContext<'_> {
    fn seconds_since_last_send(&self) -> Option<f64> {
        self.last_sent_at
            .map(|sent_at| (self.timestamp - sent_at).num_milliseconds() as f64 / 1000.0)
    }

    fn meters_since_last_send(&self) -> Option<f64> {
        self.last_sent_location
            .map(|location| self.sample.distance_to(location))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PingDecision {
    pub should_send: bool,
    pub mode: PingMode,
    pub min_interval_seconds: f64,
    /// `f64::INFINITY` when nothing has been sent yet.
    pub elapsed_since_last_ping_seconds: f64,
    pub min_distance_meters: f64,
    /// `f64::INFINITY` when nothing has been sent yet.
    pub distance_since_last_ping_meters: f64,
    pub recommended_accuracy: DesiredAccuracy,
    pub recommended_distance_filter: f64,
}

/// Stateless cadence policy: turns one sample plus its context into a verdict.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptivePingPolicy;

impl AdaptivePingPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn decide(&self, context: &PingContext<'_>) -> PingDecision {
        let mode = if self.is_moving(context) {
            PingMode::Moving
        } else if context.is_at_home || !context.is_day {
            PingMode::HomeOrNight
        } else {
            PingMode::StationaryDay
        };

        let min_interval = min_interval_seconds(mode, context.settings);
        let min_distance = min_distance_meters(mode, context.settings);
        let elapsed = context.seconds_since_last_send().unwrap_or(f64::INFINITY);
        let distance = context.meters_since_last_send().unwrap_or(f64::INFINITY);

        PingDecision {
            should_send: elapsed >= min_interval && distance >= min_distance,
            mode,
            min_interval_seconds: min_interval,
            elapsed_since_last_ping_seconds: elapsed,
            min_distance_meters: min_distance,
            distance_since_last_ping_meters: distance,
            recommended_accuracy: recommended_accuracy(mode),
            recommended_distance_filter: recommended_distance_filter(mode),
        }
    }

    fn is_moving(&self, context: &PingContext<'_>) -> bool {
        if context.sample.speed >= MOVING_SPEED_THRESHOLD_MPS {
            return true;
        }

        let (Some(elapsed), Some(distance)) = (
            context.seconds_since_last_send(),
            context.meters_since_last_send(),
        ) else {
            return false;
        };

        // A stale or zero speed reading must not hide real displacement.
        distance / elapsed.max(1.0) >= MOVING_SPEED_THRESHOLD_MPS
    }
}

fn min_interval_seconds(mode: PingMode, settings: &TrackerSettings) -> f64 {
    match mode {
        PingMode::Moving => settings.moving_interval_seconds.max(5.0),
        PingMode::StationaryDay => (settings.stationary_day_interval_minutes as f64 * 60.0).max(60.0),
        PingMode::HomeOrNight => (settings.home_or_night_interval_minutes as f64 * 60.0).max(120.0),
    }
}

fn min_distance_meters(mode: PingMode, settings: &TrackerSettings) -> f64 {
    match mode {
        PingMode::Moving => settings.min_distance_meters.max(10.0),
        PingMode::StationaryDay => (settings.min_distance_meters * 2.0).max(20.0),
        PingMode::HomeOrNight => (settings.min_distance_meters * 4.0).max(40.0),
    }
}

fn recommended_accuracy(mode: PingMode) -> DesiredAccuracy {
    match mode {
        PingMode::Moving => DesiredAccuracy::NearestTenMeters,
        PingMode::StationaryDay => DesiredAccuracy::HundredMeters,
        PingMode::HomeOrNight => DesiredAccuracy::Kilometer,
    }
}

fn recommended_distance_filter(mode: PingMode) -> f64 {
    match mode {
        PingMode::Moving => 20.0,
        PingMode::StationaryDay => 80.0,
        PingMode::HomeOrNight => 250.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn sample_at(at: DateTime<Utc>, coordinate: Coordinate, speed: f64) -> Sample {
        Sample::new(at, coordinate, 5.0).with_speed(speed)
    }

    fn origin() -> Coordinate {
        Coordinate::new(45.0, 7.0)
    }

    /// Roughly `meters` north of `origin()`.
    fn north_of_origin(meters: f64) -> Coordinate {
        Coordinate::new(45.0 + meters / 111_195.0, 7.0)
    }

    struct Case {
        sample: Sample,
        is_at_home: bool,
        is_day: bool,
        last_sent_at: Option<DateTime<Utc>>,
        last_sent_location: Option<Coordinate>,
        settings: TrackerSettings,
    }

    impl Case {
        fn new(sample: Sample) -> Self {
            Self {
                sample,
                is_at_home: false,
                is_day: true,
                last_sent_at: None,
                last_sent_location: None,
                settings: TrackerSettings::default(),
            }
        }

        fn sent(mut self, at: DateTime<Utc>, location: Coordinate) -> Self {
            self.last_sent_at = Some(at);
            self.last_sent_location = Some(location);
            self
        }

        fn decide(&self) -> PingDecision {
            AdaptivePingPolicy::new().decide(&PingContext {
                timestamp: self.sample.timestamp,
                sample: &self.sample,
                is_at_home: self.is_at_home,
                is_day: self.is_day,
                last_sent_at: self.last_sent_at,
                last_sent_location: self.last_sent_location.as_ref(),
                settings: &self.settings,
            })
        }
    }

    #[test]
    fn first_fix_always_sends() {
        for (speed, at_home, is_day) in [
            (0.0, false, true),
            (-1.0, true, true),
            (10.0, false, false),
            (0.5, true, false),
        ] {
            let mut case = Case::new(sample_at(t0(), origin(), speed));
            case.is_at_home = at_home;
            case.is_day = is_day;
            let decision = case.decide();
            assert!(decision.should_send, "speed={speed} home={at_home} day={is_day}");
            assert!(decision.elapsed_since_last_ping_seconds.is_infinite());
            assert!(decision.distance_since_last_ping_meters.is_infinite());
        }
    }

    #[test]
    fn fast_sample_is_moving_even_at_home_at_night() {
        let mut case = Case::new(sample_at(t0(), origin(), 1.5));
        case.is_at_home = true;
        case.is_day = false;
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::Moving);
        assert_eq!(decision.recommended_accuracy, DesiredAccuracy::NearestTenMeters);
        assert_eq!(decision.recommended_distance_filter, 20.0);
    }

    #[test]
    fn at_home_during_day_relaxes_to_home_or_night() {
        let mut case = Case::new(sample_at(t0(), origin(), 0.0));
        case.is_at_home = true;
        assert_eq!(case.decide().mode, PingMode::HomeOrNight);
    }

    #[test]
    fn away_during_day_is_stationary_day() {
        let decision = Case::new(sample_at(t0(), origin(), 0.2)).decide();
        assert_eq!(decision.mode, PingMode::StationaryDay);
        assert_eq!(decision.recommended_accuracy, DesiredAccuracy::HundredMeters);
        assert_eq!(decision.recommended_distance_filter, 80.0);
    }

    #[test]
    fn unknown_speed_without_history_is_not_moving() {
        let decision = Case::new(sample_at(t0(), origin(), -1.0)).decide();
        assert_eq!(decision.mode, PingMode::StationaryDay);
    }

    #[test]
    fn displacement_since_last_send_infers_movement() {
        // 300 m in 100 s is 3 m/s even though the reported speed is zero.
        let case = Case::new(sample_at(t0() + Duration::seconds(100), north_of_origin(300.0), 0.0))
            .sent(t0(), origin());
        assert_eq!(case.decide().mode, PingMode::Moving);
    }

    #[test]
    fn simultaneous_samples_divide_by_at_least_one_second() {
        // Same timestamp, 1 m apart: 1 m / 1 s is below the threshold.
        let case = Case::new(sample_at(t0(), north_of_origin(1.0), -1.0)).sent(t0(), origin());
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::StationaryDay);
        assert!(!decision.should_send);
    }

    #[test]
    fn floors_win_over_tiny_configuration() {
        let mut settings = TrackerSettings::default();
        settings.moving_interval_seconds = 0.0;
        settings.stationary_day_interval_minutes = 0;
        settings.home_or_night_interval_minutes = -3;
        settings.min_distance_meters = 0.0;

        let mut moving = Case::new(sample_at(t0(), origin(), 4.0));
        moving.settings = settings.clone();
        let decision = moving.decide();
        assert_eq!(decision.min_interval_seconds, 5.0);
        assert_eq!(decision.min_distance_meters, 10.0);

        let mut day = Case::new(sample_at(t0(), origin(), 0.0));
        day.settings = settings.clone();
        let decision = day.decide();
        assert_eq!(decision.min_interval_seconds, 60.0);
        assert_eq!(decision.min_distance_meters, 20.0);

        let mut night = Case::new(sample_at(t0(), origin(), 0.0));
        night.is_day = false;
        night.settings = settings;
        let decision = night.decide();
        assert_eq!(decision.min_interval_seconds, 120.0);
        assert_eq!(decision.min_distance_meters, 40.0);
    }

    #[test]
    fn larger_configuration_is_used_as_is() {
        let mut case = Case::new(sample_at(t0(), origin(), 0.0));
        case.is_day = false;
        case.settings.home_or_night_interval_minutes = 45;
        case.settings.min_distance_meters = 25.0;
        let decision = case.decide();
        assert_eq!(decision.min_interval_seconds, 45.0 * 60.0);
        assert_eq!(decision.min_distance_meters, 100.0);
    }

    #[test]
    fn enough_time_without_enough_distance_does_not_send() {
        let case = Case::new(sample_at(t0() + Duration::hours(5), north_of_origin(5.0), 0.0))
            .sent(t0(), origin());
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::StationaryDay);
        assert!(decision.elapsed_since_last_ping_seconds > decision.min_interval_seconds);
        assert!(!decision.should_send);
    }

    #[test]
    fn enough_distance_without_enough_time_does_not_send() {
        let case = Case::new(sample_at(t0() + Duration::seconds(20), north_of_origin(5_000.0), 0.0))
            .sent(t0(), origin());
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::Moving);
        assert!(decision.distance_since_last_ping_meters > decision.min_distance_meters);
        assert!(!decision.should_send);
    }

    #[test]
    fn both_thresholds_met_sends() {
        let case = Case::new(sample_at(t0() + Duration::seconds(60), north_of_origin(500.0), 8.0))
            .sent(t0(), origin());
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::Moving);
        assert!(decision.should_send);
    }

    #[test]
    fn moving_scenario_second_fix_within_interval_is_held_back() {
        let mut settings = TrackerSettings::default();
        settings.moving_interval_seconds = 30.0;
        settings.min_distance_meters = 30.0;

        let mut first = Case::new(sample_at(t0(), origin(), 5.0));
        first.settings = settings.clone();
        let decision = first.decide();
        assert_eq!(decision.mode, PingMode::Moving);
        assert!(decision.should_send);

        let mut second =
            Case::new(sample_at(t0() + Duration::seconds(10), origin(), 5.0)).sent(t0(), origin());
        second.settings = settings;
        let decision = second.decide();
        assert_eq!(decision.mode, PingMode::Moving);
        assert_eq!(decision.elapsed_since_last_ping_seconds, 10.0);
        assert_eq!(decision.min_interval_seconds, 30.0);
        assert!(!decision.should_send);
    }

    #[test]
    fn night_at_home_scenario_uses_home_or_night_interval() {
        let mut case = Case::new(sample_at(t0(), origin(), 0.0));
        case.is_at_home = true;
        case.is_day = false;
        case.settings.home_or_night_interval_minutes = 30;
        let decision = case.decide();
        assert_eq!(decision.mode, PingMode::HomeOrNight);
        assert_eq!(decision.min_interval_seconds, 1800.0);
        assert_eq!(decision.recommended_accuracy, DesiredAccuracy::Kilometer);
        assert_eq!(decision.recommended_distance_filter, 250.0);
    }

    #[test]
    fn decision_is_idempotent() {
        let case = Case::new(sample_at(t0() + Duration::seconds(90), north_of_origin(50.0), 0.3))
            .sent(t0(), origin());
        assert_eq!(case.decide(), case.decide());
    }

    #[test]
    fn mode_wire_names() {
        assert_eq!(PingMode::Moving.as_str(), "moving");
        assert_eq!(PingMode::StationaryDay.as_str(), "stationaryDay");
        assert_eq!(PingMode::HomeOrNight.as_str(), "homeOrNight");
        assert_eq!(
            serde_json::to_string(&PingMode::HomeOrNight).unwrap(),
            "\"homeOrNight\""
        );
    }
}
