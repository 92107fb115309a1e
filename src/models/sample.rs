use chrono::{DateTime, Utc};
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        self.point().haversine_distance(&other.point())
    }

    fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }
}

/// A single position fix as delivered by the positioning subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub coordinate: Coordinate,
    /// Negative when the fix is unusable.
    pub horizontal_accuracy: f64,
    /// Meters per second; negative when the subsystem could not measure it.
    pub speed: f64,
    pub battery_level: Option<f32>,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, coordinate: Coordinate, horizontal_accuracy: f64) -> Self {
        Self {
            timestamp,
            coordinate,
            horizontal_accuracy,
            speed: -1.0,
            battery_level: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_battery_level(mut self, level: f32) -> Self {
        self.battery_level = Some(level);
        self
    }

    pub fn has_valid_accuracy(&self) -> bool {
        self.horizontal_accuracy >= 0.0
    }

    pub fn speed_mps(&self) -> Option<f64> {
        (self.speed >= 0.0).then_some(self.speed)
    }

    /// Battery level in `0..=1`, discarding the subsystem's negative "unknown" marker.
    pub fn battery_fraction(&self) -> Option<f32> {
        self.battery_level.filter(|level| *level >= 0.0)
    }

    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        self.coordinate.distance_to(other)
    }
}
