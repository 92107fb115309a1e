pub mod context;
pub mod controller;
pub mod policy;
pub mod state;

pub use context::HOME_RADIUS_METERS;
pub use controller::TrackerHandle;
pub use policy::{AdaptivePingPolicy, PingContext, PingDecision, PingMode};
pub use state::{TrackerSnapshot, TrackerState};

/// Identifier of the geofence around home.
pub const HOME_REGION_IDENTIFIER: &str = "gps_pinger.home";
