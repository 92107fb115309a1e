pub mod pings;
pub mod preferences;

pub use preferences::{DEVICE_ID_KEY, TRACKING_STATE_KEY};
