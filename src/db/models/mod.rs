pub mod ping;

pub use ping::{PingAttempt, PingOutcome};
