use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracking::PingMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PingOutcome {
    Sent,
    Failed,
}

impl PingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingOutcome::Sent => "sent",
            PingOutcome::Failed => "failed",
        }
    }
}

/// One finished upload attempt, kept for the `status` history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingAttempt {
    pub id: String,
    pub attempted_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy: f64,
    pub mode: PingMode,
    pub outcome: PingOutcome,
    pub detail: Option<String>,
}
