use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::{db::models::PingOutcome, tracking::PingMode};

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_mode(value: &str) -> Result<PingMode> {
    match value {
        "moving" => Ok(PingMode::Moving),
        "stationaryDay" => Ok(PingMode::StationaryDay),
        "homeOrNight" => Ok(PingMode::HomeOrNight),
        other => Err(anyhow!("unknown ping mode {other}")),
    }
}

pub fn parse_outcome(value: &str) -> Result<PingOutcome> {
    match value {
        "sent" => Ok(PingOutcome::Sent),
        "failed" => Ok(PingOutcome::Failed),
        other => Err(anyhow!("unknown ping outcome {other}")),
    }
}

pub fn parse_bool(value: &str, field: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(anyhow!("{field} contains non-boolean value {other}")),
    }
}

/// Wraps a conversion failure so it can escape a rusqlite row mapper.
pub fn conversion_error(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_round_trips_and_rejects_unknown_text() {
        for outcome in [PingOutcome::Sent, PingOutcome::Failed] {
            assert_eq!(parse_outcome(outcome.as_str()).unwrap(), outcome);
        }
        assert!(parse_outcome("queued").is_err());
        assert!(parse_outcome("").is_err());
    }
}
