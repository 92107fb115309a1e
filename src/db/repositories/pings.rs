use anyhow::{Context, Result};
use rusqlite::{params, Row};

use crate::db::{
    helpers::{conversion_error, parse_datetime, parse_mode, parse_outcome},
    models::PingAttempt,
    Database,
};

fn row_to_ping_attempt(row: &Row) -> Result<PingAttempt, rusqlite::Error> {
    let attempted_at: String = row.get("attempted_at")?;
    let mode: String = row.get("mode")?;
    let outcome: String = row.get("outcome")?;

    Ok(PingAttempt {
        id: row.get("id")?,
        attempted_at: parse_datetime(&attempted_at, "attempted_at").map_err(conversion_error)?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        horizontal_accuracy: row.get("horizontal_accuracy")?,
        mode: parse_mode(&mode).map_err(conversion_error)?,
        outcome: parse_outcome(&outcome).map_err(conversion_error)?,
        detail: row.get("detail")?,
    })
}

impl Database {
    pub async fn insert_ping_attempt(&self, attempt: &PingAttempt) -> Result<()> {
        let record = attempt.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO ping_attempts
                    (id, attempted_at, latitude, longitude, horizontal_accuracy, mode, outcome, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.attempted_at.to_rfc3339(),
                    record.latitude,
                    record.longitude,
                    record.horizontal_accuracy,
                    record.mode.as_str(),
                    record.outcome.as_str(),
                    record.detail,
                ],
            )
            .with_context(|| "failed to insert ping attempt")?;
            Ok(())
        })
        .await
    }

    /// Most recent attempts first.
    pub async fn recent_ping_attempts(&self, limit: usize) -> Result<Vec<PingAttempt>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, attempted_at, latitude, longitude, horizontal_accuracy, mode, outcome, detail
                 FROM ping_attempts
                 ORDER BY attempted_at DESC
                 LIMIT ?1",
            )?;

            let attempts = stmt
                .query_map(params![limit], row_to_ping_attempt)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(attempts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::PingOutcome, tracking::PingMode};
    use chrono::{Duration, TimeZone, Utc};

    fn attempt(minutes: i64, outcome: PingOutcome) -> PingAttempt {
        PingAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            attempted_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
                + Duration::minutes(minutes),
            latitude: 1.0,
            longitude: 2.0,
            horizontal_accuracy: 12.5,
            mode: PingMode::HomeOrNight,
            outcome,
            detail: (outcome == PingOutcome::Failed).then(|| "HTTP 500".to_string()),
        }
    }

    #[tokio::test]
    async fn lists_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("pinger.sqlite3")).unwrap();

        let first = attempt(0, PingOutcome::Sent);
        let second = attempt(5, PingOutcome::Failed);
        let third = attempt(10, PingOutcome::Sent);
        for record in [&first, &second, &third] {
            db.insert_ping_attempt(record).await.unwrap();
        }

        let recent = db.recent_ping_attempts(2).await.unwrap();
        assert_eq!(recent, vec![third, second]);
    }

    #[tokio::test]
    async fn unknown_outcome_text_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("pinger.sqlite3")).unwrap();
        db.insert_ping_attempt(&attempt(0, PingOutcome::Sent))
            .await
            .unwrap();
        db.execute(|conn| {
            conn.execute("UPDATE ping_attempts SET outcome = 'queued'", [])?;
            Ok(())
        })
        .await
        .unwrap();

        assert!(db.recent_ping_attempts(10).await.is_err());
    }
}
