use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::{helpers::parse_bool, Database};

pub const TRACKING_STATE_KEY: &str = "gps_pinger.isTracking.v1";
pub const DEVICE_ID_KEY: &str = "gps_pinger.deviceId.v1";

impl Database {
    pub async fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM preferences WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_context(|| format!("failed to read preference {key}"))?;
            Ok(value)
        })
        .await
    }

    pub async fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO preferences (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to write preference {key}"))?;
            Ok(())
        })
        .await
    }

    /// Persisted on/off flag; absent means "not tracking".
    pub async fn is_tracking_enabled(&self) -> Result<bool> {
        match self.get_preference(TRACKING_STATE_KEY).await? {
            Some(value) => parse_bool(&value, TRACKING_STATE_KEY),
            None => Ok(false),
        }
    }

    pub async fn set_tracking_enabled(&self, enabled: bool) -> Result<()> {
        self.set_preference(TRACKING_STATE_KEY, if enabled { "true" } else { "false" })
            .await
    }

    /// Stable identifier sent with every ping, created on first use.
    pub async fn device_id(&self) -> Result<String> {
        if let Some(existing) = self.get_preference(DEVICE_ID_KEY).await? {
            return Ok(existing);
        }
        let generated = uuid::Uuid::new_v4().to_string().to_uppercase();
        self.set_preference(DEVICE_ID_KEY, &generated).await?;
        Ok(generated)
    }
}
