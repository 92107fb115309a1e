use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Url};
use serde::Serialize;
use thiserror::Error;

use crate::{models::Sample, settings::TrackerSettings, tracking::PingMode};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Background delivery tolerates latency far better than failure.
const REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("invalid endpoint URL")]
    InvalidEndpoint,
    #[error("invalid response from server")]
    InvalidResponse,
    #[error("server rejected ping (HTTP {0})")]
    HttpStatus(u16),
    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationPingPayload {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub horizontal_accuracy_meters: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    pub mode: PingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f32>,
}

impl LocationPingPayload {
    pub fn new(sample: &Sample, mode: PingMode, device_id: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: sent_at,
            latitude: sample.coordinate.latitude,
            longitude: sample.coordinate.longitude,
            horizontal_accuracy_meters: sample.horizontal_accuracy,
            speed_mps: sample.speed_mps(),
            mode,
            battery_level: sample.battery_fraction(),
        }
    }
}

/// One delivery attempt of one sample. Implementations bound their own
/// duration; the tracker never cancels an attempt.
#[async_trait]
pub trait UploadTransport: Send + Sync + 'static {
    async fn upload(
        &self,
        sample: &Sample,
        mode: PingMode,
        settings: &TrackerSettings,
        device_id: &str,
    ) -> Result<(), UploadError>;
}

pub fn parse_endpoint(raw: &str) -> Result<Url, UploadError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(UploadError::InvalidEndpoint);
    }
    let url = Url::parse(trimmed).map_err(|_| UploadError::InvalidEndpoint)?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(UploadError::InvalidEndpoint),
    }
}

pub struct HttpUploader {
    client: Client,
}

impl HttpUploader {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UploadTransport for HttpUploader {
    async fn upload(
        &self,
        sample: &Sample,
        mode: PingMode,
        settings: &TrackerSettings,
        device_id: &str,
    ) -> Result<(), UploadError> {
        let endpoint = parse_endpoint(&settings.endpoint_url)?;
        let payload = LocationPingPayload::new(sample, mode, device_id, Utc::now());

        let mut request = self
            .client
            .post(endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&payload);
        if let Some(token) = settings.bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::HttpStatus(status.as_u16()));
        }

        // Drain the body so a truncated reply is reported rather than ignored.
        response.bytes().await.map_err(|err| {
            log_warn!("ping response body unreadable: {err}");
            UploadError::InvalidResponse
        })?;

        Ok(())
    }
}

fn classify_error(err: reqwest::Error) -> UploadError {
    if err.is_builder() {
        UploadError::InvalidEndpoint
    } else if err.is_decode() || err.is_body() {
        UploadError::InvalidResponse
    } else {
        UploadError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Coordinate;
    use chrono::TimeZone;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        task::JoinHandle,
    };

    fn sample() -> Sample {
        Sample::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            Coordinate::new(51.5, -0.12),
            8.0,
        )
    }

    /// Serves a single request with `status_line`, handing back the raw request.
    async fn one_shot_server(status_line: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/ping", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if request_complete(&raw) {
                    break;
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}");
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).into_owned()
        });

        (url, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= split + 4 + content_length
    }

    #[test]
    fn payload_omits_unknown_speed_and_battery() {
        let payload = LocationPingPayload::new(&sample(), PingMode::StationaryDay, "dev-1", Utc::now());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["latitude"], 51.5);
        assert_eq!(json["longitude"], -0.12);
        assert_eq!(json["horizontalAccuracyMeters"], 8.0);
        assert_eq!(json["mode"], "stationaryDay");
        assert!(json.get("speedMps").is_none());
        assert!(json.get("batteryLevel").is_none());
    }

    #[test]
    fn payload_includes_known_speed_and_battery() {
        let sample = sample().with_speed(2.5).with_battery_level(0.75);
        let payload = LocationPingPayload::new(&sample, PingMode::Moving, "dev-1", Utc::now());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["speedMps"], 2.5);
        assert_eq!(json["batteryLevel"], 0.75);
        assert_eq!(json["mode"], "moving");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn endpoint_validation() {
        assert_eq!(parse_endpoint(""), Err(UploadError::InvalidEndpoint));
        assert_eq!(parse_endpoint("   "), Err(UploadError::InvalidEndpoint));
        assert_eq!(parse_endpoint("not a url"), Err(UploadError::InvalidEndpoint));
        assert_eq!(parse_endpoint("ftp://host/x"), Err(UploadError::InvalidEndpoint));
        assert!(parse_endpoint(" https://example.org/ping ").is_ok());
    }

    #[tokio::test]
    async fn empty_endpoint_fails_without_network() {
        let uploader = HttpUploader::new().unwrap();
        let settings = TrackerSettings {
            endpoint_url: String::new(),
            ..TrackerSettings::default()
        };
        let result = uploader
            .upload(&sample(), PingMode::Moving, &settings, "dev")
            .await;
        assert_eq!(result, Err(UploadError::InvalidEndpoint));
    }

    #[tokio::test]
    async fn posts_json_with_bearer_token() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK").await;
        let settings = TrackerSettings {
            endpoint_url: url,
            bearer_token: "s3cret".into(),
            ..TrackerSettings::default()
        };

        let uploader = HttpUploader::new().unwrap();
        let result = uploader
            .upload(&sample().with_speed(1.0), PingMode::Moving, &settings, "dev-42")
            .await;
        assert_eq!(result, Ok(()));

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /ping HTTP/1.1"));
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("authorization: bearer s3cret"));
        assert!(request.contains("\"deviceId\":\"dev-42\""));
        assert!(request.contains("\"speedMps\":1.0"));
    }

    #[tokio::test]
    async fn no_authorization_header_without_token() {
        let (url, server) = one_shot_server("HTTP/1.1 201 Created").await;
        let settings = TrackerSettings {
            endpoint_url: url,
            ..TrackerSettings::default()
        };

        let result = HttpUploader::new()
            .unwrap()
            .upload(&sample(), PingMode::HomeOrNight, &settings, "dev")
            .await;
        assert_eq!(result, Ok(()));

        let request = server.await.unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_code() {
        let (url, server) = one_shot_server("HTTP/1.1 503 Service Unavailable").await;
        let settings = TrackerSettings {
            endpoint_url: url,
            ..TrackerSettings::default()
        };

        let result = HttpUploader::new()
            .unwrap()
            .upload(&sample(), PingMode::Moving, &settings, "dev")
            .await;
        assert_eq!(result, Err(UploadError::HttpStatus(503)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let settings = TrackerSettings {
            endpoint_url: format!("http://{addr}/ping"),
            ..TrackerSettings::default()
        };
        let result = HttpUploader::new()
            .unwrap()
            .upload(&sample(), PingMode::Moving, &settings, "dev")
            .await;
        assert!(matches!(result, Err(UploadError::Transport(_))), "{result:?}");
    }
}
