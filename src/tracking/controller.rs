use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    db::{Database, PingAttempt, PingOutcome},
    log_store::LogStore,
    models::{Coordinate, Sample},
    positioning::{
        AuthorizationStatus, CircularRegion, DesiredAccuracy, EventSink, PositioningEvent,
        PositioningSubsystem,
    },
    settings::{SettingsStore, TrackerSettings},
    uploader::{UploadError, UploadTransport},
};

use super::{
    context::{is_at_home, is_day, HOME_RADIUS_METERS},
    AdaptivePingPolicy, PingContext, PingDecision, PingMode, TrackerSnapshot, TrackerState,
    HOME_REGION_IDENTIFIER,
};

type Reply<T> = oneshot::Sender<T>;

enum TrackerCommand {
    Start(Reply<Result<()>>),
    Stop(Reply<Result<()>>),
    SetHomeToCurrentLocation(Reply<Result<()>>),
    SetHome {
        coordinate: Coordinate,
        source: String,
        reply: Reply<Result<()>>,
    },
    Snapshot(Reply<TrackerSnapshot>),
    Positioning(PositioningEvent),
    SettingsChanged,
    UploadFinished(UploadReport),
    Shutdown(Reply<()>),
}

struct UploadReport {
    sample: Sample,
    mode: PingMode,
    result: Result<(), UploadError>,
}

/// Cloneable front door to the tracker task. Every call is queued behind
/// whatever the task is already doing.
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<TrackerCommand>,
    snapshots: watch::Receiver<TrackerSnapshot>,
}

impl TrackerHandle {
    /// Builds the tracker, registers it with `positioning` and starts its task.
    /// A persisted "tracking on" flag resumes tracking immediately.
    pub async fn spawn<P, U>(
        positioning: Arc<P>,
        uploader: Arc<U>,
        settings: Arc<SettingsStore>,
        logs: LogStore,
        db: Database,
    ) -> Result<(Self, JoinHandle<()>)>
    where
        P: PositioningSubsystem,
        U: UploadTransport,
    {
        let is_tracking = db
            .is_tracking_enabled()
            .await
            .context("failed to read persisted tracking state")?;
        let device_id = db.device_id().await.context("failed to load device id")?;

        let (commands, command_rx) = mpsc::unbounded_channel();

        let sink = {
            let commands = commands.clone();
            EventSink::new(move |event| {
                let _ = commands.send(TrackerCommand::Positioning(event));
            })
        };
        positioning.set_event_sink(sink);
        positioning.set_desired_accuracy(DesiredAccuracy::HundredMeters);
        positioning.set_distance_filter(80.0);

        forward_settings_changes(&settings, commands.clone());

        let state = TrackerState::new(is_tracking, positioning.authorization_status());
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());

        let tracker = Tracker {
            state,
            positioning,
            uploader,
            settings,
            logs,
            db,
            policy: AdaptivePingPolicy::new(),
            device_id,
            commands: commands.clone(),
            snapshots: snapshot_tx,
        };
        let task = tokio::spawn(tracker.run(command_rx));

        Ok((
            Self {
                commands,
                snapshots,
            },
            task,
        ))
    }

    pub async fn start(&self) -> Result<()> {
        self.request(TrackerCommand::Start).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(TrackerCommand::Stop).await?
    }

    /// Uses the last known fix, or asks the subsystem for exactly one.
    pub async fn set_home_to_current_location(&self) -> Result<()> {
        self.request(TrackerCommand::SetHomeToCurrentLocation).await?
    }

    pub async fn set_home(&self, coordinate: Coordinate, source: &str) -> Result<()> {
        let source = source.to_string();
        self.request(|reply| TrackerCommand::SetHome {
            coordinate,
            source,
            reply,
        })
        .await?
    }

    /// State after every previously queued command has been handled.
    pub async fn snapshot(&self) -> Result<TrackerSnapshot> {
        self.request(TrackerCommand::Snapshot).await
    }

    /// Last published state, without waiting for the queue.
    pub fn latest(&self) -> TrackerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshots.clone()
    }

    /// Stops the task once any in-flight upload has completed.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(TrackerCommand::Shutdown).await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> TrackerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| anyhow!("tracker task is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("tracker task stopped before replying"))
    }
}

fn forward_settings_changes(
    settings: &SettingsStore,
    commands: mpsc::UnboundedSender<TrackerCommand>,
) {
    let mut changes = settings.subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if commands.send(TrackerCommand::SettingsChanged).is_err() {
                break;
            }
        }
    });
}

struct Tracker<P, U> {
    state: TrackerState,
    positioning: Arc<P>,
    uploader: Arc<U>,
    settings: Arc<SettingsStore>,
    logs: LogStore,
    db: Database,
    policy: AdaptivePingPolicy,
    device_id: String,
    commands: mpsc::UnboundedSender<TrackerCommand>,
    snapshots: watch::Sender<TrackerSnapshot>,
}

impl<P, U> Tracker<P, U>
where
    P: PositioningSubsystem,
    U: UploadTransport,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<TrackerCommand>) {
        if self.state.is_tracking {
            self.logs.add("Restored tracking state from previous session.");
            self.positioning.request_always_authorization();
            self.evaluate_authorization();
        }
        self.publish();

        let mut shutdown: Option<Reply<()>> = None;

        while let Some(command) = commands.recv().await {
            match command {
                TrackerCommand::Shutdown(reply) => shutdown = Some(reply),
                TrackerCommand::Positioning(_) if shutdown.is_some() => {}
                command => self.handle(command).await,
            }
            self.publish();

            if shutdown.is_some() && !self.state.upload_in_flight {
                break;
            }
        }

        info!("Tracker task shutting down");
        if let Some(reply) = shutdown {
            let _ = reply.send(());
        }
    }

    async fn handle(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Start(reply) => {
                let _ = reply.send(self.start().await);
            }
            TrackerCommand::Stop(reply) => {
                let _ = reply.send(self.stop().await);
            }
            TrackerCommand::SetHomeToCurrentLocation(reply) => {
                let _ = reply.send(self.set_home_to_current_location());
            }
            TrackerCommand::SetHome {
                coordinate,
                source,
                reply,
            } => {
                self.state.pending_set_home_from_next_location = false;
                self.state.last_error = None;
                let _ = reply.send(self.apply_home(coordinate, &source));
            }
            TrackerCommand::Snapshot(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
            TrackerCommand::Positioning(event) => self.handle_positioning(event),
            TrackerCommand::SettingsChanged => {
                if self.state.coarse_monitoring_enabled {
                    self.refresh_home_region();
                }
                self.logs.add("Settings updated.");
            }
            TrackerCommand::UploadFinished(report) => self.finish_upload(report).await,
            TrackerCommand::Shutdown(_) => {}
        }
    }

    async fn start(&mut self) -> Result<()> {
        if self.state.is_tracking {
            return Ok(());
        }

        self.state.is_tracking = true;
        let persisted = self.persist_tracking_state().await;
        self.logs.add("Start requested.");
        self.positioning.request_always_authorization();
        self.evaluate_authorization();
        persisted
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.state.is_tracking {
            return Ok(());
        }

        self.state.is_tracking = false;
        let persisted = self.persist_tracking_state().await;

        self.state.continuous_updates_enabled = false;
        self.positioning.stop_updating_location();
        self.positioning.stop_monitoring_significant_changes();
        self.positioning.stop_monitoring_visits();
        self.state.coarse_monitoring_enabled = false;
        self.remove_home_region();

        self.logs.add("Tracking stopped.");
        persisted
    }

    async fn persist_tracking_state(&self) -> Result<()> {
        let result = self.db.set_tracking_enabled(self.state.is_tracking).await;
        if let Err(err) = &result {
            error!("Failed to persist tracking state: {err:#}");
            self.logs.add(format!("Failed to persist tracking state: {err}"));
        }
        result
    }

    fn evaluate_authorization(&mut self) {
        if !self.state.is_tracking {
            return;
        }

        match self.state.authorization_status {
            AuthorizationStatus::AuthorizedAlways => {
                if self.positioning.supports_background_updates() {
                    self.state.last_error = None;
                } else {
                    self.state.fail(
                        "Background location mode is missing from the process configuration.",
                    );
                }
                self.start_services();
            }
            AuthorizationStatus::AuthorizedWhenInUse => {
                self.state
                    .fail("Enable \"Always\" location for background pings.");
                self.logs.add("Authorization is only 'When In Use'.");
            }
            AuthorizationStatus::Denied | AuthorizationStatus::Restricted => {
                self.state.fail("Location permission denied.");
                self.logs.add("Location permission denied or restricted.");
            }
            AuthorizationStatus::NotDetermined => {
                self.logs.add("Waiting for location permission.");
            }
        }
    }

    fn start_services(&mut self) {
        self.positioning
            .set_allows_background_updates(self.positioning.supports_background_updates());

        if !self.state.coarse_monitoring_enabled {
            self.positioning.start_monitoring_significant_changes();
            self.positioning.start_monitoring_visits();
            self.state.coarse_monitoring_enabled = true;
        }
        self.refresh_home_region();

        if !self.state.continuous_updates_enabled {
            self.positioning.start_updating_location();
            self.state.continuous_updates_enabled = true;
        }

        self.logs.add("Location services started.");
    }

    fn refresh_home_region(&mut self) {
        if !self.positioning.region_monitoring_available() {
            return;
        }

        let radius = HOME_RADIUS_METERS.min(self.positioning.maximum_region_radius());
        let region = CircularRegion {
            identifier: HOME_REGION_IDENTIFIER.to_string(),
            center: self.settings.current().home(),
            radius_meters: radius,
            notify_on_entry: true,
            notify_on_exit: true,
        };

        if radius > 0.0 && self.state.installed_home_region.as_ref() == Some(&region) {
            return;
        }

        self.remove_home_region();

        if radius <= 0.0 {
            return;
        }

        self.positioning.start_monitoring_region(region.clone());
        self.state.installed_home_region = Some(region);
    }

    fn remove_home_region(&mut self) {
        for region in self.positioning.monitored_regions() {
            if region.identifier == HOME_REGION_IDENTIFIER {
                self.positioning.stop_monitoring_region(&region.identifier);
            }
        }
        self.state.installed_home_region = None;
    }

    fn set_home_to_current_location(&mut self) -> Result<()> {
        if let Some(location) = self.state.last_location.clone() {
            return self.apply_home(location.coordinate, "cached");
        }

        self.state.pending_set_home_from_next_location = true;
        self.state.last_error = None;
        self.logs.add("Set Home requested. Fetching current location.");

        if self.state.authorization_status == AuthorizationStatus::NotDetermined {
            self.positioning.request_when_in_use_authorization();
        }
        self.positioning.request_location();
        Ok(())
    }

    /// Stores the new home and moves the geofence with it before the next
    /// command is looked at.
    fn apply_home(&mut self, coordinate: Coordinate, source: &str) -> Result<()> {
        if let Err(err) = self.settings.set_home(coordinate) {
            self.state.fail("Unable to save Home location.");
            self.logs.add(format!("Set Home failed: {err}"));
            return Err(err);
        }

        if self.state.coarse_monitoring_enabled {
            self.refresh_home_region();
        }

        self.logs.add(format!(
            "Home set to {source} location ({:.5}, {:.5}).",
            coordinate.latitude, coordinate.longitude
        ));
        Ok(())
    }

    fn handle_positioning(&mut self, event: PositioningEvent) {
        match event {
            PositioningEvent::AuthorizationChanged(status) => {
                self.state.authorization_status = status;
                self.logs
                    .add(format!("Authorization changed: {}.", status.label()));
                self.evaluate_authorization();
            }
            PositioningEvent::LocationsUpdated(samples) => {
                for sample in samples.into_iter().filter(Sample::has_valid_accuracy) {
                    self.process_location(sample, Utc::now());
                }
            }
            PositioningEvent::Visited(visit) => {
                self.logs.add("Visit event received.");
                self.process_location(visit.to_sample(), visit.arrival);
            }
            PositioningEvent::EnteredRegion(identifier) => {
                if identifier == HOME_REGION_IDENTIFIER {
                    self.logs.add("Entered home region.");
                    self.positioning.request_location();
                }
            }
            PositioningEvent::ExitedRegion(identifier) => {
                if identifier == HOME_REGION_IDENTIFIER {
                    self.logs.add("Exited home region.");
                    self.positioning.request_location();
                }
            }
            PositioningEvent::Failed(message) => {
                if self.state.take_pending_home() {
                    self.state.fail("Unable to get current location for Home.");
                    self.logs
                        .add("Set Home failed: unable to fetch current location.");
                    return;
                }
                self.logs
                    .add(format!("Location manager error: {message}"));
                self.state.fail(message);
            }
        }
    }

    fn process_location(&mut self, sample: Sample, timestamp: DateTime<Utc>) {
        self.state.last_location = Some(sample.clone());

        if self.state.take_pending_home() {
            // Failure is already surfaced through last_error and the log.
            let _ = self.apply_home(sample.coordinate, "fresh");
        }

        if !self.state.is_tracking {
            return;
        }

        let settings = self.settings.current();
        let decision = self.policy.decide(&PingContext {
            timestamp,
            sample: &sample,
            is_at_home: is_at_home(&sample, &settings),
            is_day: is_day(timestamp, &settings),
            last_sent_at: self.state.last_sent_at,
            last_sent_location: self.state.last_sent_location.as_ref(),
            settings: &settings,
        });

        if let Some(previous) = self.state.observe_mode(decision.mode) {
            self.logs.add(format!(
                "Mode changed: {} -> {}.",
                previous.as_str(),
                decision.mode.as_str()
            ));
        }

        self.apply_radio_tuning(&decision);

        self.logs.add(format!(
            "Ping attempt mode={}, send={}, elapsed={}/{}s, distance={}/{}m.",
            decision.mode.as_str(),
            decision.should_send,
            format_rounded(decision.elapsed_since_last_ping_seconds),
            decision.min_interval_seconds as i64,
            format_rounded(decision.distance_since_last_ping_meters),
            decision.min_distance_meters as i64,
        ));

        if !decision.should_send {
            return;
        }

        if !self.state.try_begin_upload() {
            self.logs.add("Ping skipped: upload already in flight.");
            return;
        }

        self.dispatch_upload(sample, decision.mode, settings);
    }

    fn apply_radio_tuning(&mut self, decision: &PingDecision) {
        self.positioning
            .set_desired_accuracy(decision.recommended_accuracy);
        self.positioning
            .set_distance_filter(decision.recommended_distance_filter);

        let wants_continuous = decision.mode.wants_continuous_updates();
        if wants_continuous && !self.state.continuous_updates_enabled {
            self.positioning.start_updating_location();
            self.state.continuous_updates_enabled = true;
        } else if !wants_continuous && self.state.continuous_updates_enabled {
            self.positioning.stop_updating_location();
            self.state.continuous_updates_enabled = false;
        }
    }

    fn dispatch_upload(&self, sample: Sample, mode: PingMode, settings: TrackerSettings) {
        let uploader = Arc::clone(&self.uploader);
        let device_id = self.device_id.clone();
        let attempt_sample = sample.clone();
        let attempt = tokio::spawn(async move {
            uploader
                .upload(&attempt_sample, mode, &settings, &device_id)
                .await
        });

        // A panicking transport must still release the upload slot.
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match attempt.await {
                Ok(result) => result,
                Err(err) => Err(UploadError::Transport(format!("upload task failed: {err}"))),
            };
            let _ = commands.send(TrackerCommand::UploadFinished(UploadReport {
                sample,
                mode,
                result,
            }));
        });
    }

    async fn finish_upload(&mut self, report: UploadReport) {
        self.state.finish_upload();
        let finished_at = Utc::now();

        let detail = match &report.result {
            Ok(()) => {
                self.state.record_sent(&report.sample, finished_at);
                self.logs.add(format!(
                    "Ping sent successfully in mode {}.",
                    report.mode.as_str()
                ));
                None
            }
            Err(err) => {
                let (user_message, log_line) = describe_upload_error(err);
                self.state.fail(user_message);
                self.logs.add(log_line);
                Some(err.to_string())
            }
        };

        let attempt = PingAttempt {
            id: Uuid::new_v4().to_string(),
            attempted_at: finished_at,
            latitude: report.sample.coordinate.latitude,
            longitude: report.sample.coordinate.longitude,
            horizontal_accuracy: report.sample.horizontal_accuracy,
            mode: report.mode,
            outcome: if report.result.is_ok() {
                PingOutcome::Sent
            } else {
                PingOutcome::Failed
            },
            detail,
        };
        if let Err(err) = self.db.insert_ping_attempt(&attempt).await {
            error!("Failed to record ping attempt: {err:#}");
        }
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

fn describe_upload_error(err: &UploadError) -> (String, String) {
    match err {
        UploadError::InvalidEndpoint => (
            "Invalid endpoint URL.".to_string(),
            "Ping failed: invalid endpoint URL.".to_string(),
        ),
        UploadError::InvalidResponse => (
            "Server returned an invalid response.".to_string(),
            "Ping failed: invalid response.".to_string(),
        ),
        UploadError::HttpStatus(status) => (
            format!("Server rejected ping (HTTP {status})."),
            format!("Ping failed with HTTP {status}."),
        ),
        UploadError::Transport(message) => (
            format!("Upload failed: {message}"),
            format!("Ping failed: {message}"),
        ),
    }
}

fn format_rounded(value: f64) -> String {
    if value.is_finite() {
        (value.round() as i64).to_string()
    } else {
        "inf".to_string()
    }
}
