//! File-backed collaborators: a recorded position track, a markers file that
//! is watched for changes, and sinks writing to the log, stdout and a JSON
//! lines audit file. Used by the CLI and by tests.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::alerts::model::{AuditEvent, ZoneAlert};
use super::error::MonitorError;
use super::markers::parse_payload;
use super::model::{FixRequest, Marker, MarkerStatus, Position, RawReading, WatchConfig};
use super::platform::{
    AlertSink, AuditSink, FeedSender, MarkerFeed, PermissionGate, PermissionStatus, PositionProvider, ReadingSender,
    Subscription,
};

/// Cancels a background replay task.
struct TaskSubscription {
    token: CancellationToken,
}

impl Subscription for TaskSubscription {
    fn cancel(&self) -> Result<(), MonitorError> {
        self.token.cancel();
        Ok(())
    }
}

/// Fixed answer for every permission stage.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionGate {
    foreground: PermissionStatus,
    background: PermissionStatus,
    notifications: PermissionStatus,
}

impl StaticPermissionGate {
    pub fn new(foreground: PermissionStatus, background: PermissionStatus, notifications: PermissionStatus) -> Self {
        Self {
            foreground,
            background,
            notifications,
        }
    }

    pub fn granting_all() -> Self {
        Self::new(PermissionStatus::Granted, PermissionStatus::Granted, PermissionStatus::Granted)
    }

    pub fn denying_location() -> Self {
        Self::new(PermissionStatus::Denied, PermissionStatus::Denied, PermissionStatus::Granted)
    }
}

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn request_foreground(&self) -> PermissionStatus {
        self.foreground
    }

    async fn request_background(&self) -> PermissionStatus {
        self.background
    }

    async fn request_notifications(&self) -> PermissionStatus {
        self.notifications
    }
}

/// Read a recorded track: one `RawReading` JSON object per line. Blank lines
/// are ignored, unparseable ones are logged and skipped.
pub fn load_track(path: impl AsRef<Path>) -> Result<Vec<RawReading>, MonitorError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut readings = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawReading>(trimmed) {
            Ok(reading) => readings.push(reading),
            Err(e) => log::warn!("{:?} line {}: skipping reading: {}", path, index + 1, e),
        }
    }

    log::info!("Loaded {} readings from {:?}", readings.len(), path);
    Ok(readings)
}

/// Read a markers file holding a JSON array of markers.
pub fn load_markers(path: impl AsRef<Path>) -> Result<Vec<Marker>, MonitorError> {
    let content = fs::read_to_string(path)?;
    let payload: Value = serde_json::from_str(&content)?;
    parse_payload(&payload)
}

/// Replays a recorded track as if it came from positioning hardware.
///
/// Gaps between readings are reproduced, divided by `speed`. A speed of zero
/// or less replays without pausing. The watch applies the same interval and
/// distance gating the OS would.
pub struct ReplayPositionProvider {
    track: Arc<Vec<RawReading>>,
    speed: f64,
    enabled: bool,
    last_delivered: Arc<Mutex<Option<RawReading>>>,
}

impl ReplayPositionProvider {
    pub fn new(track: Vec<RawReading>) -> Self {
        Self {
            track: Arc::new(track),
            speed: 1.0,
            enabled: true,
            last_delivered: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        Ok(Self::new(load_track(path)?))
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Simulate the OS location service being switched off.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn len(&self) -> usize {
        self.track.len()
    }

    pub fn is_empty(&self) -> bool {
        self.track.is_empty()
    }

    /// Wall time a full replay takes at the configured speed.
    pub fn span(&self) -> Duration {
        match (self.track.first(), self.track.last()) {
            (Some(first), Some(last)) => self.gap(first, last),
            _ => Duration::ZERO,
        }
    }

    fn gap(&self, previous: &RawReading, next: &RawReading) -> Duration {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Duration::ZERO;
        }
        let gap = (next.observed_at - previous.observed_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Duration::try_from_secs_f64(gap.as_secs_f64() / self.speed).unwrap_or(Duration::MAX)
    }
}

#[async_trait]
impl PositionProvider for ReplayPositionProvider {
    async fn services_enabled(&self) -> bool {
        self.enabled
    }

    /// The most recently replayed reading, or the start of the track.
    async fn once(&self, _request: FixRequest) -> Result<RawReading, MonitorError> {
        let last = *self.last_delivered.lock().unwrap_or_else(PoisonError::into_inner);
        last.or_else(|| self.track.first().copied())
            .ok_or(MonitorError::Timeout)
    }

    async fn watch(&self, config: WatchConfig, out: ReadingSender) -> Result<Box<dyn Subscription>, MonitorError> {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let track = self.track.clone();
        let last_delivered = self.last_delivered.clone();
        let gaps: Vec<Duration> = std::iter::once(Duration::ZERO)
            .chain(track.windows(2).map(|pair| self.gap(&pair[0], &pair[1])))
            .collect();

        tokio::spawn(async move {
            let mut previous: Option<Position> = None;
            for (reading, gap) in track.iter().zip(gaps) {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = tokio::time::sleep(gap) => {}
                }

                // Invalid readings pass through; the watcher drops them
                if let Ok(position) = Position::from_reading(reading) {
                    if previous.is_some_and(|p| !config.admits(&p, &position)) {
                        continue;
                    }
                    previous = Some(position);
                    *last_delivered.lock().unwrap_or_else(PoisonError::into_inner) = Some(*reading);
                }

                if out.send(Ok(*reading)).is_err() {
                    return;
                }
            }
            log::info!("Replay track finished");
        });

        Ok(Box::new(TaskSubscription { token }))
    }
}

/// Marker feed backed by a JSON file. `subscribe` pushes the file content
/// once immediately and again whenever its modification time or size
/// changes.
pub struct FileMarkerFeed {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileMarkerFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

fn read_payload(path: &Path) -> Result<Value, MonitorError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl MarkerFeed for FileMarkerFeed {
    async fn fetch_by_status(&self, status: MarkerStatus) -> Result<Vec<Marker>, MonitorError> {
        let payload = read_payload(&self.path)
            .map_err(|e| MonitorError::FeedUnavailable(format!("{:?}: {}", self.path, e)))?;
        let markers = parse_payload(&payload)?;
        Ok(markers.into_iter().filter(|m| m.status == status).collect())
    }

    async fn subscribe(&self, out: FeedSender) -> Result<Box<dyn Subscription>, MonitorError> {
        if !self.path.exists() {
            return Err(MonitorError::FeedUnavailable(format!("{:?} does not exist", self.path)));
        }

        let token = CancellationToken::new();
        let task_token = token.clone();
        let path = self.path.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut last_stamp = None;
            loop {
                let stamp = file_stamp(&path);
                if stamp.is_some() && stamp != last_stamp {
                    last_stamp = stamp;
                    let item = read_payload(&path).map_err(|e| MonitorError::Stream {
                        message: format!("{:?}: {}", path, e),
                        recoverable: true,
                    });
                    if out.send(item).is_err() {
                        return;
                    }
                }

                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        Ok(Box::new(TaskSubscription { token }))
    }
}

/// Writes alerts to the log and as JSON lines to stdout.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn prepare(&self) -> Result<(), MonitorError> {
        log::info!("Alert channel ready");
        Ok(())
    }

    async fn notify(&self, alert: &ZoneAlert) -> Result<(), MonitorError> {
        log::warn!("{}: {}", alert.title, alert.body);
        let line = serde_json::to_string(alert)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line).map_err(|e| MonitorError::Sink(e.to_string()))
    }
}

/// Appends audit events to a JSON lines file.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), MonitorError> {
        let line = serde_json::to_string(event)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alerts::model::Severity;
    use crate::core::model::{Accuracy, DangerZone};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(secs: i64, latitude: f64, longitude: f64) -> RawReading {
        RawReading {
            latitude,
            longitude,
            accuracy_m: Some(4.0),
            observed_at: at(secs),
        }
    }

    fn request() -> FixRequest {
        FixRequest {
            accuracy: Accuracy::High,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_load_track_skips_bad_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("track.jsonl");
        let good = serde_json::to_string(&reading(0, 12.9716, 77.5946)).unwrap();
        fs::write(&path, format!("{}\n\nnot json\n{}\n", good, good)).unwrap();

        let track = load_track(&path).unwrap();
        assert_eq!(track.len(), 2);
        assert_eq!(track[0].latitude, 12.9716);

        assert!(matches!(load_track(dir.path().join("missing.jsonl")), Err(MonitorError::Io(_))));
    }

    #[test]
    fn test_load_markers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("markers.json");
        fs::write(
            &path,
            r#"[{"id":"m1","status":"unsafe","latitude":12.972,"longitude":77.595,"note":"Dark alley"}]"#,
        )
        .unwrap();
        let markers = load_markers(&path).unwrap();
        assert_eq!(markers[0].note.as_deref(), Some("Dark alley"));

        fs::write(&path, r#"{"id":"m1"}"#).unwrap();
        assert!(matches!(load_markers(&path), Err(MonitorError::MalformedPayload(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_applies_watch_gating() {
        let provider = ReplayPositionProvider::new(vec![
            reading(0, 12.9716, 77.5946),
            // 5s later: too soon
            reading(5, 12.9730, 77.5960),
            // 30s later, ~200m away
            reading(30, 12.9734, 77.5946),
            // 45s later but barely moved
            reading(45, 12.97341, 77.59461),
            reading(90, 12.9760, 77.5946),
        ]);
        assert_eq!(provider.len(), 5);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = provider.watch(WatchConfig::default(), tx).await.unwrap();

        let mut delivered = Vec::new();
        while let Some(item) = rx.recv().await {
            delivered.push(item.unwrap().observed_at);
        }
        assert_eq!(delivered, vec![at(0), at(30), at(90)]);

        let fix = provider.once(request()).await.unwrap();
        assert_eq!(fix.observed_at, at(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_cancel_stops_delivery() {
        let provider = ReplayPositionProvider::new(vec![reading(0, 1.0, 1.0), reading(600, 2.0, 2.0)]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = provider.watch(WatchConfig::default(), tx).await.unwrap();

        assert!(rx.recv().await.is_some());
        subscription.cancel().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_replay_span_scales_and_saturates() {
        let track = vec![reading(0, 1.0, 1.0), reading(60, 1.0, 1.1)];
        let provider = ReplayPositionProvider::new(track.clone()).with_speed(4.0);
        assert_eq!(provider.span(), Duration::from_secs(15));

        let crawling = ReplayPositionProvider::new(track.clone()).with_speed(1e-300);
        assert_eq!(crawling.span(), Duration::MAX);

        let instant = ReplayPositionProvider::new(track).with_speed(0.0);
        assert_eq!(instant.span(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_replay_once() {
        let empty = ReplayPositionProvider::new(Vec::new());
        assert!(matches!(empty.once(request()).await, Err(MonitorError::Timeout)));

        let provider = ReplayPositionProvider::new(vec![reading(0, 3.0, 4.0)]).with_speed(0.0);
        assert_eq!(provider.once(request()).await.unwrap().latitude, 3.0);
        assert!(!provider.disabled().services_enabled().await);
    }

    #[tokio::test]
    async fn test_file_feed_pushes_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("markers.json");
        fs::write(&path, r#"[{"id":"a","status":"unsafe","latitude":1.0,"longitude":1.0}]"#).unwrap();

        let feed = FileMarkerFeed::new(&path).with_poll_interval(Duration::from_millis(10));
        let unsafe_markers = feed.fetch_by_status(MarkerStatus::Unsafe).await.unwrap();
        assert_eq!(unsafe_markers.len(), 1);
        assert!(feed.fetch_by_status(MarkerStatus::Safe).await.unwrap().is_empty());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = feed.subscribe(tx).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.as_array().unwrap().len(), 1);

        fs::write(
            &path,
            r#"[{"id":"a","status":"unsafe","latitude":1.0,"longitude":1.0},{"id":"b","status":"safe","latitude":2.0,"longitude":2.0}]"#,
        )
        .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.as_array().unwrap().len(), 2);

        subscription.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_file_feed_missing_file() {
        let dir = tempdir().unwrap();
        let feed = FileMarkerFeed::new(dir.path().join("nope.json"));
        assert!(matches!(
            feed.fetch_by_status(MarkerStatus::Unsafe).await,
            Err(MonitorError::FeedUnavailable(_))
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(feed.subscribe(tx).await.is_err());
    }

    #[tokio::test]
    async fn test_audit_sink_appends_lines() {
        let dir = tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit").join("events.jsonl"));
        let zone = DangerZone {
            marker: Marker {
                id: "m1".to_string(),
                status: MarkerStatus::Unsafe,
                latitude: 12.9720,
                longitude: 77.5950,
                note: None,
            },
            distance_km: 0.062,
        };
        let position = Position::new(12.9716, 77.5946, at(0)).unwrap();

        sink.record(&AuditEvent::zone_entry(&zone, &position, at(0))).await.unwrap();
        sink.record(&AuditEvent::zone_entry(&zone, &position, at(60))).await.unwrap();

        let content = fs::read_to_string(sink.path()).unwrap();
        let events: Vec<AuditEvent> = content.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].occurred_at, at(60));
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].message, "Entered within 62m of marked unsafe area");
    }
}
