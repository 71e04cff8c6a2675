//! Monitoring session: permissions, marker cache, position stream, proximity
//! evaluation and debounced alerting, wired into one cancelable unit.
//!
//! Lifecycle is `Idle -> Starting -> Active -> Stopped`. A session is single
//! use: once stopped it stays stopped.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::alerts::debouncer::AlertDebouncer;
use super::alerts::model::{AuditEvent, ZoneAlert};
use super::config::MonitorSettings;
use super::error::MonitorError;
use super::handle::StreamHandle;
use super::markers::{MarkerCache, MarkerSnapshot};
use super::model::{DangerZone, Position, SessionState};
use super::platform::{AlertSink, AuditSink, MarkerFeed, PermissionGate, PositionProvider};
use super::proximity;
use super::sampler::PositionSampler;
use super::watcher::PositionWatcher;

type DangerListener = Arc<dyn Fn(&DangerZone) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(&MonitorError) + Send + Sync>;

/// External collaborators a session is built from.
pub struct Collaborators {
    pub permissions: Arc<dyn PermissionGate>,
    pub provider: Arc<dyn PositionProvider>,
    pub feed: Arc<dyn MarkerFeed>,
    pub alert_sink: Arc<dyn AlertSink>,
    pub audit_sink: Option<Arc<dyn AuditSink>>,
}

/// One position waiting for evaluation, optionally with someone waiting
/// for the verdict.
struct Evaluation {
    position: Position,
    reply: Option<oneshot::Sender<Option<DangerZone>>>,
}

pub struct MonitoringSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    settings: MonitorSettings,
    permissions: Arc<dyn PermissionGate>,
    provider: Arc<dyn PositionProvider>,
    markers: MarkerCache,
    sampler: PositionSampler,
    alert_sink: Arc<dyn AlertSink>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    debouncer: Mutex<AlertDebouncer>,
    state: Mutex<SessionState>,
    subscriptions: Mutex<Vec<StreamHandle>>,
    queue: Mutex<Option<mpsc::UnboundedSender<Evaluation>>>,
    token: CancellationToken,
    danger_listeners: Mutex<Vec<DangerListener>>,
    error_listeners: Mutex<Vec<ErrorListener>>,
}

impl MonitoringSession {
    pub fn new(settings: MonitorSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            permissions,
            provider,
            feed,
            alert_sink,
            audit_sink,
        } = collaborators;

        Self {
            inner: Arc::new(SessionInner {
                markers: MarkerCache::new(feed),
                sampler: PositionSampler::new(provider.clone(), settings.clone()),
                debouncer: Mutex::new(AlertDebouncer::new(settings.cooldown())),
                settings,
                permissions,
                provider,
                alert_sink,
                audit_sink,
                state: Mutex::new(SessionState::Idle),
                subscriptions: Mutex::new(Vec::new()),
                queue: Mutex::new(None),
                token: CancellationToken::new(),
                danger_listeners: Mutex::new(Vec::new()),
                error_listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    /// Markers the evaluator currently sees.
    pub fn marker_snapshot(&self) -> Arc<MarkerSnapshot> {
        self.inner.markers.snapshot()
    }

    /// Called for every detected zone, cooldown or not.
    pub fn on_danger<F>(&self, listener: F)
    where
        F: Fn(&DangerZone) + Send + Sync + 'static,
    {
        lock(&self.inner.danger_listeners).push(Arc::new(listener));
    }

    /// Called when a stream fails for good and takes the session down.
    pub fn on_error<F>(&self, listener: F)
    where
        F: Fn(&MonitorError) + Send + Sync + 'static,
    {
        lock(&self.inner.error_listeners).push(Arc::new(listener));
    }

    /// Negotiate permissions, load markers and open both streams.
    ///
    /// Denied foreground permission is not an error: the session moves to
    /// `Stopped` and an inert handle is returned.
    pub async fn start(&self) -> Result<MonitorHandle, MonitorError> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            match *state {
                SessionState::Idle => *state = SessionState::Starting,
                other => return Err(MonitorError::InvalidState(other)),
            }
        }
        log::info!("Starting monitoring session");

        // 1. Foreground location
        if !inner.permissions.request_foreground().await.is_granted() {
            log::warn!("Foreground location permission denied, monitoring disabled");
            inner.stop();
            return Ok(MonitorHandle::inert());
        }

        // 2. Background location
        if inner.settings.request_background {
            tokio::time::sleep(inner.settings.permission_stage_delay()).await;
            if inner.stopped_during_startup() {
                return Ok(MonitorHandle::inert());
            }
            if !inner.permissions.request_background().await.is_granted() {
                log::warn!("Background location permission denied, monitoring in foreground only");
            }
        }

        // 3. Notifications
        if inner.settings.request_notifications {
            tokio::time::sleep(inner.settings.permission_stage_delay()).await;
            if inner.stopped_during_startup() {
                return Ok(MonitorHandle::inert());
            }
            if inner.permissions.request_notifications().await.is_granted() {
                if let Err(e) = inner.alert_sink.prepare().await {
                    log::warn!("Failed to prepare alert channel: {}", e);
                }
            } else {
                log::warn!("Notification permission denied, alerts may not be shown");
            }
        }

        // 4. Initial markers. Never fails.
        if inner.stopped_during_startup() {
            return Ok(MonitorHandle::inert());
        }
        inner.markers.load().await;
        if inner.stopped_during_startup() {
            return Ok(MonitorHandle::inert());
        }

        // 5. Live marker feed
        let feed_handle = match inner
            .markers
            .subscribe_with_errors(
                |snapshot| log::debug!("Marker snapshot v{} installed", snapshot.version()),
                failure_reporter(inner),
            )
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("Marker feed unavailable, using loaded markers only: {}", e);
                None
            }
        };

        // 6. Position watch
        let (queue, rx) = mpsc::unbounded_channel();
        let watcher = PositionWatcher::new(inner.provider.clone(), inner.settings.watch_config());
        let forward = queue.clone();
        let watch_handle = match watcher
            .watch_with_errors(
                move |position| {
                    let _ = forward.send(Evaluation { position, reply: None });
                },
                failure_reporter(inner),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                cancel_all(feed_handle.into_iter().collect());
                inner.stop();
                return match e {
                    MonitorError::PermissionDenied => {
                        log::warn!("Location permission revoked before watch, monitoring disabled");
                        Ok(MonitorHandle::inert())
                    }
                    e => {
                        log::error!("Failed to start position watch: {}", e);
                        Err(e)
                    }
                };
            }
        };

        // 7. Go live unless stop() raced us
        let mut opened: Vec<StreamHandle> = feed_handle.into_iter().collect();
        opened.push(watch_handle);
        {
            let mut state = lock(&inner.state);
            if *state != SessionState::Starting {
                drop(state);
                log::info!("Session stopped during startup");
                cancel_all(opened);
                return Ok(MonitorHandle::inert());
            }
            lock(&inner.subscriptions).extend(opened);
            *lock(&inner.queue) = Some(queue);
            spawn_evaluator(Arc::downgrade(inner), inner.token.clone(), rx);
            *state = SessionState::Active;
        }

        log::info!(
            "Monitoring active: {} unsafe markers, radius {} km",
            inner.markers.snapshot().len(),
            inner.settings.geofence_radius_km
        );
        Ok(MonitorHandle {
            session: Some(inner.clone()),
        })
    }

    /// Take one fix now and run it through the same evaluation as the
    /// stream. Only valid while the session is active.
    pub async fn check_now(&self) -> Result<Option<DangerZone>, MonitorError> {
        let inner = &self.inner;
        let state = inner.state();
        if state != SessionState::Active {
            return Err(MonitorError::InvalidState(state));
        }

        let position = inner.sampler.sample().await?;

        let (reply, verdict) = oneshot::channel();
        let queue = lock(&inner.queue).clone();
        let sent = queue.map(|q| {
            q.send(Evaluation {
                position,
                reply: Some(reply),
            })
            .is_ok()
        });
        if sent != Some(true) {
            return Err(MonitorError::InvalidState(inner.state()));
        }

        verdict.await.map_err(|_| MonitorError::InvalidState(inner.state()))
    }

    /// Cancel everything. Valid from any state; a no-op when idle or
    /// already stopped.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn stopped_during_startup(&self) -> bool {
        let stopped = self.token.is_cancelled();
        if stopped {
            log::info!("Session stopped during startup");
        }
        stopped
    }

    fn stop(&self) {
        {
            let mut state = lock(&self.state);
            match *state {
                SessionState::Idle | SessionState::Stopped => {
                    log::debug!("Stop ignored, session is {:?}", *state);
                    return;
                }
                SessionState::Starting | SessionState::Active => *state = SessionState::Stopped,
            }
        }

        log::info!("Stopping monitoring session");
        self.token.cancel();
        lock(&self.queue).take();
        let handles = std::mem::take(&mut *lock(&self.subscriptions));
        cancel_all(handles);
    }

    fn fail(&self, error: MonitorError) {
        log::error!("Monitoring stopped by stream failure: {}", error);
        // Listeners run unlocked so they may register more listeners
        let listeners = lock(&self.error_listeners).clone();
        for listener in listeners {
            listener(&error);
        }
        self.stop();
    }

    async fn evaluate(&self, position: &Position) -> Option<DangerZone> {
        let snapshot = self.markers.snapshot();
        let zone = proximity::evaluate(position, snapshot.markers(), self.settings.geofence_radius_km)?;
        log::info!(
            "Danger zone detected: marker {} at {:.0}m",
            zone.marker.id,
            zone.distance_m()
        );

        let listeners = lock(&self.danger_listeners).clone();
        for listener in listeners {
            listener(&zone);
        }

        let now = Utc::now();
        let admitted = lock(&self.debouncer).try_acquire(&zone.marker.id, now);
        if admitted {
            self.emit(&zone, position, now).await;
        } else {
            log::debug!("Alert for {} suppressed by cooldown", zone.marker.id);
        }
        Some(zone)
    }

    async fn emit(&self, zone: &DangerZone, position: &Position, now: DateTime<Utc>) {
        let alert = ZoneAlert::for_zone(zone);
        if let Err(e) = self.alert_sink.notify(&alert).await {
            log::error!("Failed to deliver alert for {}: {}", zone.marker.id, e);
        }

        if let Some(audit) = &self.audit_sink {
            let event = AuditEvent::zone_entry(zone, position, now);
            if let Err(e) = audit.record(&event).await {
                log::warn!("Failed to record audit event for {}: {}", zone.marker.id, e);
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Returned by [`MonitoringSession::start`]. The inert variant is handed out
/// when monitoring could not begin; it is never active and stopping it does
/// nothing.
pub struct MonitorHandle {
    session: Option<Arc<SessionInner>>,
}

impl MonitorHandle {
    fn inert() -> Self {
        Self { session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::Active)
    }

    pub fn stop(&self) {
        if let Some(session) = &self.session {
            session.stop();
        }
    }
}

fn spawn_evaluator(session: Weak<SessionInner>, token: CancellationToken, mut rx: mpsc::UnboundedReceiver<Evaluation>) {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some(Evaluation { position, reply }) = next else {
                break;
            };
            if token.is_cancelled() {
                break;
            }
            let Some(inner) = session.upgrade() else {
                break;
            };

            let zone = inner.evaluate(&position).await;
            if let Some(reply) = reply {
                let _ = reply.send(zone);
            }
        }
        log::debug!("Evaluation loop finished");
    });
}

fn failure_reporter(inner: &Arc<SessionInner>) -> impl FnOnce(MonitorError) + Send + 'static {
    let session = Arc::downgrade(inner);
    move |error| {
        if let Some(inner) = session.upgrade() {
            inner.fail(error);
        }
    }
}

fn cancel_all(handles: Vec<StreamHandle>) {
    for handle in handles {
        if let Err(e) = handle.cancel() {
            log::warn!("Failed to cancel {} subscription: {}", handle.name(), e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
