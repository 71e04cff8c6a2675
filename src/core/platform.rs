//! Collaborator interfaces the engine consumes.
//!
//! Concrete implementations (vendor SDKs, OS services) live outside the
//! engine. The `replay` module provides file-backed ones for the CLI and
//! tests.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use super::alerts::model::{AuditEvent, ZoneAlert};
use super::error::MonitorError;
use super::model::{FixRequest, Marker, MarkerStatus, RawReading, WatchConfig};

/// Items delivered on the position stream.
pub type ReadingSender = UnboundedSender<Result<RawReading, MonitorError>>;

/// Items delivered on the marker feed. Payloads stay untyped until the
/// cache has validated them.
pub type FeedSender = UnboundedSender<Result<serde_json::Value, MonitorError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Handle to an open provider-side subscription.
pub trait Subscription: Send + Sync {
    fn cancel(&self) -> Result<(), MonitorError>;
}

/// Staged authorization with the host platform.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_foreground(&self) -> PermissionStatus;
    async fn request_background(&self) -> PermissionStatus;
    async fn request_notifications(&self) -> PermissionStatus;
}

/// Positioning hardware.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Whether the OS location service is switched on.
    async fn services_enabled(&self) -> bool;
    /// One position fix. May never resolve; callers bound it with a timeout.
    async fn once(&self, request: FixRequest) -> Result<RawReading, MonitorError>;
    /// Open a continuous stream. Readings are pushed into `out` until the
    /// returned subscription is cancelled or the sender is dropped.
    async fn watch(&self, config: WatchConfig, out: ReadingSender) -> Result<Box<dyn Subscription>, MonitorError>;
}

/// Remote unsafe-zone marker feed.
#[async_trait]
pub trait MarkerFeed: Send + Sync {
    async fn fetch_by_status(&self, status: MarkerStatus) -> Result<Vec<Marker>, MonitorError>;
    /// Every notification carries the complete marker collection.
    async fn subscribe(&self, out: FeedSender) -> Result<Box<dyn Subscription>, MonitorError>;
}

/// Notification channel. Fire-and-forget from the engine's side.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// One-time channel setup before the first alert.
    async fn prepare(&self) -> Result<(), MonitorError> {
        Ok(())
    }
    async fn notify(&self, alert: &ZoneAlert) -> Result<(), MonitorError>;
}

/// Optional side-channel persisting danger-zone entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), MonitorError>;
}
