//! In-memory cache of unsafe-zone markers.
//!
//! The cache holds an immutable, versioned [`MarkerSnapshot`] behind a
//! reader/writer lock. Every accepted feed notification builds a new snapshot
//! and swaps it in whole, so readers always see one consistent marker set.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use super::error::MonitorError;
use super::handle::{Flow, StreamHandle};
use super::model::{Marker, MarkerStatus};
use super::platform::MarkerFeed;

/// Handle returned by [`MarkerCache::subscribe`].
pub type FeedHandle = StreamHandle;

/// Unsafe markers at one point in time, sorted and unique by id.
#[derive(Debug, Default)]
pub struct MarkerSnapshot {
    version: u64,
    markers: Vec<Marker>,
}

impl MarkerSnapshot {
    fn build(version: u64, markers: impl IntoIterator<Item = Marker>) -> Self {
        // Later duplicates win
        let by_id: BTreeMap<String, Marker> = markers
            .into_iter()
            .filter(Marker::is_unsafe)
            .map(|m| (m.id.clone(), m))
            .collect();
        Self {
            version,
            markers: by_id.into_values().collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[derive(Default)]
struct SnapshotCell {
    current: RwLock<Arc<MarkerSnapshot>>,
}

impl SnapshotCell {
    fn get(&self) -> Arc<MarkerSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, markers: impl IntoIterator<Item = Marker>) -> Arc<MarkerSnapshot> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(MarkerSnapshot::build(current.version + 1, markers));
        *current = next.clone();
        next
    }
}

/// Validate a raw feed notification. The whole payload is rejected if it is
/// not an array or if any element is incomplete or out of range.
pub fn parse_payload(payload: &Value) -> Result<Vec<Marker>, MonitorError> {
    let Some(items) = payload.as_array() else {
        return Err(MonitorError::MalformedPayload("expected an array of markers".to_string()));
    };

    let mut markers = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let marker: Marker = serde_json::from_value(item.clone())
            .map_err(|e| MonitorError::MalformedPayload(format!("element {}: {}", index, e)))?;
        if !marker.has_valid_coordinates() {
            return Err(MonitorError::MalformedPayload(format!(
                "element {} ({}): coordinates out of range",
                index, marker.id
            )));
        }
        markers.push(marker);
    }
    Ok(markers)
}

pub struct MarkerCache {
    feed: Arc<dyn MarkerFeed>,
    cell: Arc<SnapshotCell>,
}

impl MarkerCache {
    pub fn new(feed: Arc<dyn MarkerFeed>) -> Self {
        Self {
            feed,
            cell: Arc::new(SnapshotCell::default()),
        }
    }

    /// Latest snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<MarkerSnapshot> {
        self.cell.get()
    }

    /// Bulk fetch of unsafe markers. Never fails: an unreachable feed yields
    /// (and installs) an empty set.
    pub async fn load(&self) -> Vec<Marker> {
        let markers = match self.feed.fetch_by_status(MarkerStatus::Unsafe).await {
            Ok(markers) => markers
                .into_iter()
                .filter(|m| {
                    let valid = m.has_valid_coordinates();
                    if !valid {
                        log::warn!("Skipping marker {} with invalid coordinates", m.id);
                    }
                    valid
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                log::error!("Failed to load unsafe markers: {}", e);
                Vec::new()
            }
        };

        let snapshot = self.cell.replace(markers);
        log::info!("Loaded {} unsafe markers (v{})", snapshot.len(), snapshot.version());
        snapshot.markers().to_vec()
    }

    /// Replace the cache from one raw notification. On a malformed payload
    /// the previous snapshot stays in place.
    pub fn apply_payload(&self, payload: &Value) -> Result<Arc<MarkerSnapshot>, MonitorError> {
        apply_to_cell(&self.cell, payload)
    }

    /// Open the live feed. `on_update` receives every accepted snapshot.
    pub async fn subscribe<F>(&self, on_update: F) -> Result<FeedHandle, MonitorError>
    where
        F: Fn(Arc<MarkerSnapshot>) + Send + Sync + 'static,
    {
        self.subscribe_with_errors(on_update, |e| {
            log::error!("Marker feed stopped: {}", e);
        })
        .await
    }

    pub async fn subscribe_with_errors<F, E>(&self, on_update: F, on_error: E) -> Result<FeedHandle, MonitorError>
    where
        F: Fn(Arc<MarkerSnapshot>) + Send + Sync + 'static,
        E: FnOnce(MonitorError) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .feed
            .subscribe(tx)
            .await
            .map_err(MonitorError::into_subscribe_error)?;

        let cell = self.cell.clone();
        Ok(StreamHandle::spawn(
            "Marker feed",
            subscription,
            rx,
            move |item| match item {
                Ok(payload) => {
                    match apply_to_cell(&cell, &payload) {
                        Ok(snapshot) => on_update(snapshot),
                        Err(e) => log::warn!("Discarding marker update: {}", e),
                    }
                    Flow::Continue
                }
                Err(e) if e.is_recoverable_stream_error() => {
                    log::warn!("Marker feed error (keeping cached markers): {}", e);
                    Flow::Continue
                }
                Err(e) => Flow::Stop(e),
            },
            on_error,
        ))
    }
}

fn apply_to_cell(cell: &SnapshotCell, payload: &Value) -> Result<Arc<MarkerSnapshot>, MonitorError> {
    let markers = parse_payload(payload)?;
    let snapshot = cell.replace(markers);
    log::info!(
        "Updated unsafe markers cache: {} markers (v{})",
        snapshot.len(),
        snapshot.version()
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::platform::{FeedSender, Subscription};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoopSubscription;

    impl Subscription for NoopSubscription {
        fn cancel(&self) -> Result<(), MonitorError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFeed {
        markers: Vec<Marker>,
        offline: bool,
        sender: Mutex<Option<FeedSender>>,
    }

    #[async_trait]
    impl MarkerFeed for FakeFeed {
        async fn fetch_by_status(&self, status: MarkerStatus) -> Result<Vec<Marker>, MonitorError> {
            if self.offline {
                return Err(MonitorError::FeedUnavailable("network down".into()));
            }
            Ok(self.markers.iter().filter(|m| m.status == status).cloned().collect())
        }

        async fn subscribe(&self, out: FeedSender) -> Result<Box<dyn Subscription>, MonitorError> {
            if self.offline {
                return Err(MonitorError::FeedUnavailable("network down".into()));
            }
            *self.sender.lock().unwrap() = Some(out);
            Ok(Box::new(NoopSubscription))
        }
    }

    fn marker(id: &str, status: MarkerStatus) -> Marker {
        Marker {
            id: id.to_string(),
            status,
            latitude: 12.97,
            longitude: 77.59,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_load_filters_unsafe() {
        let feed = Arc::new(FakeFeed {
            markers: vec![
                marker("b", MarkerStatus::Unsafe),
                marker("a", MarkerStatus::Unsafe),
                marker("s", MarkerStatus::Safe),
            ],
            ..FakeFeed::default()
        });
        let cache = MarkerCache::new(feed);

        let loaded = cache.load().await;
        let ids: Vec<&str> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(cache.snapshot().version(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_returns_empty() {
        let feed = Arc::new(FakeFeed {
            offline: true,
            ..FakeFeed::default()
        });
        let cache = MarkerCache::new(feed);

        assert!(cache.load().await.is_empty());
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn test_parse_payload_rejects_malformed() {
        assert!(parse_payload(&json!({"id": "m1"})).is_err());
        assert!(parse_payload(&json!([{"id": "m1", "status": "unsafe", "latitude": 1.0}])).is_err());
        assert!(parse_payload(&json!([{"id": "m1", "status": "unsafe", "latitude": 100.0, "longitude": 1.0}])).is_err());
        assert_eq!(parse_payload(&json!([])).unwrap().len(), 0);
    }

    #[test]
    fn test_apply_payload_replaces_wholesale() {
        let cache = MarkerCache::new(Arc::new(FakeFeed::default()));

        cache
            .apply_payload(&json!([
                {"id": "m1", "status": "unsafe", "latitude": 1.0, "longitude": 1.0},
                {"id": "m2", "status": "unsafe", "latitude": 2.0, "longitude": 2.0},
                {"id": "m3", "status": "safe", "latitude": 3.0, "longitude": 3.0}
            ]))
            .unwrap();
        assert_eq!(cache.snapshot().len(), 2);

        let snapshot = cache
            .apply_payload(&json!([
                {"id": "m3", "status": "unsafe", "latitude": 3.0, "longitude": 3.0, "note": "dark alley"}
            ]))
            .unwrap();
        assert_eq!(snapshot.version(), 2);
        assert_eq!(snapshot.markers().len(), 1);
        assert_eq!(snapshot.markers()[0].id, "m3");
        assert_eq!(snapshot.markers()[0].note.as_deref(), Some("dark alley"));
    }

    #[test]
    fn test_malformed_payload_keeps_previous() {
        let cache = MarkerCache::new(Arc::new(FakeFeed::default()));
        cache
            .apply_payload(&json!([{"id": "m1", "status": "unsafe", "latitude": 1.0, "longitude": 1.0}]))
            .unwrap();

        let before = cache.snapshot();
        assert!(cache.apply_payload(&json!("not a list")).is_err());
        assert!(cache
            .apply_payload(&json!([
                {"id": "m2", "status": "unsafe", "latitude": 2.0, "longitude": 2.0},
                {"status": "unsafe", "latitude": 2.0, "longitude": 2.0}
            ]))
            .is_err());

        let after = cache.snapshot();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.markers()[0].id, "m1");
    }

    #[test]
    fn test_duplicate_ids_keep_last() {
        let cache = MarkerCache::new(Arc::new(FakeFeed::default()));
        let snapshot = cache
            .apply_payload(&json!([
                {"id": "m1", "status": "unsafe", "latitude": 1.0, "longitude": 1.0},
                {"id": "m1", "status": "unsafe", "latitude": 5.0, "longitude": 5.0}
            ]))
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.markers()[0].latitude, 5.0);
    }

    #[tokio::test]
    async fn test_subscription_updates_cache() {
        let feed = Arc::new(FakeFeed::default());
        let cache = MarkerCache::new(feed.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = cache
            .subscribe(move |snapshot| {
                let _ = tx.send(snapshot.version());
            })
            .await
            .unwrap();

        let sender = feed.sender.lock().unwrap().clone().unwrap();
        sender.send(Ok(json!({"bad": true}))).unwrap();
        sender
            .send(Ok(json!([{"id": "m9", "status": "unsafe", "latitude": 1.0, "longitude": 1.0}])))
            .unwrap();

        let version = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(cache.snapshot().markers()[0].id, "m9");

        handle.cancel().unwrap();
        handle.cancel().unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_subscription_error() {
        let feed = Arc::new(FakeFeed {
            offline: true,
            ..FakeFeed::default()
        });
        let cache = MarkerCache::new(feed);
        let result = cache.subscribe(|_| {}).await;
        assert!(matches!(result, Err(MonitorError::Subscription(_))));
    }
}
