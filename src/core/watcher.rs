use std::sync::Arc;

use tokio::sync::mpsc;

use super::error::MonitorError;
use super::handle::{Flow, StreamHandle};
use super::model::{Position, WatchConfig};
use super::platform::PositionProvider;

/// Handle returned by [`PositionWatcher::watch`].
pub type WatchHandle = StreamHandle;

/// Opens continuous position streams and validates every delivered reading.
pub struct PositionWatcher {
    provider: Arc<dyn PositionProvider>,
    config: WatchConfig,
}

impl PositionWatcher {
    pub fn new(provider: Arc<dyn PositionProvider>, config: WatchConfig) -> Self {
        Self { provider, config }
    }

    pub async fn watch<F>(&self, on_position: F) -> Result<WatchHandle, MonitorError>
    where
        F: Fn(Position) + Send + Sync + 'static,
    {
        self.watch_with_errors(on_position, |e| {
            log::error!("Position stream stopped: {}", e);
        })
        .await
    }

    /// Like [`watch`](Self::watch), with `on_error` receiving the error that
    /// ends the stream when the transport cannot recover.
    pub async fn watch_with_errors<F, E>(&self, on_position: F, on_error: E) -> Result<WatchHandle, MonitorError>
    where
        F: Fn(Position) + Send + Sync + 'static,
        E: FnOnce(MonitorError) + Send + 'static,
    {
        log::info!(
            "Starting position watch (every {}s / {}m)",
            self.config.min_interval.as_secs(),
            self.config.min_distance_m
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .provider
            .watch(self.config, tx)
            .await
            .map_err(MonitorError::into_subscribe_error)?;

        Ok(StreamHandle::spawn(
            "Position",
            subscription,
            rx,
            move |item| match item {
                Ok(reading) => {
                    match Position::from_reading(&reading) {
                        Ok(position) => on_position(position),
                        Err(e) => log::warn!("Dropping position reading: {}", e),
                    }
                    Flow::Continue
                }
                Err(e) if e.is_recoverable_stream_error() => {
                    log::warn!("Position stream error (continuing): {}", e);
                    Flow::Continue
                }
                Err(e) => Flow::Stop(e),
            },
            on_error,
        ))
    }
}
