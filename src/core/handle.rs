use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use super::error::MonitorError;
use super::platform::Subscription;

/// What a forwarding loop does with one item pulled off a provider channel.
pub(crate) enum Flow {
    Continue,
    Stop(MonitorError),
}

/// Cancelable handle over a provider subscription plus the task forwarding
/// its items. Shared by the position watch and the marker feed.
pub struct StreamHandle {
    name: &'static str,
    subscription: Box<dyn Subscription>,
    token: CancellationToken,
    ended: Arc<AtomicBool>,
    cancelled: AtomicBool,
}

impl StreamHandle {
    /// Spawn the forwarding task. `on_item` runs for every item until the
    /// handle is cancelled, the channel closes, or it returns `Flow::Stop`,
    /// in which case `on_error` receives the error.
    pub(crate) fn spawn<T, F, E>(
        name: &'static str,
        subscription: Box<dyn Subscription>,
        mut rx: UnboundedReceiver<T>,
        mut on_item: F,
        on_error: E,
    ) -> Self
    where
        T: Send + 'static,
        F: FnMut(T) -> Flow + Send + 'static,
        E: FnOnce(MonitorError) + Send + 'static,
    {
        let token = CancellationToken::new();
        let ended = Arc::new(AtomicBool::new(false));

        let task_token = token.clone();
        let task_ended = ended.clone();
        tokio::spawn(async move {
            let mut on_error = Some(on_error);
            loop {
                let item = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    item = rx.recv() => item,
                };

                let Some(item) = item else {
                    log::info!("{} stream ended", name);
                    task_ended.store(true, Ordering::SeqCst);
                    break;
                };

                // Cancellation may land between recv and here
                if task_token.is_cancelled() {
                    break;
                }

                // The provider side stays open; cancel() still releases it
                if let Flow::Stop(e) = on_item(item) {
                    if let Some(on_error) = on_error.take() {
                        on_error(e);
                    }
                    break;
                }
            }
        });

        Self {
            name,
            subscription,
            token,
            ended,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stops delivery and closes the provider stream. Later calls, or calls
    /// after the provider closed the channel, return `Ok(())`.
    pub fn cancel(&self) -> Result<(), MonitorError> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();
        if self.ended.load(Ordering::SeqCst) {
            log::debug!("{} stream already ended, nothing to cancel", self.name);
            return Ok(());
        }
        self.subscription.cancel()
    }

}

impl Subscription for StreamHandle {
    fn cancel(&self) -> Result<(), MonitorError> {
        StreamHandle::cancel(self)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            log::warn!("Failed to cancel {} stream on drop: {}", self.name, e);
        }
    }
}
