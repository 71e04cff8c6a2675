//! One-shot position sampling with bounded retries.
//!
//! The first attempt asks for a high-accuracy fix; later attempts fall back
//! to balanced accuracy. Every attempt is bounded by a hard timeout and
//! failed attempts back off linearly (`backoff * attempt`).

use std::sync::Arc;
use std::time::Duration;

use super::config::MonitorSettings;
use super::error::MonitorError;
use super::model::{Accuracy, Position};
use super::platform::PositionProvider;

pub struct PositionSampler {
    provider: Arc<dyn PositionProvider>,
    settings: MonitorSettings,
}

impl PositionSampler {
    pub fn new(provider: Arc<dyn PositionProvider>, settings: MonitorSettings) -> Self {
        Self { provider, settings }
    }

    /// Obtain one validated position.
    ///
    /// Fails immediately on `ServiceDisabled` or `PermissionDenied`; otherwise
    /// retries up to the configured number of attempts and returns the last
    /// error seen.
    pub async fn sample(&self) -> Result<Position, MonitorError> {
        let attempts = self.settings.sample_attempts.max(1);
        let mut last_error = MonitorError::Timeout;

        for attempt in 1..=attempts {
            if !self.provider.services_enabled().await {
                log::error!("Location services are disabled, not sampling");
                return Err(MonitorError::ServiceDisabled);
            }

            let accuracy = if attempt == 1 {
                Accuracy::High
            } else {
                Accuracy::Balanced
            };
            log::debug!("Sampling position (attempt {}/{}, {:?})", attempt, attempts, accuracy);

            match self.attempt(accuracy).await {
                Ok(position) => {
                    log::info!(
                        "Position obtained: {:.6}, {:.6}",
                        position.latitude(),
                        position.longitude()
                    );
                    return Ok(position);
                }
                Err(e) if e.is_terminal() => {
                    log::warn!("Position attempt {} failed, not retrying: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Position attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }
        }

        log::error!("Failed to get position after {} attempts: {}", attempts, last_error);
        Err(last_error)
    }

    async fn attempt(&self, accuracy: Accuracy) -> Result<Position, MonitorError> {
        let request = self.settings.fix_request(accuracy);
        let reading = tokio::time::timeout(request.timeout, self.provider.once(request))
            .await
            .map_err(|_| MonitorError::Timeout)??;
        Position::from_reading(&reading)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.settings.sample_backoff().saturating_mul(attempt)
    }
}
