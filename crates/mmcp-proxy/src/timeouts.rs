use std::future::Future;
use std::time::Duration;

use mmcp_config::RuntimeSettings;
use tokio::sync::watch;
use tokio::time::Instant;

/// Timeout policy for point operations (`tools/call`, `prompts/get`).
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Budget for one request, restartable on progress.
    pub request: Duration,
    /// Hard ceiling including all progress resets.
    pub max_total: Duration,
    pub reset_on_progress: bool,
}

impl From<&RuntimeSettings> for TimeoutPolicy {
    fn from(settings: &RuntimeSettings) -> Self {
        Self {
            request: settings.request_timeout,
            max_total: settings.max_total_timeout,
            reset_on_progress: settings.reset_timeout_on_progress,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("request timed out")]
pub struct Elapsed;

impl TimeoutPolicy {
    /// Drive `fut` under this policy.
    ///
    /// The per-request timer restarts whenever the progress counter moves
    /// (if `reset_on_progress`); `max_total` is never extended.
    pub async fn run<F, T>(
        &self,
        mut progress: watch::Receiver<u64>,
        fut: F,
    ) -> Result<T, Elapsed>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(fut);
        let total_deadline = Instant::now() + self.max_total;
        let mut request_deadline = Instant::now() + self.request;
        let mut progress_open = self.reset_on_progress;

        loop {
            let deadline = request_deadline.min(total_deadline);
            tokio::select! {
                output = &mut fut => return Ok(output),
                _ = tokio::time::sleep_until(deadline) => return Err(Elapsed),
                changed = progress.changed(), if progress_open => {
                    match changed {
                        Ok(()) => {
                            request_deadline = Instant::now() + self.request;
                        }
                        Err(_) => {
                            // Sender gone; stop watching so this branch
                            // cannot spin.
                            progress_open = false;
                        }
                    }
                }
            }
        }
    }
}
