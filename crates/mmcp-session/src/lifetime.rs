use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type CloseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct SessionHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns live upstream transport handles keyed by session id.
///
/// Each registered session gets a watcher task that fires the close callback
/// exactly once, either when the configured lifetime elapses or when the
/// session is closed explicitly. One manager exists per transport kind.
pub struct LifetimeManager {
    lifetime: Option<Duration>,
    inner: Mutex<HashMap<String, SessionHandle>>,
}

impl LifetimeManager {
    /// `lifetime = None` means sessions live until explicitly closed.
    pub fn new(lifetime: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            lifetime,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Track a session; `on_close` runs once on expiry or explicit close.
    ///
    /// Re-registering an id replaces the previous entry (its callback runs).
    pub async fn register<F>(self: &Arc<Self>, session_id: &str, on_close: F)
    where
        F: FnOnce() -> CloseFuture + Send + 'static,
    {
        let token = CancellationToken::new();
        let watcher_token = token.clone();
        let manager = Arc::clone(self);
        let watched_id = session_id.to_string();
        let lifetime = self.lifetime;

        let task = tokio::spawn(async move {
            let expiry = async {
                match lifetime {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = watcher_token.cancelled() => {}
                _ = expiry => {
                    tracing::info!(session_id = %watched_id, "session lifetime expired");
                    manager.inner.lock().await.remove(&watched_id);
                }
            }

            on_close().await;
        });

        let replaced = self.inner.lock().await.insert(
            session_id.to_string(),
            SessionHandle { token, task },
        );
        if let Some(previous) = replaced {
            previous.token.cancel();
            let _ = previous.task.await;
        }
    }

    /// Close one session and wait for its callback to finish.
    pub async fn close(&self, session_id: &str) {
        let handle = self.inner.lock().await.remove(session_id);
        if let Some(handle) = handle {
            handle.token.cancel();
            let _ = handle.task.await;
        }
    }

    /// Close every tracked session; used at shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut map = self.inner.lock().await;
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.token.cancel();
            let _ = handle.task.await;
        }
    }

    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: Arc<AtomicUsize>) -> impl FnOnce() -> CloseFuture + Send {
        move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn explicit_close_runs_callback_once() {
        let manager = LifetimeManager::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .register("sess-1", counting_callback(calls.clone()))
            .await;
        assert_eq!(manager.tracked().await, 1);

        manager.close("sess-1").await;
        manager.close("sess-1").await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracked().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lifetime_expiry_closes_session() {
        let manager = LifetimeManager::new(Some(Duration::from_secs(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        manager
            .register("sess-1", counting_callback(calls.clone()))
            .await;

        tokio::time::advance(Duration::from_secs(31)).await;
        // Let the watcher task observe the elapsed timer.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.tracked().await, 0);
    }

    #[tokio::test]
    async fn re_registering_replaces_and_closes_previous() {
        let manager = LifetimeManager::new(None);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        manager
            .register("sess-1", counting_callback(first.clone()))
            .await;
        manager
            .register("sess-1", counting_callback(second.clone()))
            .await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        manager.close_all().await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
