//! One-shot deadline timer bound to a reactor service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::service::Service;

/// Callback invoked when the timer fires; the flag is `true` when the wait
/// was cancelled before the deadline.
pub type TimerAction = Arc<dyn Fn(bool) + Send + Sync + 'static>;

/// Notification hooks for a [`Timer`]. Installed actions take precedence
/// over the trait hook.
pub trait TimerHandler: Send + Sync + 'static {
    /// Called when the timer expires (`canceled = false`) or is cancelled
    /// (`canceled = true`). Exactly one call per armed wait.
    fn on_timer(&self, _canceled: bool) {}
    /// Called for timer errors. Cancellation is never reported here.
    fn on_error(&self, _error: &Error) {}
}

struct TimerInner {
    service: Service,
    deadline: Mutex<Instant>,
    action: Mutex<Option<TimerAction>>,
    handler: Mutex<Option<Arc<dyn TimerHandler>>>,
    armed: Mutex<Option<CancellationToken>>,
}

impl TimerInner {
    fn fire(&self, canceled: bool) {
        self.armed.lock().take();
        let action = self.action.lock().clone();
        if let Some(action) = action {
            action(canceled);
        } else if let Some(handler) = self.handler.lock().clone() {
            handler.on_timer(canceled);
        }
    }
}

/// One-shot deadline bound to a reactor, with async and blocking wait.
///
/// `setup` re-arms the deadline or replaces the action; `wait_async`
/// schedules the completion on the service; `cancel` resolves an armed wait
/// with `canceled = true`.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Create a timer whose deadline is "now" (arm it with `setup`).
    #[must_use]
    pub fn new(service: &Service) -> Self {
        Self::with_deadline(service, Instant::now())
    }

    /// Create a timer with an absolute deadline.
    #[must_use]
    pub fn with_deadline(service: &Service, deadline: Instant) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                service: service.clone(),
                deadline: Mutex::new(deadline),
                action: Mutex::new(None),
                handler: Mutex::new(None),
                armed: Mutex::new(None),
            }),
        }
    }

    /// Create a timer expiring after a relative duration.
    #[must_use]
    pub fn with_duration(service: &Service, duration: Duration) -> Self {
        Self::with_deadline(service, Instant::now() + duration)
    }

    /// Create a timer with an action invoked instead of the handler hook.
    #[must_use]
    pub fn with_action<F>(service: &Service, action: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let timer = Self::new(service);
        timer.setup_action(action);
        timer
    }

    /// Install notification hooks.
    pub fn set_handler(&self, handler: Arc<dyn TimerHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    /// The absolute expiry time.
    pub fn expire_time(&self) -> Instant {
        *self.inner.deadline.lock()
    }

    /// Time remaining until expiry (zero when past due).
    pub fn expire_duration(&self) -> Duration {
        self.expire_time().saturating_duration_since(Instant::now())
    }

    /// Re-arm with an absolute deadline.
    pub fn setup_deadline(&self, deadline: Instant) {
        *self.inner.deadline.lock() = deadline;
    }

    /// Re-arm with a deadline relative to now.
    pub fn setup_duration(&self, duration: Duration) {
        self.setup_deadline(Instant::now() + duration);
    }

    /// Install an action invoked instead of the handler hook.
    pub fn setup_action<F>(&self, action: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        *self.inner.action.lock() = Some(Arc::new(action));
    }

    /// Wait for the deadline asynchronously; the completion is scheduled via
    /// the service and fires exactly once. Returns `false` when the service
    /// is stopped or a wait is already armed.
    pub fn wait_async(&self) -> bool {
        let mut armed = self.inner.armed.lock();
        if armed.is_some() {
            debug!("timer wait rejected: already armed");
            return false;
        }
        let token = CancellationToken::new();
        let deadline = *self.inner.deadline.lock();
        let inner = Arc::clone(&self.inner);
        let guard = token.clone();
        let spawned = self.inner.service.spawn(async move {
            let canceled = tokio::select! {
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => false,
                () = guard.cancelled() => true,
            };
            inner.fire(canceled);
        });
        if spawned {
            *armed = Some(token);
        }
        spawned
    }

    /// Block the calling thread until the deadline. Must be called from
    /// outside the service's worker loops.
    pub fn wait_sync(&self) -> bool {
        let deadline = *self.inner.deadline.lock();
        self.inner
            .service
            .block_on(tokio::time::sleep_until(tokio::time::Instant::from_std(
                deadline,
            )))
            .is_ok()
    }

    /// Cancel an armed wait; its completion fires with `canceled = true`.
    /// Returns `false` when no wait is armed.
    pub fn cancel(&self) -> bool {
        match self.inner.armed.lock().clone() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("expire_in", &self.expire_duration())
            .field("armed", &self.inner.armed.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_once_with_expired_flag() {
        let service = Service::new();
        assert!(service.start());

        let (tx, rx) = mpsc::channel();
        let timer = Timer::with_duration(&service, Duration::from_millis(50));
        timer.setup_action(move |canceled| tx.send(canceled).unwrap());

        assert!(timer.wait_async());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
        // Exactly once.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(service.stop());
    }

    #[test]
    fn test_cancel_fires_with_canceled_flag() {
        let service = Service::new();
        assert!(service.start());

        let (tx, rx) = mpsc::channel();
        let timer = Timer::with_duration(&service, Duration::from_secs(60));
        timer.setup_action(move |canceled| tx.send(canceled).unwrap());

        assert!(timer.wait_async());
        assert!(timer.cancel());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), true);
        assert!(service.stop());
    }

    #[test]
    fn test_wait_sync_blocks_until_deadline() {
        let service = Service::new();
        assert!(service.start());

        let timer = Timer::with_duration(&service, Duration::from_millis(30));
        let started = Instant::now();
        assert!(timer.wait_sync());
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert!(service.stop());
    }

    #[test]
    fn test_rearm_after_fire() {
        let service = Service::new();
        assert!(service.start());

        let (tx, rx) = mpsc::channel();
        let timer = Timer::with_duration(&service, Duration::from_millis(10));
        timer.setup_action(move |canceled| tx.send(canceled).unwrap());

        assert!(timer.wait_async());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);

        timer.setup_duration(Duration::from_millis(10));
        assert!(timer.wait_async());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), false);
        assert!(service.stop());
    }
}
