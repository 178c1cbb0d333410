//! Reactor service: owns the worker runtime and schedules I/O and user tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// How long `stop` waits for in-flight blocking work before abandoning it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reactor configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Worker thread count; `None` selects the available parallelism.
    pub threads: Option<usize>,
    /// Run the loops in polling mode, invoking `on_idle` between batches
    /// instead of blocking until an event arrives.
    pub polling: bool,
}

/// Lifecycle hooks for a [`Service`]. All methods have empty defaults.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Called on each worker thread before it processes its first event.
    fn on_thread_initialize(&self) {}
    /// Called on each worker thread as it shuts down.
    fn on_thread_cleanup(&self) {}
    /// Called once the service has started.
    fn on_started(&self) {}
    /// Called once the service has stopped.
    fn on_stopped(&self) {}
    /// Called between event batches in polling mode.
    fn on_idle(&self) {}
    /// Called for unrecoverable service errors.
    fn on_error(&self, _error: &Error) {}
}

/// Default no-op hooks.
#[derive(Debug, Default)]
pub struct DefaultServiceHandler;

impl ServiceHandler for DefaultServiceHandler {}

struct ServiceInner {
    config: ServiceConfig,
    handler: Arc<dyn ServiceHandler>,
    runtime: Mutex<Option<Runtime>>,
    handle: Mutex<Option<Handle>>,
    idle: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
}

/// A reactor owning N worker loops. Endpoints bind to a service for the
/// duration of their life; handlers for a given endpoint run serialized on
/// its driver task while distinct endpoints run in parallel up to N.
///
/// Cloning is cheap and shares the underlying reactor.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Create a service with the default configuration and no-op hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    /// Create a service with the given configuration and no-op hooks.
    #[must_use]
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::with_handler(config, Arc::new(DefaultServiceHandler))
    }

    /// Create a service with the given configuration and lifecycle hooks.
    #[must_use]
    pub fn with_handler(config: ServiceConfig, handler: Arc<dyn ServiceHandler>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                handler,
                runtime: Mutex::new(None),
                handle: Mutex::new(None),
                idle: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the service is started.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Worker thread count the service was configured with.
    pub fn threads(&self) -> usize {
        self.inner.config.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1)
        })
    }

    /// Whether the service runs in polling mode.
    pub fn is_polling(&self) -> bool {
        self.inner.config.polling
    }

    /// Start the worker loops. Returns `false` when already started or when
    /// the runtime could not be built (reported through `on_error`).
    pub fn start(&self) -> bool {
        let mut runtime_slot = self.inner.runtime.lock();
        if runtime_slot.is_some() {
            return false;
        }

        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(self.threads())
            .thread_name("nexio-worker")
            .enable_io()
            .enable_time();
        let init = Arc::clone(&self.inner.handler);
        builder.on_thread_start(move || init.on_thread_initialize());
        let cleanup = Arc::clone(&self.inner.handler);
        builder.on_thread_stop(move || cleanup.on_thread_cleanup());

        let runtime = match builder.build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("failed to build service runtime: {e}");
                self.inner.handler.on_error(&Error::Io(e));
                return false;
            }
        };

        *self.inner.handle.lock() = Some(runtime.handle().clone());

        if self.inner.config.polling {
            let token = CancellationToken::new();
            let idle = Arc::clone(&self.inner.handler);
            let guard = token.clone();
            runtime.spawn(async move {
                while !guard.is_cancelled() {
                    idle.on_idle();
                    tokio::task::yield_now().await;
                }
            });
            *self.inner.idle.lock() = Some(token);
        }

        *runtime_slot = Some(runtime);
        drop(runtime_slot);

        self.inner.started.store(true, Ordering::Release);
        info!(threads = self.threads(), "service started");
        self.inner.handler.on_started();
        true
    }

    /// Stop the worker loops, cancelling outstanding work. After `stop`
    /// returns no further handler runs for this service's endpoints.
    ///
    /// Must not be called from one of the service's own worker threads.
    pub fn stop(&self) -> bool {
        let runtime = {
            let mut runtime_slot = self.inner.runtime.lock();
            if runtime_slot.is_none() {
                return false;
            }
            self.inner.started.store(false, Ordering::Release);
            if let Some(token) = self.inner.idle.lock().take() {
                token.cancel();
            }
            *self.inner.handle.lock() = None;
            runtime_slot.take()
        };

        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
        }
        info!("service stopped");
        self.inner.handler.on_stopped();
        true
    }

    /// Stop and start again with the retained configuration.
    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        self.start()
    }

    /// Enqueue a task onto the worker pool. Returns `false` when stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.try_handle() {
            Some(handle) => {
                handle.spawn(async move { task() });
                true
            }
            None => false,
        }
    }

    /// Run the task inline when called from one of this service's worker
    /// loops; otherwise behave as [`post`](Self::post).
    pub fn dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_inside() {
            task();
            true
        } else {
            self.post(task)
        }
    }

    /// Spawn a future onto the worker pool. Returns `false` when stopped.
    pub fn spawn<Fut>(&self, future: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.try_handle() {
            Some(handle) => {
                handle.spawn(future);
                true
            }
            None => {
                debug!("spawn rejected: service is stopped");
                false
            }
        }
    }

    /// Drive a future to completion from outside the worker pool. This is
    /// the synchronous surface used by blocking operations; calling it from
    /// a worker thread panics.
    pub fn block_on<Fut>(&self, future: Fut) -> Result<Fut::Output>
    where
        Fut: Future,
    {
        let handle = self.try_handle().ok_or(Error::ServiceNotStarted)?;
        Ok(handle.block_on(future))
    }

    /// A handle to the runtime, when started.
    pub fn handle(&self) -> Result<Handle> {
        self.try_handle().ok_or(Error::ServiceNotStarted)
    }

    /// Whether the current thread is one of this service's worker loops.
    pub fn is_inside(&self) -> bool {
        match (Handle::try_current(), self.try_handle()) {
            (Ok(current), Some(own)) => current.id() == own.id(),
            _ => false,
        }
    }

    fn try_handle(&self) -> Option<Handle> {
        if !self.is_started() {
            return None;
        }
        self.inner.handle.lock().clone()
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("threads", &self.threads())
            .field("polling", &self.inner.config.polling)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_start_stop() {
        let service = Service::new();
        assert!(!service.is_started());
        assert!(service.start());
        assert!(service.is_started());
        assert!(!service.start());
        assert!(service.stop());
        assert!(!service.is_started());
        assert!(!service.stop());
    }

    #[test]
    fn test_post_rejected_when_stopped() {
        let service = Service::new();
        assert!(!service.post(|| {}));
        assert!(service.start());
        assert!(service.post(|| {}));
        assert!(service.stop());
        assert!(!service.post(|| {}));
    }

    #[test]
    fn test_restart() {
        let service = Service::with_config(ServiceConfig {
            threads: Some(2),
            polling: false,
        });
        assert!(service.start());
        assert!(service.restart());
        assert!(service.is_started());
        assert!(service.stop());
    }

    #[test]
    fn test_lifecycle_hooks() {
        #[derive(Default)]
        struct Counting {
            started: AtomicUsize,
            stopped: AtomicUsize,
        }
        impl ServiceHandler for Counting {
            fn on_started(&self) {
                self.started.fetch_add(1, Ordering::Relaxed);
            }
            fn on_stopped(&self) {
                self.stopped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let hooks = Arc::new(Counting::default());
        let service = Service::with_handler(ServiceConfig::default(), hooks.clone());
        assert!(service.start());
        assert!(service.stop());
        assert_eq!(hooks.started.load(Ordering::Relaxed), 1);
        assert_eq!(hooks.stopped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispatch_runs_inline_on_worker() {
        let service = Service::new();
        assert!(service.start());

        let service_clone = service.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        assert!(service.post(move || {
            // From a worker loop, dispatch must run inline.
            let ran = std::sync::Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            assert!(service_clone.dispatch(move || flag.store(true, Ordering::Relaxed)));
            tx.send(ran.load(Ordering::Relaxed)).unwrap();
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(service.stop());
    }
}
