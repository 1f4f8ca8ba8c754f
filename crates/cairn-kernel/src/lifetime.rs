//! Service lifetimes.
//!
//! Every long-lived subsystem implements [`Service`] and is driven through a
//! [`Lifetime`], which owns the start/run/stop protocol and fault
//! containment:
//!
//! ```text
//! Created --start--> Starting --ok--> Running --stop--> Stopping --> Stopped
//!                        \                 \
//!                         `--error--> Faulted <--error--'
//! ```
//!
//! `Faulted` is absorbing: a faulted service can still be stopped (its stop
//! hook runs with the fault as cause) but never started again.  Cooperative
//! cancellation is never a fault; a run body that returns because its token
//! fired ends gracefully.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Constructed, never started.
    Created,
    /// `on_start` is executing.
    Starting,
    /// Started; `run` may be (or is being) driven.
    Running,
    /// `stop` is tearing the service down.
    Stopping,
    /// Stopped cleanly.  May be started again.
    Stopped,
    /// An unhandled error escaped a hook.  Absorbing.
    Faulted,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// A supervised unit of asynchronous work.
///
/// Only [`Service::on_run`] is mandatory.  Hooks receive the lifetime's
/// cancellation token, which is a child of whatever token the service was
/// started with.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Initialise the service.  Runs to completion before the lifetime
    /// reports `Running`.
    async fn on_start(&self, _token: &CancellationToken) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// The long-lived body.  Must return once `token` is cancelled.
    async fn on_run(&self, token: CancellationToken) -> std::result::Result<(), BoxError>;

    /// Tear the service down.  `cause` is the recorded fault, if any.
    async fn on_stop(&self, _cause: Option<&KernelError>) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lifetime
// ---------------------------------------------------------------------------

struct LifetimeInner {
    state: ServiceState,
    token: Option<CancellationToken>,
    cause: Option<KernelError>,
    stop_hook_ran: bool,
}

/// Drives one [`Service`] through its start/run/stop protocol.
///
/// Share it behind an `Arc`: `run` is usually awaited on a spawned task
/// while `stop` is called from elsewhere.
pub struct Lifetime {
    service: Arc<dyn Service>,
    inner: Mutex<LifetimeInner>,
    start_active: watch::Sender<bool>,
    run_active: watch::Sender<bool>,
}

/// Clears an in-flight flag even if the hook future is dropped mid-way.
struct ActiveGuard<'a>(&'a watch::Sender<bool>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Lifetime {
    /// Wrap `service` in a fresh lifetime in the `Created` state.
    pub fn new(service: Arc<dyn Service>) -> Arc<Self> {
        let (start_active, _) = watch::channel(false);
        let (run_active, _) = watch::channel(false);
        Arc::new(Self {
            service,
            inner: Mutex::new(LifetimeInner {
                state: ServiceState::Created,
                token: None,
                cause: None,
                stop_hook_ran: false,
            }),
            start_active,
            run_active,
        })
    }

    /// The wrapped service's name.
    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.lock().state
    }

    /// The recorded termination cause, if the service faulted.
    pub fn cause(&self) -> Option<KernelError> {
        self.lock().cause.clone()
    }

    /// Start the service under `parent`.
    ///
    /// Fails with [`KernelError::AlreadyStarted`] unless the service is
    /// `Created` or `Stopped`, and with [`KernelError::InvalidTransition`] if
    /// it has faulted.  An `on_start` failure faults the service and is
    /// returned as [`KernelError::Faulted`].
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let token = {
            let mut inner = self.lock();
            match inner.state {
                ServiceState::Created | ServiceState::Stopped => {}
                ServiceState::Faulted => {
                    return Err(KernelError::InvalidTransition {
                        service: self.name().to_string(),
                        reason: "cannot start a faulted service".into(),
                    });
                }
                other => {
                    return Err(KernelError::AlreadyStarted {
                        service: self.name().to_string(),
                        state: other.to_string(),
                    });
                }
            }
            let token = parent.child_token();
            inner.state = ServiceState::Starting;
            inner.token = Some(token.clone());
            inner.cause = None;
            inner.stop_hook_ran = false;
            self.start_active.send_replace(true);
            token
        };
        let _guard = ActiveGuard(&self.start_active);

        info!(service = self.name(), "service starting");

        match self.service.on_start(&token).await {
            Ok(()) => {
                let mut inner = self.lock();
                if inner.state != ServiceState::Starting {
                    // A concurrent stop won the race.
                    return Err(KernelError::Cancelled);
                }
                inner.state = ServiceState::Running;
                info!(service = self.name(), "service running");
                Ok(())
            }
            Err(err) if token.is_cancelled() || is_cancellation(&*err) => {
                let mut inner = self.lock();
                if inner.state == ServiceState::Starting {
                    inner.state = ServiceState::Stopped;
                }
                debug!(service = self.name(), "service start cancelled");
                Err(KernelError::Cancelled)
            }
            Err(err) => Err(self.fault(err)),
        }
    }

    /// Drive the service body until it returns.
    ///
    /// Graceful completion and cancellation return `Ok(())`.  Any other error
    /// faults the service, is recorded as its termination cause, and is
    /// returned to the caller.
    pub async fn run(&self) -> Result<()> {
        let token = {
            let inner = self.lock();
            if inner.state != ServiceState::Running {
                return Err(KernelError::InvalidTransition {
                    service: self.name().to_string(),
                    reason: format!("run requires a running service, found {}", inner.state),
                });
            }
            let token = inner
                .token
                .clone()
                .ok_or_else(|| KernelError::Internal("running service without a token".into()))?;
            if self.run_active.send_replace(true) {
                return Err(KernelError::InvalidTransition {
                    service: self.name().to_string(),
                    reason: "service is already being run".into(),
                });
            }
            token
        };
        let _guard = ActiveGuard(&self.run_active);

        match self.service.on_run(token.clone()).await {
            Ok(()) => {
                info!(service = self.name(), "service run completed");
                Ok(())
            }
            Err(err) if token.is_cancelled() || is_cancellation(&*err) => {
                debug!(service = self.name(), %err, "service run ended by cancellation");
                Ok(())
            }
            Err(err) => Err(self.fault(err)),
        }
    }

    /// Stop the service.
    ///
    /// Cancels the service token and waits for an in-flight `on_start` or
    /// `run` to return, then invokes `on_stop` with the recorded cause (if
    /// any).  `on_stop` therefore never overlaps the other hooks.  Calling
    /// `stop` again afterwards is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let token = {
            let mut inner = self.lock();
            match inner.state {
                ServiceState::Created => {
                    inner.state = ServiceState::Stopped;
                    inner.stop_hook_ran = true;
                    return Ok(());
                }
                ServiceState::Stopped | ServiceState::Stopping => return Ok(()),
                ServiceState::Faulted if inner.stop_hook_ran => return Ok(()),
                ServiceState::Faulted => {}
                ServiceState::Starting | ServiceState::Running => {
                    inner.state = ServiceState::Stopping;
                }
            }
            inner.stop_hook_ran = true;
            inner.token.clone()
        };

        info!(service = self.name(), "service stopping");

        if let Some(token) = token {
            token.cancel();
        }
        // The senders live in `self`, so these cannot observe a closed channel.
        let _ = self.start_active.subscribe().wait_for(|active| !*active).await;
        let _ = self.run_active.subscribe().wait_for(|active| !*active).await;

        // A start that failed while we waited may have recorded a fault.
        let cause = self.lock().cause.clone();
        debug!(service = self.name(), faulted = cause.is_some(), "running stop hook");
        let hook = self.service.on_stop(cause.as_ref()).await;

        let mut inner = self.lock();
        match hook {
            Ok(()) => {
                if inner.state == ServiceState::Stopping {
                    inner.state = ServiceState::Stopped;
                }
                info!(service = self.name(), state = %inner.state, "service stopped");
                Ok(())
            }
            Err(err) => {
                let fault = KernelError::Faulted {
                    service: self.name().to_string(),
                    cause: Arc::new(err),
                };
                error!(service = self.name(), error = %fault, "service stop hook failed");
                inner.state = ServiceState::Faulted;
                inner.cause.get_or_insert_with(|| fault.clone());
                Err(fault)
            }
        }
    }

    fn fault(&self, err: BoxError) -> KernelError {
        let fault = KernelError::Faulted {
            service: self.name().to_string(),
            cause: Arc::new(err),
        };
        let mut inner = self.lock();
        inner.state = ServiceState::Faulted;
        inner.cause = Some(fault.clone());
        error!(service = self.name(), error = %fault, "service faulted");
        fault
    }

    fn lock(&self) -> MutexGuard<'_, LifetimeInner> {
        // State updates never panic mid-way, so a poisoned guard is still
        // consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("service", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(inner.state, ServiceState::Running | ServiceState::Starting) {
            warn!(service = self.service.name(), "lifetime dropped without stop");
            if let Some(token) = &inner.token {
                token.cancel();
            }
        }
    }
}

/// `true` if `err` is (or wraps) kernel cancellation.
fn is_cancellation(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<KernelError>().is_some_and(KernelError::is_cancelled) {
            return true;
        }
        current = e.source();
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        fail_start: bool,
        fail_run: bool,
        starts: AtomicU32,
        stops: AtomicU32,
        stop_saw_fault: AtomicBool,
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_start(&self, _token: &CancellationToken) -> std::result::Result<(), BoxError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err("start exploded".into());
            }
            Ok(())
        }

        async fn on_run(&self, token: CancellationToken) -> std::result::Result<(), BoxError> {
            if self.fail_run {
                return Err("run exploded".into());
            }
            token.cancelled().await;
            Ok(())
        }

        async fn on_stop(&self, cause: Option<&KernelError>) -> std::result::Result<(), BoxError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stop_saw_fault.store(cause.is_some(), Ordering::SeqCst);
            Ok(())
        }
    }

    /// Records hook order; `on_start` ignores its token and takes a while.
    #[derive(Default)]
    struct SlowStart {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Service for SlowStart {
        fn name(&self) -> &str {
            "slow-start"
        }

        async fn on_start(&self, _token: &CancellationToken) -> std::result::Result<(), BoxError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.events.lock().unwrap().push("started");
            Ok(())
        }

        async fn on_run(&self, token: CancellationToken) -> std::result::Result<(), BoxError> {
            token.cancelled().await;
            Ok(())
        }

        async fn on_stop(&self, _cause: Option<&KernelError>) -> std::result::Result<(), BoxError> {
            self.events.lock().unwrap().push("stopped");
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_run_stop_happy_path() {
        let service = Arc::new(Recorder::default());
        let lifetime = Lifetime::new(service.clone());
        let root = CancellationToken::new();

        assert_eq!(lifetime.state(), ServiceState::Created);
        lifetime.start(&root).await.unwrap();
        assert_eq!(lifetime.state(), ServiceState::Running);

        let runner = {
            let lifetime = Arc::clone(&lifetime);
            tokio::spawn(async move { lifetime.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        lifetime.stop().await.unwrap();
        assert_eq!(lifetime.state(), ServiceState::Stopped);
        runner.await.unwrap().unwrap();
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert!(!service.stop_saw_fault.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let lifetime = Lifetime::new(Arc::new(Recorder::default()));
        let root = CancellationToken::new();
        lifetime.start(&root).await.unwrap();

        let err = lifetime.start(&root).await.unwrap_err();
        assert!(matches!(err, KernelError::AlreadyStarted { .. }));
        lifetime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let service = Arc::new(Recorder::default());
        let lifetime = Lifetime::new(service.clone());
        let root = CancellationToken::new();

        lifetime.start(&root).await.unwrap();
        lifetime.stop().await.unwrap();
        lifetime.start(&root).await.unwrap();
        assert_eq!(lifetime.state(), ServiceState::Running);
        assert_eq!(service.starts.load(Ordering::SeqCst), 2);
        lifetime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_failure_faults_and_propagates() {
        let service = Arc::new(Recorder {
            fail_start: true,
            ..Recorder::default()
        });
        let lifetime = Lifetime::new(service.clone());

        let err = lifetime.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KernelError::Faulted { .. }));
        assert_eq!(lifetime.state(), ServiceState::Faulted);
        assert!(lifetime.cause().is_some());

        let again = lifetime.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(again, KernelError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn run_failure_is_recorded_and_stop_sees_cause() {
        let service = Arc::new(Recorder {
            fail_run: true,
            ..Recorder::default()
        });
        let lifetime = Lifetime::new(service.clone());
        lifetime.start(&CancellationToken::new()).await.unwrap();

        let err = lifetime.run().await.unwrap_err();
        assert!(err.to_string().contains("run exploded"));
        assert_eq!(lifetime.state(), ServiceState::Faulted);

        lifetime.stop().await.unwrap();
        assert!(service.stop_saw_fault.load(Ordering::SeqCst));
        // Faulted is absorbing.
        assert_eq!(lifetime.state(), ServiceState::Faulted);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let service = Arc::new(Recorder::default());
        let lifetime = Lifetime::new(service.clone());
        lifetime.start(&CancellationToken::new()).await.unwrap();

        lifetime.stop().await.unwrap();
        lifetime.stop().await.unwrap();
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parent_cancellation_ends_run_gracefully() {
        let lifetime = Lifetime::new(Arc::new(Recorder::default()));
        let root = CancellationToken::new();
        lifetime.start(&root).await.unwrap();

        let runner = {
            let lifetime = Arc::clone(&lifetime);
            tokio::spawn(async move { lifetime.run().await })
        };
        root.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(lifetime.state(), ServiceState::Running);
        lifetime.stop().await.unwrap();
        assert_eq!(lifetime.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn run_requires_start() {
        let lifetime = Lifetime::new(Arc::new(Recorder::default()));
        let err = lifetime.run().await.unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stop_during_start_waits_for_the_start_hook() {
        let service = Arc::new(SlowStart::default());
        let lifetime = Lifetime::new(service.clone());

        let starting = {
            let lifetime = Arc::clone(&lifetime);
            tokio::spawn(async move { lifetime.start(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lifetime.state(), ServiceState::Starting);

        lifetime.stop().await.unwrap();
        assert_eq!(*service.events.lock().unwrap(), vec!["started", "stopped"]);
        assert_eq!(lifetime.state(), ServiceState::Stopped);
        assert!(matches!(
            starting.await.unwrap(),
            Err(KernelError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn stop_before_start_skips_hooks() {
        let service = Arc::new(Recorder::default());
        let lifetime = Lifetime::new(service.clone());
        lifetime.stop().await.unwrap();
        assert_eq!(lifetime.state(), ServiceState::Stopped);
        assert_eq!(service.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_is_detected_through_sources() {
        let direct: BoxError = Box::new(KernelError::Cancelled);
        assert!(is_cancellation(&*direct));

        let other: BoxError = "nope".into();
        assert!(!is_cancellation(&*other));
    }
}
