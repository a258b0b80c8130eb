//! Graceful shutdown and role supervision.
//!
//! A [`ShutdownSignal`] is triggered once, by SIGINT/SIGTERM or
//! programmatically. Every long-running role holds a [`ShutdownListener`],
//! finishes its current iteration when the signal fires, does its owed
//! cleanup and returns.
//!
//! A [`Supervisor`] owns a set of named roles. It moves
//! `Down -> GoingUp -> Up` as roles are started, and `Up -> GoingDown -> Down`
//! once shutdown is requested and every role has returned. The first role
//! that fails shuts the rest down.
//!
//! # Example
//!
//! ```rust,ignore
//! use redq::supervisor::{ShutdownSignal, Supervisor};
//!
//! let shutdown = ShutdownSignal::new();
//! let mut supervisor = Supervisor::new("consumer", shutdown.clone());
//! supervisor.spawn("scheduler", |listener| scheduler.run(listener));
//! supervisor.spawn("worker:orders", |listener| worker.run(listener));
//!
//! tokio::spawn(async move { shutdown.wait().await });
//! supervisor.run().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::Error;

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across roles.
///
/// The signal is level-triggered: a listener created after the trigger
/// still observes it.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    /// Create a new shutdown signal with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    /// How long a supervisor waits for its roles after shutdown is requested.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        self.sender.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown programmatically.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered programmatically");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been requested. Resolves immediately if it
    /// already was, or if the signal itself is gone.
    pub async fn recv(&mut self) {
        let _ = self.receiver.wait_for(|triggered| *triggered).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Lifecycle of a [`Supervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Down,
    GoingUp,
    Up,
    GoingDown,
}

/// Runs named roles until shutdown and waits for all of them to finish.
pub struct Supervisor {
    name: String,
    shutdown: ShutdownSignal,
    tasks: JoinSet<(String, Result<(), Error>)>,
    roles: Vec<String>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, shutdown: ShutdownSignal) -> Self {
        let (state, _) = watch::channel(SupervisorState::Down);
        Self {
            name: name.into(),
            shutdown,
            tasks: JoinSet::new(),
            roles: Vec::new(),
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Observe state changes from outside the supervisor.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Start a role. It receives its own listener and must return once
    /// shutdown is requested.
    pub fn spawn<F, Fut>(&mut self, role: impl Into<String>, start: F)
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let role = role.into();
        self.state.send_replace(SupervisorState::GoingUp);
        info!(supervisor = %self.name, role = %role, "Starting role");

        let future = start(self.shutdown.subscribe());
        let name = role.clone();
        self.tasks.spawn(async move { (name, future.await) });
        self.roles.push(role);
    }

    /// Wait until shutdown is requested and every role has returned.
    ///
    /// Returns the first role error. Roles still running when the shutdown
    /// timeout elapses are aborted.
    pub async fn run(mut self) -> Result<(), Error> {
        self.state.send_replace(SupervisorState::Up);
        info!(supervisor = %self.name, roles = self.roles.len(), "Supervisor up");

        let mut first_error: Option<Error> = None;
        let mut listener = self.shutdown.subscribe();

        // Phase 1: everything running.
        loop {
            tokio::select! {
                _ = listener.recv() => break,
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(result) => {
                        if let Some(e) = record(&self.name, result) {
                            first_error.get_or_insert(e);
                            self.shutdown.trigger();
                            break;
                        }
                    }
                },
            }
        }

        // Phase 2: draining.
        self.state.send_replace(SupervisorState::GoingDown);
        self.shutdown.trigger();
        let timeout = self.shutdown.timeout();
        let name = self.name.as_str();
        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(timeout, async {
            let mut errors = Vec::new();
            while let Some(result) = tasks.join_next().await {
                if let Some(e) = record(name, result) {
                    errors.push(e);
                }
            }
            errors
        })
        .await;

        match drained {
            Ok(errors) => {
                if first_error.is_none() {
                    first_error = errors.into_iter().next();
                }
            }
            Err(_) => {
                warn!(
                    supervisor = %self.name,
                    timeout_secs = timeout.as_secs(),
                    "Shutdown timeout reached, aborting remaining roles"
                );
                self.tasks.abort_all();
                while self.tasks.join_next().await.is_some() {}
            }
        }

        self.state.send_replace(SupervisorState::Down);
        info!(supervisor = %self.name, "Supervisor down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn record(
    supervisor: &str,
    result: Result<(String, Result<(), Error>), tokio::task::JoinError>,
) -> Option<Error> {
    match result {
        Ok((role, Ok(()))) => {
            info!(supervisor = %supervisor, role = %role, "Role stopped");
            None
        }
        Ok((role, Err(e))) => {
            error!(supervisor = %supervisor, role = %role, error = %e, "Role failed");
            Some(e)
        }
        Err(e) => {
            error!(supervisor = %supervisor, error = %e, "Role panicked");
            Some(Error::RoleFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.timeout(), Duration::from_secs(30));
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), listener.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_listener_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let mut listener = signal.subscribe();
        assert!(listener.is_shutdown());
        listener.recv().await;
    }

    #[tokio::test]
    async fn test_supervisor_waits_for_every_role() {
        let signal = ShutdownSignal::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new("test", signal.clone());

        for role in ["a", "b", "c"] {
            let stopped = stopped.clone();
            supervisor.spawn(role, move |mut listener| async move {
                listener.recv().await;
                stopped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(supervisor.state(), SupervisorState::GoingUp);
        let states = supervisor.watch_state();

        let handle = tokio::spawn(supervisor.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*states.borrow(), SupervisorState::Up);

        signal.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert_eq!(*states.borrow(), SupervisorState::Down);
    }

    #[tokio::test]
    async fn test_failing_role_stops_the_others() {
        let signal = ShutdownSignal::new();
        let mut supervisor = Supervisor::new("test", signal.clone());

        supervisor.spawn("steady", |mut listener| async move {
            listener.recv().await;
            Ok(())
        });
        supervisor.spawn("broken", |_| async move {
            Err(Error::RoleFailed("boom".to_string()))
        });

        let result = supervisor.run().await;
        assert!(matches!(result, Err(Error::RoleFailed(_))));
        assert!(signal.is_shutdown());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_role_is_aborted_after_timeout() {
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(1));
        let mut supervisor = Supervisor::new("test", signal.clone());
        supervisor.spawn("stuck", |_| async move {
            std::future::pending::<()>().await;
            Ok(())
        });

        signal.trigger();
        assert!(supervisor.run().await.is_ok());
    }
}
