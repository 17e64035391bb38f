//! Process shutdown coordination.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::application::engine::EngineSupervisor;

/// Gate between "serving" and "shutting down".
///
/// `begin_shutdown` closes the gate for new work and wakes whoever waits on
/// [`stopped`](Self::stopped). `shutdown` additionally tears the engine down,
/// exactly once no matter how many paths call it.
pub struct ProcessLifecycle {
    supervisor: Arc<EngineSupervisor>,
    accepting: watch::Sender<bool>,
    engine_released: AtomicBool,
}

impl ProcessLifecycle {
    pub fn new(supervisor: Arc<EngineSupervisor>) -> Self {
        let (accepting, _) = watch::channel(true);
        Self {
            supervisor,
            accepting,
            engine_released: AtomicBool::new(false),
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    /// Stop accepting new conversions. Returns `false` if already stopped.
    pub fn begin_shutdown(&self, reason: &str) -> bool {
        let first = self.accepting.send_if_modified(|accepting| {
            let was_accepting = *accepting;
            *accepting = false;
            was_accepting
        });
        if first {
            info!(
                target = "folio::lifecycle",
                reason, "no longer accepting conversions"
            );
        }
        first
    }

    /// Resolves once shutdown has begun.
    pub async fn stopped(&self) {
        let mut receiver = self.accepting.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = receiver.wait_for(|accepting| !*accepting).await;
    }

    /// Wait for SIGINT or SIGTERM, then close the gate.
    pub async fn listen_for_signals(&self) {
        tokio::select! {
            signal = termination_signal() => {
                self.begin_shutdown(signal);
            }
            () = self.stopped() => {}
        }
    }

    /// Close the gate and terminate the engine. Only the first call does any
    /// work; it returns `true`.
    pub async fn shutdown(&self) -> bool {
        self.begin_shutdown("exit");
        if self.engine_released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.supervisor.shutdown().await;
        info!(target = "folio::lifecycle", "engine released");
        true
    }
}

async fn termination_signal() -> &'static str {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(
                target = "folio::lifecycle",
                error = %err,
                "failed to listen for SIGINT"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(
                    target = "folio::lifecycle",
                    error = %err,
                    "failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::engine::testing::ScriptedLauncher;
    use crate::application::engine::{EngineState, LaunchOptions};

    fn lifecycle(launcher: &ScriptedLauncher) -> (Arc<EngineSupervisor>, ProcessLifecycle) {
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::default(),
        ));
        let lifecycle = ProcessLifecycle::new(Arc::clone(&supervisor));
        (supervisor, lifecycle)
    }

    #[tokio::test]
    async fn shutdown_terminates_engine_exactly_once() {
        let launcher = ScriptedLauncher::new();
        let (supervisor, lifecycle) = lifecycle(&launcher);
        supervisor.ensure_engine().await.expect("engine");

        assert!(lifecycle.shutdown().await);
        assert!(!lifecycle.shutdown().await);

        assert_eq!(launcher.terminations(), 1);
        assert_eq!(launcher.live_engines(), 0);
        assert_eq!(supervisor.status().state, EngineState::Absent);
        assert!(!lifecycle.is_accepting());
    }

    #[tokio::test]
    async fn shutdown_without_engine_is_safe() {
        let launcher = ScriptedLauncher::new();
        let (_supervisor, lifecycle) = lifecycle(&launcher);

        assert!(lifecycle.shutdown().await);
        assert_eq!(launcher.launches(), 0);
        assert_eq!(launcher.terminations(), 0);
    }

    #[tokio::test]
    async fn begin_shutdown_reports_first_caller_and_wakes_waiters() {
        let launcher = ScriptedLauncher::new();
        let (_supervisor, lifecycle) = lifecycle(&launcher);
        let lifecycle = Arc::new(lifecycle);

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.stopped().await })
        };

        assert!(lifecycle.is_accepting());
        assert!(lifecycle.begin_shutdown("test"));
        assert!(!lifecycle.begin_shutdown("test"));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn signal_listener_returns_when_shutdown_begins_elsewhere() {
        let launcher = ScriptedLauncher::new();
        let (_supervisor, lifecycle) = lifecycle(&launcher);
        lifecycle.begin_shutdown("test");

        tokio::time::timeout(Duration::from_secs(1), lifecycle.listen_for_signals())
            .await
            .expect("listener returned");
    }
}
