use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::{Engine, EngineError, EngineLauncher, LaunchOptions};

/// Launch generation of an engine process. Increases with every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(u64);

impl EngineId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Absent,
    Launching,
    Ready,
    Terminating,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Absent => "absent",
            EngineState::Launching => "launching",
            EngineState::Ready => "ready",
            EngineState::Terminating => "terminating",
        }
    }
}

/// Point-in-time view of the supervisor, readable without the transition lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub generation: Option<EngineId>,
    pub launched_at: Option<OffsetDateTime>,
    pub launches: u64,
    pub restarts: u64,
}

impl EngineStatus {
    fn absent() -> Self {
        Self {
            state: EngineState::Absent,
            generation: None,
            launched_at: None,
            launches: 0,
            restarts: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineUnavailable {
    #[error(transparent)]
    Launch(#[from] EngineError),
    #[error("engine supervisor has shut down")]
    ShutDown,
}

/// Capability to open sessions on one specific engine process.
#[derive(Clone)]
pub struct EngineHandle {
    id: EngineId,
    launched_at: OffsetDateTime,
    engine: Arc<dyn Engine>,
}

impl EngineHandle {
    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn launched_at(&self) -> OffsetDateTime {
        self.launched_at
    }

    pub fn is_alive(&self) -> bool {
        self.engine.is_alive()
    }

    pub(super) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.id)
            .field("launched_at", &self.launched_at)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    current: Option<EngineHandle>,
    /// Newest failed generation a recovery has already been attempted for.
    recovered: Option<EngineId>,
    closed: bool,
}

/// Owner of the single engine process.
///
/// Every lifecycle transition (launch, restart, terminate) runs while holding
/// `slot`, so two callers can never race each other into two live engines.
/// Callers that find a launch in progress wait on the lock and then reuse the
/// fresh handle. Status readers go through a watch channel instead of the lock.
pub struct EngineSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    options: LaunchOptions,
    slot: Mutex<Slot>,
    status: watch::Sender<EngineStatus>,
    generations: AtomicU64,
}

impl EngineSupervisor {
    pub fn new(launcher: Arc<dyn EngineLauncher>, options: LaunchOptions) -> Self {
        let (status, _) = watch::channel(EngineStatus::absent());
        Self {
            launcher,
            options,
            slot: Mutex::new(Slot::default()),
            status,
            generations: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    /// Return the live engine, launching one if none is running.
    pub async fn ensure_engine(&self) -> Result<EngineHandle, EngineUnavailable> {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = slot.current.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            warn!(
                target = "folio::engine",
                generation = handle.id().get(),
                "engine process is no longer alive; relaunching"
            );
            self.terminate_current(&mut slot, "dead").await;
        }

        self.launch(&mut slot).await
    }

    /// Tear down the current engine (best effort) and launch a replacement.
    pub async fn restart_engine(&self) -> Result<EngineHandle, EngineUnavailable> {
        let mut slot = self.slot.lock().await;
        self.restart(&mut slot).await
    }

    /// Restart after a failure observed on engine `failed`.
    ///
    /// When a different live engine is already current, some other caller has
    /// recovered first and that engine is returned untouched. When a recovery
    /// for `failed` (or a newer generation) was already attempted and left no
    /// engine behind, nothing is relaunched here; the next
    /// [`ensure_engine`](Self::ensure_engine) launches lazily instead.
    pub async fn recover(&self, failed: EngineId) -> Result<EngineHandle, EngineUnavailable> {
        let mut slot = self.slot.lock().await;

        if let Some(current) = slot.current.as_ref() {
            if current.id() != failed && current.is_alive() {
                debug!(
                    target = "folio::engine",
                    failed = failed.get(),
                    current = current.id().get(),
                    "engine already replaced; skipping restart"
                );
                return Ok(current.clone());
            }
        }

        if slot.current.is_none() && slot.recovered.is_some_and(|last| failed <= last) {
            debug!(
                target = "folio::engine",
                failed = failed.get(),
                "recovery already attempted for this generation; deferring relaunch"
            );
            return Err(EngineUnavailable::Launch(EngineError::NotRunning));
        }

        slot.recovered = Some(slot.recovered.map_or(failed, |last| last.max(failed)));
        self.restart(&mut slot).await
    }

    /// Terminate the engine and refuse further launches. Safe to repeat.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if !slot.closed {
            info!(target = "folio::engine", "engine supervisor shutting down");
        }
        slot.closed = true;
        self.terminate_current(&mut slot, "shutdown").await;
    }

    async fn restart(&self, slot: &mut Slot) -> Result<EngineHandle, EngineUnavailable> {
        if slot.closed {
            return Err(EngineUnavailable::ShutDown);
        }

        let previous = slot.current.as_ref().map(EngineHandle::id);
        counter!("folio_engine_restart_total").increment(1);
        self.status.send_modify(|status| status.restarts += 1);
        info!(
            target = "folio::engine",
            previous = ?previous,
            "restarting engine"
        );

        self.terminate_current(slot, "restart").await;
        self.launch(slot).await
    }

    async fn launch(&self, slot: &mut Slot) -> Result<EngineHandle, EngineUnavailable> {
        if slot.closed {
            return Err(EngineUnavailable::ShutDown);
        }

        self.status
            .send_modify(|status| status.state = EngineState::Launching);
        let guard = TransitionGuard::new(&self.status);
        let started_at = Instant::now();

        match self.launcher.launch(&self.options).await {
            Ok(engine) => {
                let id = EngineId(self.generations.fetch_add(1, Ordering::Relaxed) + 1);
                let launched_at = OffsetDateTime::now_utc();
                let handle = EngineHandle {
                    id,
                    launched_at,
                    engine,
                };
                slot.current = Some(handle.clone());
                guard.disarm();

                self.status.send_modify(|status| {
                    status.state = EngineState::Ready;
                    status.generation = Some(id);
                    status.launched_at = Some(launched_at);
                    status.launches += 1;
                });

                let elapsed = started_at.elapsed();
                counter!("folio_engine_launch_total").increment(1);
                histogram!("folio_engine_launch_ms").record(elapsed.as_secs_f64() * 1000.0);
                info!(
                    target = "folio::engine",
                    generation = id.get(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "engine launched"
                );
                Ok(handle)
            }
            Err(err) => {
                drop(guard);
                counter!("folio_engine_launch_failure_total").increment(1);
                warn!(
                    target = "folio::engine",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error = %err,
                    "engine launch failed"
                );
                Err(EngineUnavailable::Launch(err))
            }
        }
    }

    async fn terminate_current(&self, slot: &mut Slot, reason: &'static str) {
        let Some(handle) = slot.current.take() else {
            return;
        };

        self.status
            .send_modify(|status| status.state = EngineState::Terminating);
        let _guard = TransitionGuard::new(&self.status);
        let started_at = Instant::now();

        match handle.engine.terminate().await {
            Ok(()) => info!(
                target = "folio::engine",
                generation = handle.id.get(),
                reason,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "engine terminated"
            ),
            Err(err) => warn!(
                target = "folio::engine",
                generation = handle.id.get(),
                reason,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                error = %err,
                "engine termination failed; handle discarded"
            ),
        }
    }
}

/// Publishes `Absent` when dropped while armed, so a transition cut short by
/// an error or a cancelled caller never leaves a stale state behind.
struct TransitionGuard<'a> {
    status: &'a watch::Sender<EngineStatus>,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(status: &'a watch::Sender<EngineStatus>) -> Self {
        Self {
            status,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.send_modify(|status| {
                status.state = EngineState::Absent;
                status.generation = None;
                status.launched_at = None;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::testing::ScriptedLauncher;
    use std::time::Duration;

    fn supervisor(launcher: &ScriptedLauncher) -> Arc<EngineSupervisor> {
        Arc::new(EngineSupervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::default(),
        ))
    }

    #[tokio::test]
    async fn ensure_engine_launches_lazily_and_reuses_the_handle() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        assert_eq!(supervisor.status().state, EngineState::Absent);
        assert_eq!(launcher.launches(), 0);

        let first = supervisor.ensure_engine().await.expect("engine");
        let second = supervisor.ensure_engine().await.expect("engine");

        assert_eq!(first.id(), second.id());
        assert_eq!(launcher.launches(), 1);
        let status = supervisor.status();
        assert!(status.is_ready());
        assert_eq!(status.generation, Some(first.id()));
        assert_eq!(status.launches, 1);
    }

    #[tokio::test]
    async fn launch_receives_container_and_font_arguments() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        supervisor.ensure_engine().await.expect("engine");

        let args = launcher.launch_args();
        assert!(args.iter().any(|arg| arg == "--no-sandbox"));
        assert!(args.iter().any(|arg| arg == "--font-render-hinting=none"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_a_single_launch() {
        let launcher = ScriptedLauncher::new();
        launcher.set_launch_delay(Duration::from_millis(50));
        let supervisor = supervisor(&launcher);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.ensure_engine().await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            let handle = task.await.expect("join").expect("engine");
            ids.push(handle.id());
        }

        assert_eq!(launcher.launches(), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(launcher.max_live_engines(), 1);
    }

    #[tokio::test]
    async fn launch_failure_leaves_supervisor_absent() {
        let launcher = ScriptedLauncher::new();
        launcher.fail_launches(true);
        let supervisor = supervisor(&launcher);

        let err = supervisor.ensure_engine().await.expect_err("launch fails");
        assert!(matches!(err, EngineUnavailable::Launch(EngineError::Launch(_))));
        let status = supervisor.status();
        assert_eq!(status.state, EngineState::Absent);
        assert_eq!(status.generation, None);

        launcher.fail_launches(false);
        let handle = supervisor.ensure_engine().await.expect("engine after recovery");
        assert_eq!(handle.id().get(), 1);
    }

    #[tokio::test]
    async fn dead_engine_is_replaced_on_next_ensure() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        let first = supervisor.ensure_engine().await.expect("engine");

        launcher.crash_current();
        assert!(!first.is_alive());

        let second = supervisor.ensure_engine().await.expect("engine");
        assert_ne!(first.id(), second.id());
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.live_engines(), 1);
    }

    #[tokio::test]
    async fn restart_replaces_the_engine_even_when_termination_fails() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        let first = supervisor.ensure_engine().await.expect("engine");

        launcher.fail_terminations(true);
        let second = supervisor.restart_engine().await.expect("restart");

        assert_ne!(first.id(), second.id());
        assert_eq!(launcher.terminations(), 1);
        let status = supervisor.status();
        assert_eq!(status.restarts, 1);
        assert_eq!(status.generation, Some(second.id()));
    }

    #[tokio::test]
    async fn restart_without_engine_launches_one() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);

        supervisor.restart_engine().await.expect("restart");
        assert_eq!(launcher.launches(), 1);
        assert_eq!(launcher.terminations(), 0);
    }

    #[tokio::test]
    async fn failed_restart_records_absent_state() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        supervisor.ensure_engine().await.expect("engine");

        launcher.fail_launches(true);
        supervisor.restart_engine().await.expect_err("relaunch fails");

        assert_eq!(supervisor.status().state, EngineState::Absent);
        assert_eq!(launcher.live_engines(), 0);
    }

    #[tokio::test]
    async fn recover_skips_restart_once_engine_was_replaced() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        let stale = supervisor.ensure_engine().await.expect("engine");

        let fresh = supervisor.recover(stale.id()).await.expect("recover");
        assert_ne!(fresh.id(), stale.id());

        let again = supervisor.recover(stale.id()).await.expect("recover");
        assert_eq!(again.id(), fresh.id());
        assert_eq!(launcher.launches(), 2);
        assert_eq!(supervisor.status().restarts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_relaunch_is_attempted_once_per_generation() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        let first = supervisor.ensure_engine().await.expect("engine");

        launcher.crash_current();
        launcher.fail_launches(true);
        launcher.set_launch_delay(Duration::from_millis(20));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                let failed = first.id();
                tokio::spawn(async move { supervisor.recover(failed).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.expect("join").is_err());
        }

        let status = supervisor.status();
        assert_eq!(status.restarts, 1);
        assert_eq!(status.state, EngineState::Absent);

        launcher.fail_launches(false);
        let next = supervisor.ensure_engine().await.expect("lazy relaunch");
        assert!(next.id() > first.id());

        let stale = supervisor.recover(first.id()).await.expect("current engine");
        assert_eq!(stale.id(), next.id());
        assert_eq!(supervisor.status().restarts, 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_safe_without_engine() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);

        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(launcher.terminations(), 0);
        assert_eq!(supervisor.status().state, EngineState::Absent);
    }

    #[tokio::test]
    async fn shutdown_terminates_once_and_blocks_relaunch() {
        let launcher = ScriptedLauncher::new();
        let supervisor = supervisor(&launcher);
        supervisor.ensure_engine().await.expect("engine");

        supervisor.shutdown().await;
        supervisor.shutdown().await;

        assert_eq!(launcher.terminations(), 1);
        assert_eq!(launcher.live_engines(), 0);
        assert!(matches!(
            supervisor.ensure_engine().await,
            Err(EngineUnavailable::ShutDown)
        ));
        assert!(matches!(
            supervisor.restart_engine().await,
            Err(EngineUnavailable::ShutDown)
        ));
        assert_eq!(launcher.launches(), 1);
    }
}
