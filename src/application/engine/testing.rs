//! Scripted in-memory engine for exercising supervisor, session and service
//! behaviour without a browser.
//!
//! [`ScriptedLauncher`] is cheap to clone; every clone shares the same
//! counters and fault queue, so a test keeps one clone for assertions and
//! hands another to the [`EngineSupervisor`](super::EngineSupervisor).
//!
//! ```
//! use std::sync::Arc;
//! use folio::application::engine::{EngineSupervisor, LaunchOptions};
//! use folio::application::engine::testing::{Fault, FaultStage, ScriptedLauncher};
//!
//! let launcher = ScriptedLauncher::new();
//! launcher.inject(Fault::Crash(FaultStage::PrintPdf));
//! let supervisor = EngineSupervisor::new(Arc::new(launcher.clone()), LaunchOptions::default());
//! assert_eq!(launcher.launches(), 0);
//! # drop(supervisor);
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use url::Url;

use super::{Engine, EngineError, EngineLauncher, LaunchOptions, PdfOptions, Surface, WaitPolicy};

/// Where a scripted fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStage {
    OpenSurface,
    Navigate,
    SetContent,
    PrintPdf,
}

/// Misbehaviour applied to the next surface that reaches the given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The operation returns a protocol error; the engine stays healthy.
    Fail(FaultStage),
    /// The operation fails and the engine process dies with it.
    Crash(FaultStage),
    /// The operation never completes.
    Hang(FaultStage),
    /// Rasterisation returns bytes without a PDF signature.
    CorruptPdf,
}

impl Fault {
    fn stage(self) -> FaultStage {
        match self {
            Fault::Fail(stage) | Fault::Crash(stage) | Fault::Hang(stage) => stage,
            Fault::CorruptPdf => FaultStage::PrintPdf,
        }
    }
}

#[derive(Default)]
struct Shared {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    surfaces_opened: AtomicUsize,
    surfaces_closed: AtomicUsize,
    live_engines: AtomicUsize,
    max_live_engines: AtomicUsize,
    fail_launches: AtomicBool,
    fail_terminations: AtomicBool,
    launch_delay: Mutex<Duration>,
    faults: Mutex<VecDeque<Fault>>,
    launch_args: Mutex<Vec<String>>,
    loaded: Mutex<Vec<String>>,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn take_fault(&self, stage: FaultStage) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let position = faults.iter().position(|fault| fault.stage() == stage)?;
        faults.remove(position)
    }

    fn engine_died(&self, alive: &AtomicBool) {
        if alive.swap(false, Ordering::AcqRel) {
            self.live_engines.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    shared: Arc<Shared>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.shared.fail_launches.store(fail, Ordering::Release);
    }

    pub fn fail_terminations(&self, fail: bool) {
        self.shared.fail_terminations.store(fail, Ordering::Release);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *lock(&self.shared.launch_delay) = delay;
    }

    /// Queue a fault for the next surface operation at the fault's stage.
    pub fn inject(&self, fault: Fault) {
        lock(&self.shared.faults).push_back(fault);
    }

    /// Kill the most recently launched engine as if the process crashed.
    pub fn crash_current(&self) {
        if let Some(alive) = lock(&self.shared.current).as_ref() {
            self.shared.engine_died(alive);
        }
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::Acquire)
    }

    pub fn terminations(&self) -> usize {
        self.shared.terminations.load(Ordering::Acquire)
    }

    pub fn surfaces_opened(&self) -> usize {
        self.shared.surfaces_opened.load(Ordering::Acquire)
    }

    pub fn surfaces_closed(&self) -> usize {
        self.shared.surfaces_closed.load(Ordering::Acquire)
    }

    pub fn live_engines(&self) -> usize {
        self.shared.live_engines.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously live engines ever observed.
    pub fn max_live_engines(&self) -> usize {
        self.shared.max_live_engines.load(Ordering::Acquire)
    }

    /// Arguments passed to the most recent launch.
    pub fn launch_args(&self) -> Vec<String> {
        lock(&self.shared.launch_args).clone()
    }

    /// URLs navigated to and HTML documents loaded, in order.
    pub fn loaded_documents(&self) -> Vec<String> {
        lock(&self.shared.loaded).clone()
    }
}

#[async_trait]
impl EngineLauncher for ScriptedLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Engine>, EngineError> {
        let delay = *lock(&self.shared.launch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.shared.fail_launches.load(Ordering::Acquire) {
            return Err(EngineError::launch("scripted launch failure"));
        }

        *lock(&self.shared.launch_args) = options.engine_args();
        self.shared.launches.fetch_add(1, Ordering::AcqRel);
        let live = self.shared.live_engines.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared
            .max_live_engines
            .fetch_max(live, Ordering::AcqRel);

        let alive = Arc::new(AtomicBool::new(true));
        *lock(&self.shared.current) = Some(Arc::clone(&alive));

        Ok(Arc::new(ScriptedEngine {
            shared: Arc::clone(&self.shared),
            alive,
        }))
    }
}

struct ScriptedEngine {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn new_surface(&self) -> Result<Box<dyn Surface>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::NotRunning);
        }
        let surface = ScriptedSurface {
            shared: Arc::clone(&self.shared),
            alive: Arc::clone(&self.alive),
            document: None,
        };
        surface.apply_fault(FaultStage::OpenSurface).await?;

        self.shared.surfaces_opened.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(surface))
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        self.shared.terminations.fetch_add(1, Ordering::AcqRel);
        self.shared.engine_died(&self.alive);
        if self.shared.fail_terminations.load(Ordering::Acquire) {
            return Err(EngineError::terminate("scripted termination failure"));
        }
        Ok(())
    }
}

struct ScriptedSurface {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    document: Option<String>,
}

impl ScriptedSurface {
    async fn apply_fault(&self, stage: FaultStage) -> Result<Option<Fault>, EngineError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(EngineError::NotRunning);
        }

        match self.shared.take_fault(stage) {
            Some(Fault::Fail(_)) => Err(EngineError::protocol(format!(
                "scripted failure at {stage:?}"
            ))),
            Some(Fault::Crash(_)) => {
                self.shared.engine_died(&self.alive);
                Err(EngineError::protocol(format!("scripted crash at {stage:?}")))
            }
            Some(Fault::Hang(_)) => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Surface for ScriptedSurface {
    async fn navigate(&mut self, url: &Url, _wait: WaitPolicy) -> Result<(), EngineError> {
        self.apply_fault(FaultStage::Navigate).await?;
        lock(&self.shared.loaded).push(url.to_string());
        self.document = Some(url.to_string());
        Ok(())
    }

    async fn set_content(&mut self, html: &str, _wait: WaitPolicy) -> Result<(), EngineError> {
        self.apply_fault(FaultStage::SetContent).await?;
        lock(&self.shared.loaded).push(html.to_string());
        self.document = Some(html.to_string());
        Ok(())
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        if let Some(Fault::CorruptPdf) = self.apply_fault(FaultStage::PrintPdf).await? {
            return Ok(b"<html>not a pdf</html>".to_vec());
        }

        let document = self
            .document
            .as_deref()
            .ok_or_else(|| EngineError::protocol("no document loaded"))?;
        Ok(format!(
            "%PDF-1.7\n% scripted {:.2}x{:.2}in\n% {}\n%%EOF\n",
            options.paper_width_in,
            options.paper_height_in,
            document.len()
        )
        .into_bytes())
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        self.shared.surfaces_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
