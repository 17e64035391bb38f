//! Rendering engine capability interface and its lifecycle management.
//!
//! The supervisor and session code in this module only talk to the traits
//! below. The production adapter lives in [`crate::infra::chromium`]; the
//! scripted double in `testing` backs the test suites and is only built for
//! tests or with the `test-support` feature.

pub mod session;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub use session::{RenderProfile, RenderSession, RenderTimeouts};
pub use supervisor::{
    EngineHandle, EngineId, EngineState, EngineStatus, EngineSupervisor, EngineUnavailable,
};

/// Arguments that make the engine usable inside containers.
const CONTAINER_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-extensions",
    "--disable-background-networking",
    "--mute-audio",
];

/// Arguments that pin glyph rasterisation so repeated renders match.
const DETERMINISTIC_FONT_ARGS: &[&str] = &[
    "--font-render-hinting=none",
    "--disable-font-subpixel-positioning",
    "--disable-lcd-text",
];

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine launch failed: {0}")]
    Launch(String),
    #[error("engine is not running")]
    NotRunning,
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine termination failed: {0}")]
    Terminate(String),
}

impl EngineError {
    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn terminate(message: impl Into<String>) -> Self {
        Self::Terminate(message.into())
    }
}

/// Process-level launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: Option<PathBuf>,
    pub launch_timeout: Duration,
    pub request_timeout: Duration,
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            launch_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(30),
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    /// Full argument list handed to the engine process: unattended, sandbox
    /// off, deterministic fonts, then operator-supplied extras.
    pub fn engine_args(&self) -> Vec<String> {
        CONTAINER_ARGS
            .iter()
            .chain(DETERMINISTIC_FONT_ARGS)
            .map(|arg| (*arg).to_string())
            .chain(self.extra_args.iter().cloned())
            .collect()
    }
}

/// Load-completion heuristic: the document is settled once at most
/// `max_inflight` network requests have been pending for a full
/// `idle_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub max_inflight: usize,
    pub idle_window: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            max_inflight: 2,
            idle_window: Duration::from_millis(500),
        }
    }
}

const CM_PER_INCH: f64 = 2.54;

/// Page options for PDF rasterisation. Dimensions are in inches, which is
/// what the DevTools protocol expects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PdfOptions {
    pub paper_width_in: f64,
    pub paper_height_in: f64,
    pub margin_in: f64,
    pub print_background: bool,
}

impl PdfOptions {
    /// A4 portrait, background graphics on, 1 cm margins.
    pub fn a4() -> Self {
        Self {
            paper_width_in: 210.0 / 10.0 / CM_PER_INCH,
            paper_height_in: 297.0 / 10.0 / CM_PER_INCH,
            margin_in: 1.0 / CM_PER_INCH,
            print_background: true,
        }
    }
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self::a4()
    }
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Engine>, EngineError>;
}

/// A running engine process.
#[async_trait]
pub trait Engine: Send + Sync {
    fn is_alive(&self) -> bool;

    async fn new_surface(&self) -> Result<Box<dyn Surface>, EngineError>;

    async fn terminate(&self) -> Result<(), EngineError>;
}

/// One document context (a tab) inside the engine.
#[async_trait]
pub trait Surface: Send {
    async fn navigate(&mut self, url: &Url, wait: WaitPolicy) -> Result<(), EngineError>;

    async fn set_content(&mut self, html: &str, wait: WaitPolicy) -> Result<(), EngineError>;

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError>;

    async fn close(self: Box<Self>) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_args_disable_sandbox_and_font_variance() {
        let options = LaunchOptions {
            extra_args: vec!["--lang=en-US".to_string()],
            ..LaunchOptions::default()
        };
        let args = options.engine_args();

        assert!(args.iter().any(|arg| arg == "--no-sandbox"));
        assert!(args.iter().any(|arg| arg == "--font-render-hinting=none"));
        assert!(args.iter().any(|arg| arg == "--disable-lcd-text"));
        assert_eq!(args.last().map(String::as_str), Some("--lang=en-US"));
    }

    #[test]
    fn a4_dimensions_and_margins_are_in_inches() {
        let a4 = PdfOptions::a4();
        assert!((a4.paper_width_in - 8.2677).abs() < 1e-3);
        assert!((a4.paper_height_in - 11.6929).abs() < 1e-3);
        assert!((a4.margin_in - 0.3937).abs() < 1e-3);
        assert!(a4.print_background);
    }
}
