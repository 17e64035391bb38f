//! Request-level orchestration: validate, acquire the engine, render, recover.

use std::{fmt, sync::Arc, time::Instant};

use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::engine::{
    EngineHandle, EngineId, EngineSupervisor, EngineUnavailable, RenderProfile, RenderSession,
};
use crate::application::lifecycle::ProcessLifecycle;
use crate::domain::document::{ConversionRequest, DocumentSource, PdfDocument};
use crate::domain::error::DomainError;

/// Engine-side step at which a render went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
    Navigate,
    SetContent,
    PrintPdf,
}

impl RenderStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderStage::Navigate => "navigate",
            RenderStage::SetContent => "set_content",
            RenderStage::PrintPdf => "print_pdf",
        }
    }

    pub fn failed(self, cause: impl Into<String>) -> ConversionError {
        ConversionError::RenderFailed {
            stage: self,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rendering engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("could not open a render session: {0}")]
    SessionOpenFailed(String),
    #[error("render failed during {stage}: {cause}")]
    RenderFailed { stage: RenderStage, cause: String },
    #[error("service is shutting down")]
    ShuttingDown,
}

impl ConversionError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::InvalidRequest(_) => "invalid_request",
            ConversionError::EngineUnavailable(_) => "engine_unavailable",
            ConversionError::SessionOpenFailed(_) => "session_open_failed",
            ConversionError::RenderFailed { .. } => "render_failed",
            ConversionError::ShuttingDown => "shutting_down",
        }
    }

    pub fn is_client_fault(&self) -> bool {
        matches!(self, ConversionError::InvalidRequest(_))
    }

    /// Failures observed on a live engine leave it in an unknown state.
    /// A launch failure does not: the next request launches again anyway.
    pub fn triggers_restart(&self) -> bool {
        matches!(
            self,
            ConversionError::SessionOpenFailed(_) | ConversionError::RenderFailed { .. }
        )
    }
}

impl From<DomainError> for ConversionError {
    fn from(error: DomainError) -> Self {
        ConversionError::InvalidRequest(error.message().to_string())
    }
}

impl From<EngineUnavailable> for ConversionError {
    fn from(error: EngineUnavailable) -> Self {
        match error {
            EngineUnavailable::ShutDown => ConversionError::ShuttingDown,
            EngineUnavailable::Launch(err) => ConversionError::EngineUnavailable(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ConversionService {
    supervisor: Arc<EngineSupervisor>,
    lifecycle: Arc<ProcessLifecycle>,
    profile: RenderProfile,
}

impl ConversionService {
    pub fn new(
        supervisor: Arc<EngineSupervisor>,
        lifecycle: Arc<ProcessLifecycle>,
        profile: RenderProfile,
    ) -> Self {
        Self {
            supervisor,
            lifecycle,
            profile,
        }
    }

    pub fn supervisor(&self) -> &Arc<EngineSupervisor> {
        &self.supervisor
    }

    pub fn lifecycle(&self) -> &Arc<ProcessLifecycle> {
        &self.lifecycle
    }

    /// Convert one document to PDF.
    ///
    /// Invalid input is rejected before the engine is touched. Session and
    /// render failures restart the engine before the error is returned.
    pub async fn convert(
        &self,
        request: ConversionRequest,
        request_id: Option<&str>,
    ) -> Result<PdfDocument, ConversionError> {
        let started_at = Instant::now();
        let result = self.run(request, request_id).await;
        let elapsed = started_at.elapsed();

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        counter!("folio_conversion_total", "outcome" => outcome).increment(1);
        histogram!("folio_conversion_ms").record(elapsed.as_secs_f64() * 1000.0);

        match &result {
            Ok(pdf) => info!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                pdf_bytes = pdf.len() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                "render succeeded"
            ),
            Err(err) if err.is_client_fault() => debug!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                error = %err,
                "request rejected"
            ),
            Err(ConversionError::RenderFailed { stage, cause }) => warn!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                stage = stage.as_str(),
                cause = cause.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "render failed"
            ),
            Err(err) => warn!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                outcome,
                error = %err,
                elapsed_ms = elapsed.as_millis() as u64,
                "render failed"
            ),
        }

        result
    }

    async fn run(
        &self,
        request: ConversionRequest,
        request_id: Option<&str>,
    ) -> Result<PdfDocument, ConversionError> {
        if !self.lifecycle.is_accepting() {
            return Err(ConversionError::ShuttingDown);
        }

        let source = request.validate()?;
        info!(
            target = "folio::conversion",
            request_id = request_id.unwrap_or(""),
            source_kind = source.kind().as_str(),
            "render started"
        );

        let handle = self.supervisor.ensure_engine().await?;
        let engine_id = handle.id();

        match self.render(&handle, source, request_id).await {
            Ok(bytes) => Ok(PdfDocument::new(bytes)),
            Err(err) => {
                if err.triggers_restart() {
                    self.recover(engine_id, request_id).await;
                }
                Err(err)
            }
        }
    }

    async fn render(
        &self,
        handle: &EngineHandle,
        source: DocumentSource,
        request_id: Option<&str>,
    ) -> Result<Vec<u8>, ConversionError> {
        let mut session = RenderSession::open(handle, source, request_id, self.profile).await?;
        let rendered = session.render().await;
        session.close().await;
        rendered
    }

    /// Runs on its own task so the replacement engine comes up even if this
    /// request is abandoned midway.
    async fn recover(&self, failed: EngineId, request_id: Option<&str>) {
        let supervisor = Arc::clone(&self.supervisor);
        let task = tokio::spawn(async move { supervisor.recover(failed).await });

        match task.await {
            Ok(Ok(handle)) => info!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                failed = failed.get(),
                generation = handle.id().get(),
                "engine recovered"
            ),
            Ok(Err(err)) => warn!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                failed = failed.get(),
                error = %err,
                "engine recovery failed"
            ),
            Err(err) => warn!(
                target = "folio::conversion",
                request_id = request_id.unwrap_or(""),
                failed = failed.get(),
                error = %err,
                "engine recovery task did not complete"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::engine::testing::{Fault, FaultStage, ScriptedLauncher};
    use crate::application::engine::{EngineState, LaunchOptions, RenderTimeouts};
    use crate::domain::document::PDF_SIGNATURE;

    struct Harness {
        launcher: ScriptedLauncher,
        supervisor: Arc<EngineSupervisor>,
        lifecycle: Arc<ProcessLifecycle>,
        service: ConversionService,
    }

    fn harness_with(profile: RenderProfile) -> Harness {
        let launcher = ScriptedLauncher::new();
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::default(),
        ));
        let lifecycle = Arc::new(ProcessLifecycle::new(Arc::clone(&supervisor)));
        let service =
            ConversionService::new(Arc::clone(&supervisor), Arc::clone(&lifecycle), profile);
        Harness {
            launcher,
            supervisor,
            lifecycle,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(RenderProfile::default())
    }

    async fn wait_for_closes(launcher: &ScriptedLauncher, expected: usize) {
        for _ in 0..100 {
            if launcher.surfaces_closed() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn html_conversion_returns_pdf() {
        let h = harness();

        let pdf = h
            .service
            .convert(ConversionRequest::from_html("<h1>Hi</h1>"), Some("req-1"))
            .await
            .expect("pdf");

        assert!(pdf.has_signature());
        assert!(pdf.as_bytes().starts_with(PDF_SIGNATURE));
        assert_eq!(h.launcher.launches(), 1);
    }

    #[tokio::test]
    async fn url_conversion_navigates_to_the_url() {
        let h = harness();

        h.service
            .convert(ConversionRequest::from_url("https://example.com/a"), None)
            .await
            .expect("pdf");

        assert_eq!(
            h.launcher.loaded_documents(),
            vec!["https://example.com/a".to_string()]
        );
    }

    #[tokio::test]
    async fn invalid_requests_never_touch_the_engine() {
        let h = harness();

        let both = ConversionRequest {
            url: Some("https://example.com".to_string()),
            html: Some("<p>x</p>".to_string()),
        };
        let cases = [
            ConversionRequest::default(),
            both,
            ConversionRequest::from_url("not-a-url"),
            ConversionRequest::from_url("file:///etc/passwd"),
        ];

        for request in cases {
            let err = h.service.convert(request, None).await.expect_err("invalid");
            assert!(err.is_client_fault(), "unexpected error {err:?}");
        }

        assert_eq!(h.launcher.launches(), 0);
        assert_eq!(h.supervisor.status().state, EngineState::Absent);
    }

    #[tokio::test]
    async fn both_sources_message_names_the_rule() {
        let h = harness();
        let request = ConversionRequest {
            url: Some("https://example.com".to_string()),
            html: Some("<p>x</p>".to_string()),
        };

        let err = h.service.convert(request, None).await.expect_err("invalid");
        match err {
            ConversionError::InvalidRequest(message) => {
                assert!(message.contains("either"), "message: {message}");
                assert!(message.contains("not both"), "message: {message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequential_conversions_share_one_engine() {
        let h = harness();

        for markup in ["<p>one</p>", "<p>two</p>"] {
            let pdf = h
                .service
                .convert(ConversionRequest::from_html(markup), None)
                .await
                .expect("pdf");
            assert!(pdf.has_signature());
        }

        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.surfaces_opened(), 2);
        assert_eq!(h.launcher.surfaces_closed(), 2);
    }

    #[tokio::test]
    async fn render_failure_restarts_and_next_request_succeeds() {
        let h = harness();
        h.launcher.inject(Fault::Fail(FaultStage::SetContent));

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("render fails");
        assert!(matches!(
            err,
            ConversionError::RenderFailed {
                stage: RenderStage::SetContent,
                ..
            }
        ));
        assert_eq!(h.launcher.launches(), 2);
        assert_eq!(h.launcher.terminations(), 1);

        let pdf = h
            .service
            .convert(ConversionRequest::from_html("<p>y</p>"), None)
            .await
            .expect("pdf after restart");
        assert!(pdf.has_signature());

        let status = h.supervisor.status();
        assert_eq!(status.generation.map(EngineId::get), Some(2));
        assert_eq!(status.restarts, 1);
        assert_eq!(h.launcher.max_live_engines(), 1);
        assert_eq!(h.launcher.surfaces_closed(), h.launcher.surfaces_opened());
    }

    #[tokio::test]
    async fn engine_crash_is_recovered() {
        let h = harness();
        h.launcher.inject(Fault::Crash(FaultStage::PrintPdf));

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("crash");
        assert!(err.triggers_restart());

        h.service
            .convert(ConversionRequest::from_html("<p>y</p>"), None)
            .await
            .expect("pdf after crash");
        assert_eq!(h.launcher.live_engines(), 1);
    }

    #[tokio::test]
    async fn session_open_failure_restarts_engine() {
        let h = harness();
        h.launcher.inject(Fault::Fail(FaultStage::OpenSurface));

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("open fails");

        assert!(matches!(err, ConversionError::SessionOpenFailed(_)));
        assert_eq!(h.supervisor.status().restarts, 1);
        assert_eq!(h.launcher.surfaces_opened(), 0);
    }

    #[tokio::test]
    async fn launch_failure_is_engine_unavailable_without_session() {
        let h = harness();
        h.launcher.fail_launches(true);

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("unavailable");

        assert!(matches!(err, ConversionError::EngineUnavailable(_)));
        assert!(!err.triggers_restart());
        assert_eq!(h.launcher.surfaces_opened(), 0);
        assert_eq!(h.supervisor.status().restarts, 0);
        assert_eq!(h.supervisor.status().state, EngineState::Absent);

        h.launcher.fail_launches(false);
        h.service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect("launch succeeds on retry");
    }

    #[tokio::test]
    async fn render_timeout_fails_and_restarts() {
        let h = harness_with(RenderProfile {
            timeouts: RenderTimeouts {
                navigation: Some(Duration::from_millis(20)),
                pdf: None,
            },
            ..RenderProfile::default()
        });
        h.launcher.inject(Fault::Hang(FaultStage::SetContent));

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("timeout");

        match err {
            ConversionError::RenderFailed { stage, cause } => {
                assert_eq!(stage, RenderStage::SetContent);
                assert!(cause.contains("timed out after"), "cause: {cause}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.supervisor.status().restarts, 1);
        assert_eq!(h.launcher.surfaces_closed(), 1);
    }

    #[tokio::test]
    async fn cancelled_conversion_still_closes_surface() {
        let h = harness();
        h.launcher.inject(Fault::Hang(FaultStage::SetContent));

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            h.service
                .convert(ConversionRequest::from_html("<p>x</p>"), None),
        )
        .await;
        assert!(outcome.is_err(), "conversion should still be pending");

        wait_for_closes(&h.launcher, 1).await;
        assert_eq!(h.launcher.surfaces_opened(), 1);
        assert_eq!(h.launcher.surfaces_closed(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_conversions() {
        let h = harness();
        h.service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect("pdf");

        assert!(h.lifecycle.shutdown().await);

        let err = h
            .service
            .convert(ConversionRequest::from_html("<p>x</p>"), None)
            .await
            .expect_err("rejected");
        assert_eq!(err, ConversionError::ShuttingDown);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.live_engines(), 0);
    }

    #[test]
    fn error_classification_is_by_variant() {
        assert!(ConversionError::InvalidRequest("x".into()).is_client_fault());
        assert!(!ConversionError::ShuttingDown.is_client_fault());
        assert!(ConversionError::SessionOpenFailed("x".into()).triggers_restart());
        assert!(RenderStage::PrintPdf.failed("boom").triggers_restart());
        assert!(!ConversionError::EngineUnavailable("x".into()).triggers_restart());
        assert_eq!(
            RenderStage::Navigate.failed("boom").to_string(),
            "render failed during navigate: boom"
        );
    }
}
