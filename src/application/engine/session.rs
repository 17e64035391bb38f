use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::application::conversion::{ConversionError, RenderStage};
use crate::domain::document::{DocumentSource, PDF_SIGNATURE, SourceKind};

use super::{EngineError, EngineHandle, EngineId, PdfOptions, Surface, WaitPolicy};

/// Optional upper bounds for the engine-side stages of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTimeouts {
    pub navigation: Option<Duration>,
    pub pdf: Option<Duration>,
}

/// Everything a session needs to know about how to render.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderProfile {
    pub wait: WaitPolicy,
    pub pdf: PdfOptions,
    pub timeouts: RenderTimeouts,
}

/// One document-to-PDF attempt bound to a single engine surface.
///
/// [`close`](Self::close) consumes the session. A session dropped without
/// being closed (its caller was cancelled) hands the surface to a background
/// task that closes it.
pub struct RenderSession {
    source: DocumentSource,
    request_id: Option<String>,
    engine_id: EngineId,
    profile: RenderProfile,
    surface: Option<Box<dyn Surface>>,
}

impl RenderSession {
    pub async fn open(
        handle: &EngineHandle,
        source: DocumentSource,
        request_id: Option<&str>,
        profile: RenderProfile,
    ) -> Result<Self, ConversionError> {
        if !handle.is_alive() {
            return Err(ConversionError::SessionOpenFailed(
                EngineError::NotRunning.to_string(),
            ));
        }

        let surface = handle
            .engine()
            .new_surface()
            .await
            .map_err(|err| ConversionError::SessionOpenFailed(err.to_string()))?;

        debug!(
            target = "folio::session",
            request_id = request_id.unwrap_or(""),
            generation = handle.id().get(),
            source_kind = source.kind().as_str(),
            "render session opened"
        );

        Ok(Self {
            source,
            request_id: request_id.map(str::to_owned),
            engine_id: handle.id(),
            profile,
            surface: Some(surface),
        })
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Load the document, wait for it to settle and print it to PDF.
    pub async fn render(&mut self) -> Result<Vec<u8>, ConversionError> {
        let Self {
            source,
            profile,
            surface,
            ..
        } = self;
        let surface = surface
            .as_mut()
            .ok_or_else(|| RenderStage::Navigate.failed("render session already closed"))?;

        match source {
            DocumentSource::Url(url) => {
                bounded(
                    RenderStage::Navigate,
                    profile.timeouts.navigation,
                    surface.navigate(url, profile.wait),
                )
                .await?
            }
            DocumentSource::Html(html) => {
                bounded(
                    RenderStage::SetContent,
                    profile.timeouts.navigation,
                    surface.set_content(html, profile.wait),
                )
                .await?
            }
        }

        let bytes = bounded(
            RenderStage::PrintPdf,
            profile.timeouts.pdf,
            surface.print_pdf(&profile.pdf),
        )
        .await?;

        if !bytes.starts_with(PDF_SIGNATURE) {
            return Err(RenderStage::PrintPdf.failed(format!(
                "engine returned {} bytes without a PDF signature",
                bytes.len()
            )));
        }

        Ok(bytes)
    }

    /// Release the surface. Failures are logged; the engine is restarted by
    /// the caller's recovery path if it is really broken.
    pub async fn close(mut self) {
        if let Some(surface) = self.surface.take() {
            if let Err(err) = surface.close().await {
                warn!(
                    target = "folio::session",
                    request_id = self.request_id.as_deref().unwrap_or(""),
                    generation = self.engine_id.get(),
                    error = %err,
                    "failed to close render surface"
                );
            }
        }
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        let Some(surface) = self.surface.take() else {
            return;
        };
        let request_id = self.request_id.take().unwrap_or_default();
        let generation = self.engine_id.get();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = surface.close().await {
                        warn!(
                            target = "folio::session",
                            request_id = request_id.as_str(),
                            generation,
                            error = %err,
                            "failed to close abandoned render surface"
                        );
                    }
                });
            }
            Err(_) => warn!(
                target = "folio::session",
                request_id = request_id.as_str(),
                generation,
                "render surface dropped outside a runtime; leaving it to engine teardown"
            ),
        }
    }
}

async fn bounded<T>(
    stage: RenderStage,
    limit: Option<Duration>,
    operation: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, ConversionError> {
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| stage.failed(format!("timed out after {} ms", limit.as_millis())))?,
        None => operation.await,
    };
    result.map_err(|err| stage.failed(err.to_string()))
}
