//! Headless Chromium adapter over the DevTools protocol.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::{
        network::{EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent},
        page::PrintToPdfParams,
    },
    error::CdpError,
};
use futures::StreamExt;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
};
use tracing::debug;
use url::Url;

use crate::application::engine::{
    Engine, EngineError, EngineLauncher, LaunchOptions, PdfOptions, Surface, WaitPolicy,
};

const EXIT_GRACE: Duration = Duration::from_secs(5);

fn protocol(err: CdpError) -> EngineError {
    EngineError::protocol(err.to_string())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumLauncher;

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Arc<dyn Engine>, EngineError> {
        let mut builder = BrowserConfig::builder()
            .args(options.engine_args())
            .launch_timeout(options.launch_timeout)
            .request_timeout(options.request_timeout);
        if let Some(executable) = options.executable.as_ref() {
            builder = builder.chrome_executable(executable);
        }
        let config = builder.build().map_err(EngineError::launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| EngineError::launch(err.to_string()))?;

        // The browser only makes progress while its handler is polled. When
        // the stream ends, the connection is gone and the engine is dead.
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(target = "folio::chromium", error = %err, "devtools handler error");
                }
            }
            debug!(target = "folio::chromium", "devtools connection closed");
        });

        Ok(Arc::new(ChromiumEngine {
            browser: RwLock::new(browser),
            events,
        }))
    }
}

struct ChromiumEngine {
    browser: RwLock<Browser>,
    events: JoinHandle<()>,
}

#[async_trait]
impl Engine for ChromiumEngine {
    fn is_alive(&self) -> bool {
        !self.events.is_finished()
    }

    async fn new_surface(&self) -> Result<Box<dyn Surface>, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::NotRunning);
        }

        let page = self
            .browser
            .read()
            .await
            .new_page("about:blank")
            .await
            .map_err(protocol)?;

        match NetworkIdle::watch(&page).await {
            Ok(network) => Ok(Box::new(ChromiumSurface { page, network })),
            Err(err) => {
                if let Err(close_err) = page.close().await {
                    debug!(
                        target = "folio::chromium",
                        error = %close_err,
                        "failed to close page after network tracking setup failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn terminate(&self) -> Result<(), EngineError> {
        let mut browser = self.browser.write().await;

        let closed = browser.close().await;
        let exited = matches!(
            tokio::time::timeout(EXIT_GRACE, browser.wait()).await,
            Ok(Ok(_))
        );
        if !exited {
            if let Some(Err(err)) = browser.kill().await {
                self.events.abort();
                return Err(EngineError::terminate(format!(
                    "engine did not exit and could not be killed: {err}"
                )));
            }
        }
        self.events.abort();

        closed
            .map(|_| ())
            .map_err(|err| EngineError::terminate(err.to_string()))
    }
}

impl Drop for ChromiumEngine {
    fn drop(&mut self) {
        self.events.abort();
    }
}

struct ChromiumSurface {
    page: Page,
    network: NetworkIdle,
}

#[async_trait]
impl Surface for ChromiumSurface {
    async fn navigate(&mut self, url: &Url, wait: WaitPolicy) -> Result<(), EngineError> {
        self.page.goto(url.as_str()).await.map_err(protocol)?;
        self.network.settle(wait).await;
        Ok(())
    }

    async fn set_content(&mut self, html: &str, wait: WaitPolicy) -> Result<(), EngineError> {
        self.page.set_content(html).await.map_err(protocol)?;
        self.network.settle(wait).await;
        Ok(())
    }

    async fn print_pdf(&mut self, options: &PdfOptions) -> Result<Vec<u8>, EngineError> {
        let params = PrintToPdfParams {
            print_background: Some(options.print_background),
            paper_width: Some(options.paper_width_in),
            paper_height: Some(options.paper_height_in),
            margin_top: Some(options.margin_in),
            margin_bottom: Some(options.margin_in),
            margin_left: Some(options.margin_in),
            margin_right: Some(options.margin_in),
            ..PrintToPdfParams::default()
        };
        self.page.pdf(params).await.map_err(protocol)
    }

    async fn close(self: Box<Self>) -> Result<(), EngineError> {
        let Self { page, network } = *self;
        network.stop();
        page.close().await.map_err(protocol)
    }
}

/// Live count of in-flight network requests on one page.
struct NetworkIdle {
    inflight: watch::Receiver<usize>,
    tracker: JoinHandle<()>,
}

impl NetworkIdle {
    async fn watch(page: &Page) -> Result<Self, EngineError> {
        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(protocol)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(protocol)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(protocol)?;

        let (count, inflight) = watch::channel(0usize);
        let tracker = tokio::spawn(async move {
            let mut pending: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    Some(event) = sent.next() => {
                        pending.insert(event.request_id.inner().clone());
                    }
                    Some(event) = finished.next() => {
                        pending.remove(event.request_id.inner());
                    }
                    Some(event) = failed.next() => {
                        pending.remove(event.request_id.inner());
                    }
                    else => break,
                }
                count.send_replace(pending.len());
            }
        });

        Ok(Self { inflight, tracker })
    }

    /// Wait until no more than `max_inflight` requests have been pending for
    /// a whole `idle_window`. Unbounded; callers apply their own deadline.
    async fn settle(&mut self, policy: WaitPolicy) {
        let inflight = &mut self.inflight;
        loop {
            if inflight
                .wait_for(|count| *count <= policy.max_inflight)
                .await
                .is_err()
            {
                return;
            }
            match tokio::time::timeout(
                policy.idle_window,
                inflight.wait_for(|count| *count > policy.max_inflight),
            )
            .await
            {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => return,
            }
        }
    }

    fn stop(self) {
        self.tracker.abort();
    }
}

impl Drop for NetworkIdle {
    fn drop(&mut self) {
        self.tracker.abort();
    }
}
