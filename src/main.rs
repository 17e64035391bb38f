use std::{net::SocketAddr, path::Path, process, sync::Arc, time::Duration};

use folio::{
    application::{
        conversion::ConversionService,
        engine::{EngineSupervisor, LaunchOptions, RenderProfile},
        error::AppError,
        lifecycle::ProcessLifecycle,
    },
    config::{self, RenderArgs, Settings},
    domain::document::ConversionRequest,
    infra::{
        chromium::ChromiumLauncher,
        error::InfraError,
        http::{self, ClientRateLimiter, HttpState, RouterOptions},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const RATE_LIMIT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let conversions = build_conversion_service(&settings);

    match command {
        config::Command::Serve(_) => run_serve(settings, conversions).await,
        config::Command::Render(args) => run_render(args, conversions).await,
    }
}

fn build_conversion_service(settings: &Settings) -> ConversionService {
    let supervisor = Arc::new(EngineSupervisor::new(
        Arc::new(ChromiumLauncher),
        LaunchOptions::from(&settings.engine),
    ));
    let lifecycle = Arc::new(ProcessLifecycle::new(Arc::clone(&supervisor)));
    ConversionService::new(
        supervisor,
        lifecycle,
        RenderProfile::from(&settings.render),
    )
}

async fn run_serve(settings: Settings, conversions: ConversionService) -> Result<(), AppError> {
    let lifecycle = Arc::clone(conversions.lifecycle());

    let rate_limiter = Arc::new(ClientRateLimiter::from(&settings.rate_limit));
    let pruner = {
        let limiter = Arc::clone(&rate_limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RATE_LIMIT_PRUNE_INTERVAL);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                limiter.prune();
            }
        })
    };

    let options = RouterOptions {
        max_request_bytes: usize::try_from(settings.limits.max_request_bytes.get())
            .unwrap_or(usize::MAX),
        cors: settings.cors.clone(),
    };
    let router = http::build_router(
        HttpState {
            conversions,
            rate_limiter,
        },
        &options,
    );

    let outcome = serve_http(&settings, router, &lifecycle).await;

    pruner.abort();
    lifecycle.shutdown().await;
    outcome
}

async fn serve_http(
    settings: &Settings,
    router: axum::Router,
    lifecycle: &Arc<ProcessLifecycle>,
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "folio::server",
        addr = %settings.server.addr,
        "listening"
    );

    let signals = Arc::clone(lifecycle);
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { signals.listen_for_signals().await });

    let grace = settings.server.graceful_shutdown;
    let drain_deadline = async {
        lifecycle.stopped().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server.into_future() => result.map_err(|err| {
            AppError::from(InfraError::server(err.to_string()))
        }),
        () = drain_deadline => {
            warn!(
                target = "folio::server",
                grace_seconds = grace.as_secs(),
                "in-flight requests did not drain before the deadline"
            );
            Ok(())
        }
    }
}

async fn run_render(args: RenderArgs, conversions: ConversionService) -> Result<(), AppError> {
    let lifecycle = Arc::clone(conversions.lifecycle());

    let request = match (args.url, args.html_file) {
        (Some(url), _) => ConversionRequest::from_url(url),
        (None, Some(path)) => {
            let html = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
            ConversionRequest::from_html(html)
        }
        (None, None) => {
            return Err(AppError::validation(
                "either --url or --html-file is required",
            ));
        }
    };

    let outcome = tokio::select! {
        result = render_to_file(&conversions, request, &args.output) => result,
        () = lifecycle.listen_for_signals() => {
            Err(AppError::unexpected("interrupted before the PDF was written"))
        }
    };

    lifecycle.shutdown().await;
    outcome
}

async fn render_to_file(
    conversions: &ConversionService,
    request: ConversionRequest,
    output: &Path,
) -> Result<(), AppError> {
    let pdf = conversions.convert(request, None).await?;
    tokio::fs::write(output, pdf.as_bytes())
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "folio::render",
        output = %output.display(),
        pdf_bytes = pdf.len() as u64,
        "pdf written"
    );
    Ok(())
}
