//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::engine::{
    LaunchOptions, PdfOptions, RenderProfile, RenderTimeouts, WaitPolicy,
};

pub use cli::{CliArgs, Command, EngineOverrides, RenderArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "folio";
const ENV_PREFIX: &str = "FOLIO";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ENGINE_LAUNCH_TIMEOUT_SECS: u64 = 20;
const DEFAULT_ENGINE_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PDF_TIMEOUT_SECS: u64 = 30;
const DEFAULT_NETWORK_IDLE_MS: u64 = 500;
const DEFAULT_NETWORK_IDLE_MAX_INFLIGHT: u64 = 2;
const DEFAULT_MAX_REQUEST_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub render: RenderSettings,
    pub limits: LimitsSettings,
    pub rate_limit: RateLimitSettings,
    pub cors: CorsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub executable: Option<PathBuf>,
    pub launch_timeout: Duration,
    pub request_timeout: Duration,
    pub extra_args: Vec<String>,
}

/// A timeout of zero seconds in the raw settings disables that bound.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub navigation_timeout: Option<Duration>,
    pub pdf_timeout: Option<Duration>,
    pub network_idle: Duration,
    pub network_idle_max_inflight: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LimitsSettings {
    pub max_request_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window_seconds: NonZeroU32,
    pub max_requests: NonZeroU32,
    /// Charge requests to the first `x-forwarded-for` hop instead of the
    /// socket peer. Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

/// Empty means no cross-origin access; a `*` entry allows any origin.
#[derive(Debug, Clone, Default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

impl CorsSettings {
    pub fn allows_any(&self) -> bool {
        self.allowed_origins.iter().any(|origin| origin == "*")
    }
}

impl From<&EngineSettings> for LaunchOptions {
    fn from(engine: &EngineSettings) -> Self {
        Self {
            executable: engine.executable.clone(),
            launch_timeout: engine.launch_timeout,
            request_timeout: engine.request_timeout,
            extra_args: engine.extra_args.clone(),
        }
    }
}

impl From<&RenderSettings> for RenderProfile {
    fn from(render: &RenderSettings) -> Self {
        Self {
            wait: WaitPolicy {
                max_inflight: render.network_idle_max_inflight.get(),
                idle_window: render.network_idle,
            },
            pdf: PdfOptions::a4(),
            timeouts: RenderTimeouts {
                navigation: render.navigation_timeout,
                pdf: render.pdf_timeout,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("engine.extra_args")
            .with_list_parse_key("cors.allowed_origins"),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => raw.apply_engine_overrides(&args.engine),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    render: RawRenderSettings,
    limits: RawLimitsSettings,
    rate_limit: RawRateLimitSettings,
    cors: RawCorsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(limit) = overrides.max_request_bytes {
            self.limits.max_request_bytes = Some(limit);
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }
        if let Some(trust) = overrides.rate_limit_trust_forwarded_for {
            self.rate_limit.trust_forwarded_for = Some(trust);
        }
        if !overrides.cors_allowed_origins.is_empty() {
            self.cors.allowed_origins = Some(overrides.cors_allowed_origins.clone());
        }

        self.apply_engine_overrides(&overrides.engine);
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(path) = overrides.executable.as_ref() {
            self.engine.executable = Some(path.clone());
        }
        if let Some(seconds) = overrides.launch_timeout_seconds {
            self.engine.launch_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.navigation_timeout_seconds {
            self.render.navigation_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.pdf_timeout_seconds {
            self.render.pdf_timeout_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            engine,
            render,
            limits,
            rate_limit,
            cors,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            engine: build_engine_settings(engine)?,
            render: build_render_settings(render)?,
            limits: build_limits_settings(limits)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
            cors: build_cors_settings(cors),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.host", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let executable = engine
        .executable
        .filter(|path| !path.as_os_str().is_empty());

    let launch_timeout = non_zero_secs(
        engine
            .launch_timeout_seconds
            .unwrap_or(DEFAULT_ENGINE_LAUNCH_TIMEOUT_SECS),
        "engine.launch_timeout_seconds",
    )?;
    let request_timeout = non_zero_secs(
        engine
            .request_timeout_seconds
            .unwrap_or(DEFAULT_ENGINE_REQUEST_TIMEOUT_SECS),
        "engine.request_timeout_seconds",
    )?;

    let extra_args = engine
        .extra_args
        .unwrap_or_default()
        .into_iter()
        .map(|arg| arg.trim().to_string())
        .filter(|arg| !arg.is_empty())
        .collect::<Vec<_>>();
    if let Some(arg) = extra_args.iter().find(|arg| !arg.starts_with("--")) {
        return Err(LoadError::invalid(
            "engine.extra_args",
            format!("`{arg}` is not a `--flag` style argument"),
        ));
    }

    Ok(EngineSettings {
        executable,
        launch_timeout,
        request_timeout,
        extra_args,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let navigation_timeout = optional_secs(
        render
            .navigation_timeout_seconds
            .unwrap_or(DEFAULT_NAVIGATION_TIMEOUT_SECS),
    );
    let pdf_timeout = optional_secs(
        render
            .pdf_timeout_seconds
            .unwrap_or(DEFAULT_PDF_TIMEOUT_SECS),
    );

    let idle_ms = render.network_idle_ms.unwrap_or(DEFAULT_NETWORK_IDLE_MS);
    if idle_ms == 0 {
        return Err(LoadError::invalid(
            "render.network_idle_ms",
            "must be greater than zero",
        ));
    }

    let max_inflight = render
        .network_idle_max_inflight
        .unwrap_or(DEFAULT_NETWORK_IDLE_MAX_INFLIGHT);
    let max_inflight = usize::try_from(max_inflight)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid(
                "render.network_idle_max_inflight",
                "must be a positive request count",
            )
        })?;

    Ok(RenderSettings {
        navigation_timeout,
        pdf_timeout,
        network_idle: Duration::from_millis(idle_ms),
        network_idle_max_inflight: max_inflight,
    })
}

fn build_limits_settings(limits: RawLimitsSettings) -> Result<LimitsSettings, LoadError> {
    let max_request_bytes_value = limits
        .max_request_bytes
        .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes_value).ok_or_else(|| {
        LoadError::invalid("limits.max_request_bytes", "must be greater than zero")
    })?;
    usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "limits.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(LimitsSettings { max_request_bytes })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_seconds_val = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    let window_seconds = non_zero_u32(window_seconds_val, "rate_limit.window_seconds")?;

    let max_requests_val = rate_limit
        .max_requests
        .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);
    let max_requests = non_zero_u32(max_requests_val, "rate_limit.max_requests")?;

    Ok(RateLimitSettings {
        window_seconds,
        max_requests,
        trust_forwarded_for: rate_limit.trust_forwarded_for.unwrap_or(false),
    })
}

fn build_cors_settings(cors: RawCorsSettings) -> CorsSettings {
    let allowed_origins = cors
        .allowed_origins
        .unwrap_or_default()
        .into_iter()
        .map(|origin| origin.trim().trim_end_matches('/').to_string())
        .filter(|origin| !origin.is_empty())
        .collect();

    CorsSettings { allowed_origins }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    executable: Option<PathBuf>,
    launch_timeout_seconds: Option<u64>,
    request_timeout_seconds: Option<u64>,
    extra_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    navigation_timeout_seconds: Option<u64>,
    pdf_timeout_seconds: Option<u64>,
    network_idle_ms: Option<u64>,
    network_idle_max_inflight: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLimitsSettings {
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
    trust_forwarded_for: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCorsSettings {
    allowed_origins: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn optional_secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
