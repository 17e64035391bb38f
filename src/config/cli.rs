use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the folio binary.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "HTML and URL to PDF conversion service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FOLIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the conversion HTTP service.
    Serve(Box<ServeArgs>),
    /// Convert a single document and exit.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Absolute http(s) URL to convert.
    #[arg(
        long,
        value_name = "URL",
        value_hint = ValueHint::Url,
        conflicts_with = "html_file",
        required_unless_present = "html_file"
    )]
    pub url: Option<String>,

    /// HTML file whose contents are converted.
    #[arg(
        long = "html-file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        required_unless_present = "url"
    )]
    pub html_file: Option<PathBuf>,

    /// Where to write the PDF.
    #[arg(long, short = 'o', value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the browser executable used as the rendering engine.
    #[arg(long = "engine-executable", value_name = "PATH")]
    pub executable: Option<PathBuf>,

    /// Override the engine launch timeout.
    #[arg(long = "engine-launch-timeout-seconds", value_name = "SECONDS")]
    pub launch_timeout_seconds: Option<u64>,

    /// Override the navigation timeout for a single render.
    #[arg(long = "render-navigation-timeout-seconds", value_name = "SECONDS")]
    pub navigation_timeout_seconds: Option<u64>,

    /// Override the PDF rasterisation timeout for a single render.
    #[arg(long = "render-pdf-timeout-seconds", value_name = "SECONDS")]
    pub pdf_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the maximum request body size in bytes.
    #[arg(long = "limits-max-request-bytes", value_name = "BYTES")]
    pub max_request_bytes: Option<u64>,

    /// Override the rate limit window size.
    #[arg(long = "rate-limit-window-seconds", value_name = "SECONDS")]
    pub rate_limit_window_seconds: Option<u64>,

    /// Override the rate limit request ceiling.
    #[arg(long = "rate-limit-max-requests", value_name = "COUNT")]
    pub rate_limit_max_requests: Option<u64>,

    /// Key the rate limit on `x-forwarded-for` (only behind a trusted proxy).
    #[arg(
        long = "rate-limit-trust-forwarded-for",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub rate_limit_trust_forwarded_for: Option<bool>,

    /// Allowed CORS origin; repeat for several. `*` allows any origin.
    #[arg(long = "cors-allowed-origin", value_name = "ORIGIN")]
    pub cors_allowed_origins: Vec<String>,
}
