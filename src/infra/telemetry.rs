use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
///
/// Metric descriptions are registered on the first call.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

enum Kind {
    Counter,
    Histogram,
}

/// Every metric folio records: name, kind, unit and help text.
const METRICS: &[(&str, Kind, Unit, &str)] = &[
    (
        "folio_engine_launch_total",
        Kind::Counter,
        Unit::Count,
        "Successful engine launches.",
    ),
    (
        "folio_engine_launch_failure_total",
        Kind::Counter,
        Unit::Count,
        "Engine launches that failed.",
    ),
    (
        "folio_engine_restart_total",
        Kind::Counter,
        Unit::Count,
        "Engine restarts, including recoveries after failed renders.",
    ),
    (
        "folio_engine_launch_ms",
        Kind::Histogram,
        Unit::Milliseconds,
        "Engine launch latency.",
    ),
    (
        "folio_conversion_total",
        Kind::Counter,
        Unit::Count,
        "Conversions, labelled by outcome.",
    ),
    (
        "folio_conversion_ms",
        Kind::Histogram,
        Unit::Milliseconds,
        "End-to-end conversion latency.",
    ),
    (
        "folio_rate_limited_total",
        Kind::Counter,
        Unit::Count,
        "Conversion requests refused by the per-client rate limit.",
    ),
];

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, kind, unit, help) in METRICS {
            match kind {
                Kind::Counter => describe_counter!(*name, *unit, *help),
                Kind::Histogram => describe_histogram!(*name, *unit, *help),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn metric_names_are_unique_and_namespaced() {
        let mut seen = HashSet::new();
        for (name, kind, unit, _) in METRICS {
            assert!(name.starts_with("folio_"), "{name}");
            assert!(seen.insert(*name), "duplicate metric {name}");
            match kind {
                Kind::Counter => assert!(name.ends_with("_total"), "{name}"),
                Kind::Histogram => {
                    assert!(name.ends_with("_ms"), "{name}");
                    assert_eq!(*unit, Unit::Milliseconds);
                }
            }
        }
    }
}
