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

/// The SQL Server driver logs every TLS handshake and login at info.
const DRIVER_DIRECTIVE: &str = "tiberius=warn";

/// Install a global tracing subscriber using the provided logging settings.
///
/// Events go to stderr so `refresh` and `queries` can print JSON on stdout.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    if !env_mentions_driver() {
        let directive = DRIVER_DIRECTIVE
            .parse()
            .map_err(|err| InfraError::telemetry(format!("invalid log directive: {err}")))?;
        env_filter = env_filter.add_directive(directive);
    }

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))
}

fn env_mentions_driver() -> bool {
    std::env::var(EnvFilter::DEFAULT_ENV)
        .map(|value| value.contains("tiberius"))
        .unwrap_or(false)
}

/// Register metric descriptions with whatever recorder is installed.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "dashcache_refresh_total",
            Unit::Count,
            "Completed refreshes, labelled by query and outcome."
        );
        describe_counter!(
            "dashcache_refresh_attempt_total",
            Unit::Count,
            "Database executions issued by refreshes, including retries."
        );
        describe_histogram!(
            "dashcache_refresh_ms",
            Unit::Milliseconds,
            "Refresh latency in milliseconds, including backoff sleeps."
        );
        describe_counter!(
            "dashcache_refresh_coalesced_total",
            Unit::Count,
            "Refresh requests that joined an in-flight refresh."
        );
        describe_counter!(
            "dashcache_pool_exhausted_total",
            Unit::Count,
            "Connection acquisitions that timed out waiting for a free slot."
        );
        describe_counter!(
            "dashcache_pool_connections_opened_total",
            Unit::Count,
            "Database connections opened by the pool."
        );
        describe_counter!(
            "dashcache_pool_connections_discarded_total",
            Unit::Count,
            "Pooled connections dropped as broken or abandoned."
        );
        describe_counter!(
            "dashcache_cache_reads_total",
            Unit::Count,
            "Cache store reads, labelled by observed state."
        );
    });
}
