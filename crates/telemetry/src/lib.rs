//! Observability stack for the gateway.
//!
//! - **Logging**: `tracing` with JSON or compact console output
//! - **Tracing export**: OpenTelemetry OTLP (feature `otlp`)
//! - **Metrics**: Prometheus recorder rendered by `/metrics` (feature `prometheus`)
//! - **Error tracking**: Sentry (feature `sentry`)

#[cfg(feature = "otlp")]
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

#[cfg(feature = "otlp")]
use opentelemetry::KeyValue;
#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    Resource,
    trace::{Sampler, SdkTracerProvider},
};

#[cfg(feature = "sentry")]
pub use sentry;

/// Default service name reported to exporters.
pub const SERVICE_NAME: &str = "api-gateway";

/// Noisy dependencies capped below the configured level.
const QUIET_TARGETS: &[&str] = &["tower=info", "h2=info", "hyper=info", "tonic=info", "sentry=warn"];

/// Telemetry setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing subscriber already installed: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[cfg(feature = "otlp")]
    #[error("failed to build OTLP exporter: {0}")]
    Otlp(#[from] opentelemetry_otlp::ExporterBuildError),
    #[cfg(feature = "prometheus")]
    #[error("failed to install Prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: String,
    pub json_logs: bool,
    pub otlp_endpoint: Option<String>,
    pub sentry_dsn: Option<String>,
    /// Environment name (e.g., "production", "development")
    pub environment: Option<String>,
    pub version: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            log_level: "INFO".to_string(),
            json_logs: true,
            otlp_endpoint: None,
            sentry_dsn: None,
            environment: None,
            version: None,
        }
    }
}

impl TelemetryConfig {
    fn level(&self) -> Level {
        match self.log_level.to_uppercase().as_str() {
            "TRACE" => Level::TRACE,
            "DEBUG" => Level::DEBUG,
            "WARN" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => Level::INFO,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        QUIET_TARGETS
            .iter()
            .filter_map(|directive| directive.parse::<Directive>().ok())
            .fold(
                EnvFilter::from_default_env().add_directive(self.level().into()),
                EnvFilter::add_directive,
            )
    }
}

/// Active telemetry handles that need graceful shutdown.
pub struct TelemetryGuard {
    #[cfg(feature = "otlp")]
    otel_provider: Option<SdkTracerProvider>,
    #[cfg(feature = "sentry")]
    _sentry_guard: Option<sentry::ClientInitGuard>,
}

impl TelemetryGuard {
    /// Flush and shut down exporters.
    pub fn shutdown(self) {
        #[cfg(feature = "otlp")]
        if let Some(provider) = self.otel_provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry provider: {e}");
        }
        // Sentry guard flushes on drop
    }
}

/// Install the Prometheus recorder and return the handle for `/metrics`.
///
/// # Errors
/// Fails if a global recorder is already installed.
#[cfg(feature = "prometheus")]
pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    Ok(metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?)
}

#[cfg(feature = "otlp")]
fn init_opentelemetry(
    config: &TelemetryConfig,
) -> Result<Option<SdkTracerProvider>, TelemetryError> {
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(5))
        .build()?;

    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", config.service_name.clone())])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());

    Ok(Some(provider))
}

#[cfg(feature = "sentry")]
fn init_sentry(config: &TelemetryConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: config.version.clone().map(Into::into),
            environment: config.environment.clone().map(Into::into),
            traces_sample_rate: 0.2,
            attach_stacktrace: true,
            // Request headers carry tokens and signatures
            send_default_pii: false,
            ..Default::default()
        },
    ));

    if guard.is_enabled() {
        tracing::info!("Sentry initialized");
        Some(guard)
    } else {
        tracing::warn!("Sentry DSN provided but client not enabled");
        None
    }
}

/// Install the global subscriber and the configured exporters.
///
/// Keep the returned guard alive for the process lifetime and call
/// [`TelemetryGuard::shutdown`] on exit.
///
/// # Errors
/// Fails if the OTLP exporter cannot be built or a subscriber is already set.
pub fn setup_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = config.env_filter();

    // Sentry before the subscriber so its layer sees an active hub
    #[cfg(feature = "sentry")]
    let sentry_guard = init_sentry(config);

    #[cfg(feature = "otlp")]
    let otel_provider = init_opentelemetry(config)?;

    let fmt_layer = if config.json_logs {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
            .compact()
            .boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    #[cfg(feature = "otlp")]
    let registry = registry.with(otel_provider.as_ref().map(|provider| {
        use opentelemetry::trace::TracerProvider as _;
        let tracer = provider.tracer(config.service_name.clone());
        tracing_opentelemetry::layer().with_tracer(tracer)
    }));

    #[cfg(feature = "sentry")]
    let registry = registry.with(sentry_guard.as_ref().map(|_| sentry_tracing::layer()));

    registry.try_init()?;

    Ok(TelemetryGuard {
        #[cfg(feature = "otlp")]
        otel_provider,
        #[cfg(feature = "sentry")]
        _sentry_guard: sentry_guard,
    })
}

/// Report an error to Sentry tagged with its wire code.
#[cfg(feature = "sentry")]
pub fn capture_error<E: std::fmt::Display>(error: &E, code: u32) {
    sentry::with_scope(
        |scope| scope.set_tag("error.code", code),
        || sentry::capture_message(&error.to_string(), sentry::Level::Error),
    );
}

/// Report an error to Sentry (no-op without the `sentry` feature).
#[cfg(not(feature = "sentry"))]
pub fn capture_error<E: std::fmt::Display>(_error: &E, _code: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, SERVICE_NAME);
        assert_eq!(config.log_level, "INFO");
        assert!(config.json_logs);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn unknown_level_defaults_to_info() {
        let config = TelemetryConfig {
            log_level: "chatty".to_string(),
            ..TelemetryConfig::default()
        };
        assert_eq!(config.level(), Level::INFO);

        let config = TelemetryConfig {
            log_level: "debug".to_string(),
            ..TelemetryConfig::default()
        };
        assert_eq!(config.level(), Level::DEBUG);
    }
}
