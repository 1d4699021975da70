//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use weft_types::config::TelemetryConfig;
//!
//! // Human-readable logs, filtered by RUST_LOG
//! weft_observe::tracing_setup::init_tracing(&TelemetryConfig::default()).unwrap();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use weft_types::config::TelemetryConfig;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Build the `EnvFilter` for a telemetry config.
///
/// An explicit `filter` directive is used as-is; otherwise `RUST_LOG` applies.
pub fn build_env_filter(config: &TelemetryConfig) -> Result<EnvFilter, ParseError> {
    match config.filter.as_deref() {
        Some(directive) => EnvFilter::try_new(directive),
        None => Ok(EnvFilter::from_default_env()),
    }
}

/// Initialize the global tracing subscriber.
///
/// - Installs a `fmt` layer with span close timing, as text or (when
///   `json` is set) as JSON lines.
/// - When `otel` is set, additionally bridges spans to OpenTelemetry using a
///   stdout exporter.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or the global
/// subscriber has already been set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_env_filter(config)?;

    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
    });

    let otel_layer = config.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("weft");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        eprintln!("Warning: OTel tracer provider shutdown error: {e}");
    }
}
