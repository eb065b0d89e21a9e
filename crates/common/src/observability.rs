use std::borrow::Cow;
use std::sync::Arc;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Guard object that ensures tracer provider shutdown (flush) on drop.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("tracing_error_events").increment(1);
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// A named group of log output, mapped to a `tracing` target prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCategory {
    pub name: &'static str,
    pub target: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum LogControlError {
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
    #[error("unknown log category: {0}")]
    UnknownCategory(String),
    #[error("invalid filter directive: {0}")]
    InvalidDirective(String),
    #[error("failed to swap log filter: {0}")]
    Reload(String),
}

/// Runtime handle over the process log filter.
///
/// Components never touch logger state directly; whoever owns a `LogControl`
/// (the config-change webhook) can change the base level or narrow output to
/// a set of categories. Categories left out of a narrowed set still emit
/// warnings and errors.
#[derive(Clone)]
pub struct LogControl {
    handle: Option<FilterHandle>,
    categories: Arc<Vec<LogCategory>>,
}

impl LogControl {
    /// A control with no installed filter; `apply` only computes directives.
    pub fn detached() -> Self {
        Self {
            handle: None,
            categories: Arc::new(Vec::new()),
        }
    }

    pub fn with_categories(mut self, categories: &[LogCategory]) -> Self {
        self.categories = Arc::new(categories.to_vec());
        self
    }

    pub fn categories(&self) -> &[LogCategory] {
        &self.categories
    }

    /// Build the `EnvFilter` directive string for a level and optional category set.
    pub fn directive(
        &self,
        level: &str,
        categories: Option<&[String]>,
    ) -> Result<String, LogControlError> {
        let level = level.trim().to_ascii_lowercase();
        if !matches!(
            level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            return Err(LogControlError::UnknownLevel(level));
        }

        let Some(selected) = categories else {
            return Ok(level);
        };

        let mut parts = vec!["warn".to_string()];
        for name in selected {
            let category = self
                .categories
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
                .ok_or_else(|| LogControlError::UnknownCategory(name.clone()))?;
            parts.push(format!("{}={level}", category.target));
        }
        Ok(parts.join(","))
    }

    /// Swap the active filter. Returns the directive now in effect.
    pub fn apply(
        &self,
        level: &str,
        categories: Option<&[String]>,
    ) -> Result<String, LogControlError> {
        let directive = self.directive(level, categories)?;
        let filter = EnvFilter::try_new(&directive)
            .map_err(|e| LogControlError::InvalidDirective(e.to_string()))?;
        if let Some(handle) = &self.handle {
            handle
                .reload(filter)
                .map_err(|e| LogControlError::Reload(e.to_string()))?;
        }
        Ok(directive)
    }

    /// The filter currently installed, if any.
    pub fn current_filter(&self) -> Option<String> {
        self.handle
            .as_ref()
            .and_then(|h| h.with_current(std::string::ToString::to_string).ok())
    }
}

/// Build a `tracing` dispatcher configured for:
/// - JSON logs to stdout
/// - EnvFilter that respects `RUST_LOG` (takes precedence) and falls back to `default_level`,
///   installed behind a reload layer so [`LogControl`] can change it at runtime
/// - `tracing_error_events` counter for ERROR events
/// - Optional OpenTelemetry OTLP trace export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
) -> (tracing::Dispatch, LogControl, Option<OtelGuard>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    let control = LogControl {
        handle: Some(handle),
        categories: Arc::new(Vec::new()),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json();

    let service_name = service_name.into();

    // OTLP export only when the endpoint env var exists; keeps local runs and tests quiet.
    let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();

    if let Some(endpoint) = otel_endpoint {
        use opentelemetry_otlp::WithExportConfig;

        let Ok(exporter) = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
        else {
            let subscriber = tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .with(ErrorCounterLayer);
            return (tracing::Dispatch::new(subscriber), control, None);
        };

        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]);

        // Requires a Tokio runtime; the binary is `#[tokio::main]`.
        let provider = opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer("whale_watcher");
        let _ = opentelemetry::global::set_tracer_provider(provider);

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let subscriber = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorCounterLayer)
            .with(otel_layer);

        (
            tracing::Dispatch::new(subscriber),
            control,
            Some(OtelGuard { _private: () }),
        )
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(ErrorCounterLayer);

        (tracing::Dispatch::new(subscriber), control, None)
    }
}
