use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, new_exporter, new_pipeline};
use opentelemetry_sdk::{Resource, runtime::Tokio, trace::Tracer};
use std::path::Path;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
// exporing the info! warn! etc tracing macro through this Library
pub use tracing;
pub use tracing::*;

use crate::result::Result;

pub fn init_apm(service_name: &str, rank: &str, endpoint: &str) -> Result<Tracer> {
    let otlp_exporter = new_exporter().http().with_endpoint(endpoint);
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.rank", rank.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    let tracer = new_pipeline()
        .tracing()
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
        .with_exporter(otlp_exporter)
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// Installs the json file layer, the stdout layer and, when an endpoint is given,
/// the otlp export layer. The returned guard must outlive the process work.
pub fn init_logger(
    service_name: &str,
    rank: &str,
    level: &str,
    apm_endpoint: Option<&str>,
    log_base: &str,
) -> Result<WorkerGuard> {
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        Path::new(log_base).join(service_name),
        format!("rank-{rank}.log"),
    );
    let (non_blocking, gaurd) = tracing_appender::non_blocking(file_appender);
    let json_layer = fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_line_number(true)
        .with_file(true)
        .with_thread_names(true)
        .with_current_span(true)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .flatten_event(true);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(false);
    let filter = EnvFilter::builder()
        .with_default_directive(level.parse::<Level>().unwrap_or(Level::INFO).into())
        .from_env_lossy();

    // otlp export is optional, a rank without an apm endpoint only logs locally
    let telemetry_layer = match apm_endpoint {
        Some(endpoint) => {
            let tracer = init_apm(service_name, rank, endpoint)
                .map_err(|e| format!("Error while creating tracer for {endpoint}: {e}"))?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(json_layer)
        .with(stdout_layer)
        .with(filter)
        .with(telemetry_layer)
        .try_init()?;
    info!(service = %service_name, %rank, "Logging initialized");
    if let Some(endpoint) = apm_endpoint {
        info!(%endpoint, "Exporting spans to apm");
    }
    Ok(gaurd)
}
