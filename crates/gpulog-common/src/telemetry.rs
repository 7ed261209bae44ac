use std::collections::HashMap;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install logging for a `gpulog` run.
///
/// A collection run is short-lived and usually started from cron, so the
/// per-GPU warnings and the final summary line go to stderr where the cron
/// mail or journal picks them up. `RUST_LOG` filters, default `info`.
///
/// With `otlp_endpoint` set, the day-run spans are also shipped over
/// OTLP/HTTP so a slow or failing node shows up next to the rest of the
/// cluster's traces. An exporter that cannot be built never stops the run;
/// it only downgrades to stderr logging.
///
/// Call `shutdown()` on the returned provider before exit, otherwise the
/// batch exporter drops whatever the run produced last.
pub fn init_tracing(
    service_name: &str,
    otlp_endpoint: Option<&str>,
    otlp_token: Option<&str>,
) -> Option<TracerProvider> {
    let endpoint = otlp_endpoint.map(str::trim).filter(|e| !e.is_empty());
    let (provider, export_error) = match endpoint.map(|e| otlp_provider(service_name, e, otlp_token)) {
        Some(Ok(p)) => (Some(p), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(service_name.to_string())));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(otel_layer)
        .init();

    match (endpoint, export_error) {
        (Some(endpoint), Some(e)) => tracing::warn!(
            endpoint,
            error=%e,
            "OTLP exporter unavailable, collection runs with stderr logging only"
        ),
        (Some(endpoint), None) => tracing::info!(endpoint, service_name, "exporting run spans over OTLP"),
        _ => {}
    }
    provider
}

fn otlp_provider(
    service_name: &str,
    endpoint: &str,
    token: Option<&str>,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(otlp_headers(token))
        .build()?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .build())
}

/// Bearer header for the collector endpoint; a blank token sends none.
fn otlp_headers(token: Option<&str>) -> HashMap<String, String> {
    token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| ("Authorization".to_string(), format!("Bearer {t}")))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_otlp_headers() {
        assert!(otlp_headers(None).is_empty());
        assert!(otlp_headers(Some("  ")).is_empty());
        assert_eq!(
            otlp_headers(Some("tok")).get("Authorization").map(String::as_str),
            Some("Bearer tok")
        );
    }
}
