//! Logging, Prometheus metrics and optional span export for the edge binary.
//!
//! Spans cover the relay paths (`client_session`, `registry_connect`, and the
//! worker's inbound handling). Setting `RELAY_EDGE_OTEL_STDOUT` exports them
//! to stdout tagged with the worker id.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const OTEL_STDOUT_ENV: &str = "RELAY_EDGE_OTEL_STDOUT";
const SERVICE_NAME: &str = "relay-edge";
const DEFAULT_FILTER: &str = "info";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    span_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(worker_id: &str) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_relay_metrics();

        let span_provider = is_truthy(&std::env::var(OTEL_STDOUT_ENV).unwrap_or_default())
            .then(|| span_provider(worker_id));
        let span_layer = span_provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(span_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if span_provider.is_some() {
            info!(worker_id, "exporting relay spans to stdout");
        }

        Ok(Self {
            metrics_handle,
            span_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.span_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter did not flush on shutdown");
            }
        }
    }
}

fn span_provider(worker_id: &str) -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("relay.worker_id", worker_id.to_string()),
        ])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

fn describe_relay_metrics() {
    describe_gauge!(
        "relay_edge_sessions_active",
        Unit::Count,
        "Client sessions currently registered, per channel"
    );
    describe_counter!(
        "relay_edge_connections_total",
        "Client sessions registered, per channel"
    );
    describe_counter!(
        "relay_edge_publish_total",
        "Messages published to backends, by message kind"
    );
    describe_counter!(
        "relay_edge_backend_unreachable_total",
        "Connections rolled back because no backend owned the channel"
    );
    describe_counter!(
        "relay_edge_backend_duplicate_total",
        "newConnection messages received by more than one backend"
    );
    describe_counter!(
        "relay_edge_callbacks_resolved_total",
        "Backend acknowledgments delivered to a client"
    );
    describe_counter!(
        "relay_edge_callbacks_dropped_total",
        "Backend acknowledgments with no pending callback"
    );
    describe_counter!(
        "relay_edge_origin_rejected_total",
        "Websocket upgrades refused by the origin filter"
    );
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
