/// Minimal Prometheus metrics, served as text format over a tiny `axum`
/// endpoint on a background thread with its own single-threaded Tokio
/// runtime. The core fetch/report pipeline stays synchronous; only this
/// exporter is async.
use axum::{routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct Metrics {
    pub registry: Registry,
    pub chain_head_height: Gauge,
    pub sync_fraction: Gauge,
    pub skips_emitted_total: IntCounter,
    pub offline_events_emitted_total: IntCounter,
    pub equivocations_emitted_total: IntCounter,
    pub last_cycle_duration_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let chain_head_height = Gauge::new("tlbc_monitor_chain_head_height", "Current canonical chain head height").unwrap();
        let sync_fraction = Gauge::new("tlbc_monitor_sync_fraction", "Fraction of the way to the remote chain head").unwrap();
        let skips_emitted_total = IntCounter::new("tlbc_monitor_skips_emitted_total", "Skipped proposal events emitted").unwrap();
        let offline_events_emitted_total = IntCounter::new("tlbc_monitor_offline_events_emitted_total", "Offline validator events emitted").unwrap();
        let equivocations_emitted_total = IntCounter::new("tlbc_monitor_equivocations_emitted_total", "Equivocation events emitted").unwrap();
        let last_cycle_duration_seconds = Gauge::new("tlbc_monitor_last_cycle_duration_seconds", "Wall time of the most recent fetch cycle").unwrap();

        registry.register(Box::new(chain_head_height.clone())).unwrap();
        registry.register(Box::new(sync_fraction.clone())).unwrap();
        registry.register(Box::new(skips_emitted_total.clone())).unwrap();
        registry.register(Box::new(offline_events_emitted_total.clone())).unwrap();
        registry.register(Box::new(equivocations_emitted_total.clone())).unwrap();
        registry.register(Box::new(last_cycle_duration_seconds.clone())).unwrap();

        Self {
            registry,
            chain_head_height,
            sync_fraction,
            skips_emitted_total,
            offline_events_emitted_total,
            equivocations_emitted_total,
            last_cycle_duration_seconds,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn render_metrics(registry: Arc<Registry>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf).expect("encoding prometheus metrics");
    String::from_utf8(buf).expect("prometheus output is valid utf8")
}

/// Spawns the metrics server on a dedicated OS thread with its own
/// single-threaded Tokio runtime, so the synchronous core pipeline never
/// has to enter an async context.
pub fn spawn_metrics_server(registry: Registry, addr: SocketAddr) -> std::thread::JoinHandle<()> {
    let registry = Arc::new(registry);
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("building metrics runtime");
        runtime.block_on(async move {
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let registry = registry.clone();
                    async move { render_metrics(registry).await }
                }),
            );
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(error = %e, "metrics server failed to bind, disabling");
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, app).await {
                tracing::warn!(error = %e, "metrics server exited");
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn renders_text_format_with_registered_metrics() {
        let metrics = Metrics::new();
        metrics.chain_head_height.set(42.0);
        metrics.skips_emitted_total.inc();
        let text = render_metrics(Arc::new(metrics.registry)).await;
        assert!(text.contains("tlbc_monitor_chain_head_height 42"));
        assert!(text.contains("tlbc_monitor_skips_emitted_total"));
    }
}
