// related_world_server/server/src/operational/monitoring/metrics.rs
use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

pub const DEFAULT_METRICS_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9090);

pub struct MetricsSystem {
    start_time: Instant,
}

impl MetricsSystem {
    pub fn new() -> Result<Self> {
        Self::with_listener(DEFAULT_METRICS_ADDR.into())
    }

    pub fn with_listener(addr: SocketAddr) -> Result<Self> {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;

        describe_gauge!("related_worlds_loaded", "Number of related worlds currently registered");
        describe_histogram!("related_world_tick_seconds", "Time spent ticking one related world");
        describe_counter!("replication_actors_gathered_total", "Actors selected for replication across all connections");
        describe_gauge!("replication_routing_rules", "Live per-world routing rules in the domain routers");
        describe_counter!("movement_payloads_rejected_total", "Movement RPC payloads rejected as oversized or malformed");
        describe_counter!("deferred_world_moves_total", "World moves deferred by a pending origin shift");
        describe_histogram!("server_frame_time_seconds", "Server frame processing time in seconds");
        describe_counter!("server_frames_total", "Total number of server frames processed");
        describe_gauge!("server_connections", "Open client connections on the shared net driver");

        Ok(MetricsSystem { start_time: Instant::now() })
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

pub fn init_logging() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "related_world_server_core=info,warn".into()))
        .with(fmt::layer())
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
