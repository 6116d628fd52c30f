//! Metric names and the Prometheus exporter

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::config::MetricsConfig;

pub const POLL_CYCLES: &str = "historian_poll_cycles_total";
pub const FAILED_CYCLES: &str = "historian_failed_cycles_total";
pub const SAMPLES_WRITTEN: &str = "historian_samples_written_total";
pub const BAD_SAMPLES: &str = "historian_bad_samples_total";
pub const CONTROLLER_READ_ERRORS: &str = "historian_controller_read_errors_total";
pub const CONNECTED_CONTROLLERS: &str = "historian_connected_controllers";
pub const CYCLE_DURATION: &str = "historian_cycle_duration_seconds";

/// Install the global recorder and its HTTP scrape endpoint
pub fn install_exporter(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| "Invalid metrics listen address")?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to start metrics exporter on {}", addr))?;

    describe();
    info!("Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}

fn describe() {
    metrics::describe_counter!(POLL_CYCLES, "Poll cycles executed");
    metrics::describe_counter!(
        FAILED_CYCLES,
        "Poll cycles that persisted no sample"
    );
    metrics::describe_counter!(SAMPLES_WRITTEN, "Samples committed to the store");
    metrics::describe_counter!(BAD_SAMPLES, "Samples recorded with bad quality");
    metrics::describe_counter!(
        CONTROLLER_READ_ERRORS,
        "Failed batch reads, by controller"
    );
    metrics::describe_gauge!(CONNECTED_CONTROLLERS, "Controllers currently connected");
    metrics::describe_histogram!(
        CYCLE_DURATION,
        metrics::Unit::Seconds,
        "Wall time of one poll cycle"
    );
}
