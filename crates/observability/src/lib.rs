use std::path::Path;
use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global subscriber. Logs go to stdout unless `log_dir` is set,
/// in which case they roll daily into `<log_dir>/<service>.log.*`.
/// Keep the returned guard alive for the life of the process.
pub fn init_tracing(service_name: &str, log_dir: Option<&Path>) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = match log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            format!("{service_name}.log"),
        )),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(log_dir.is_none())
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    guard
}

pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_engine_metrics();

    let _ = PROM_HANDLE.set(handle.clone());
    Ok(handle)
}

fn describe_engine_metrics() {
    describe_counter!("feed.accepted", "feed events applied to market state");
    describe_counter!("feed.duplicate", "feed events dropped as duplicates");
    describe_counter!("feed.out_of_order", "feed events older than applied state");
    describe_counter!("feed.rejected", "feed events with invalid prices");
    describe_counter!("quote.published", "quote plans handed to the execution port");
    describe_counter!("quote.skipped", "refresh ticks dropped because a cycle overran");
    describe_counter!("quote.defensive", "defensive or withdrawn plans due to gaps or staleness");
    describe_counter!("quote.degenerate", "quote cycles aborted on numeric degeneracy");
    describe_histogram!("quote.compute_us", Unit::Microseconds, "quote computation time");
    describe_gauge!("calibration.phase", "0 observation, 1 meta, 2 sampling, 3 complete");
    describe_gauge!("sigma.current", "smoothed toxicity multiplier");
    describe_gauge!("risk.q_hat", "normalized inventory");
    describe_counter!("persist.writes", "atomic snapshot writes");
}
