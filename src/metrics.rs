use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "syncope";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job metrics
    pub static ref JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_job_executions_total"), "Job executions by outcome"),
        &["job", "status"]
    ).expect("Failed to create job_executions_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0]),
        &["job"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_jobs_running"), "Whether a job is currently executing on this node"),
        &["job"]
    ).expect("Failed to create jobs_running metric");

    pub static ref LOCK_CONTENTION_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_lock_contention_total"),
            "Job fires skipped because the job lock was held"
        ),
        &["domain"]
    ).expect("Failed to create lock_contention_total metric");

    // Reconciliation metrics
    pub static ref SYNC_RESULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_sync_results_total"), "Reconciliation results"),
        &["direction", "operation", "status"]
    ).expect("Failed to create sync_results_total metric");

    // System metrics
    pub static ref SYSTEM_LOAD_AVERAGE: Gauge = Gauge::new(
        format!("{PREFIX}_system_load_average"),
        "One minute system load average"
    ).expect("Failed to create system_load_average metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(LOCK_CONTENTION_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYNC_RESULTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SYSTEM_LOAD_AVERAGE.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));
}

pub fn record_job_execution(job: &str, status: &str, duration: Duration) {
    JOB_EXECUTIONS_TOTAL.with_label_values(&[job, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job])
        .observe(duration.as_secs_f64());
}

pub fn set_job_running(job: &str, running: bool) {
    JOBS_RUNNING
        .with_label_values(&[job])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_lock_contention(domain: &str) {
    LOCK_CONTENTION_TOTAL.with_label_values(&[domain]).inc();
}

pub fn record_sync_result(direction: &str, operation: &str, status: &str) {
    SYNC_RESULTS_TOTAL
        .with_label_values(&[direction, operation, status])
        .inc();
}

/// Sample the one minute load average. Returns the value that was recorded.
pub fn update_system_load() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
            if let Some(load) = loadavg
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
            {
                SYSTEM_LOAD_AVERAGE.set(load);
                return Some(load);
            }
        }
    }
    None
}

/// Update process memory usage
pub fn update_memory_usage() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // RSS is reported in kB
                    if let Some(kb) = line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|s| s.parse::<f64>().ok())
                    {
                        PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                        return Some(kb * 1024.0);
                    }
                }
            }
        }
    }
    None
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_metric(name: &str) -> bool {
        REGISTRY.gather().iter().any(|m| m.get_name() == name)
    }

    #[test]
    fn test_metrics_initialization() {
        init_metrics();
        // gauges are exported even before being touched
        assert!(has_metric("syncope_process_memory_bytes"));
    }

    #[test]
    fn test_record_job_execution() {
        init_metrics();
        record_job_execution("Master/taskJob1", "success", Duration::from_millis(20));
        assert!(has_metric("syncope_job_executions_total"));
        assert!(has_metric("syncope_job_duration_seconds"));
    }

    #[test]
    fn test_record_sync_result() {
        init_metrics();
        record_sync_result("pull", "CREATE", "SUCCESS");
        let value = SYNC_RESULTS_TOTAL
            .with_label_values(&["pull", "CREATE", "SUCCESS"])
            .get();
        assert!(value >= 1.0);
    }

    #[test]
    fn test_lock_contention_counter() {
        init_metrics();
        let before = LOCK_CONTENTION_TOTAL.with_label_values(&["Metrics"]).get();
        record_lock_contention("Metrics");
        let after = LOCK_CONTENTION_TOTAL.with_label_values(&["Metrics"]).get();
        assert_eq!(after, before + 1.0);
    }
}
