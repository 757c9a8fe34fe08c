use healthsense_simulator::analyze::analyze_file;
use healthsense_simulator::event_log::{read_log, LOG_HEADER};
use healthsense_simulator::{
    run_simulation, DryRunPublisher, PercentileMode, Publisher, SimulatorConfig,
    SimulatorSettings, StopReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(dir: &TempDir, devices: usize, interval_ms: u64, duration_ms: u64) -> SimulatorConfig {
    SimulatorConfig {
        device_count: devices,
        interval: Duration::from_millis(interval_ms),
        duration: Some(Duration::from_millis(duration_ms)),
        metrics_file: dir.path().join("simulator-metrics.csv"),
        seed: Some(42),
        ..Default::default()
    }
}

fn dry_run(latency_ms: u64, failure_rate: f64) -> Arc<dyn Publisher> {
    Arc::new(DryRunPublisher::new(
        Duration::from_millis(latency_ms),
        failure_rate,
    ))
}

#[tokio::test(start_paused = true)]
async fn short_run_logs_every_event() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 5, 100, 500);
    let log_path = config.metrics_file.clone();

    let report = run_simulation(config, dry_run(0, 0.0), std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.stop_reason, StopReason::Deadline);
    assert_eq!(report.devices_stopped, 5);
    let m = &report.metrics;
    assert_eq!(m.total_published, 25);
    assert_eq!(m.total_errors, 0);

    let text = std::fs::read_to_string(&log_path).unwrap();
    assert_eq!(text.lines().next(), Some(LOG_HEADER));
    assert_eq!(text.lines().count() as u64, m.total_attempts() + 1);

    let contents = read_log(&log_path).unwrap();
    assert_eq!(contents.malformed, 0);
    let mut per_device: HashMap<String, u64> = HashMap::new();
    for row in &contents.rows {
        assert!(row.success);
        *per_device.entry(row.device_id.clone()).or_default() += 1;
    }
    assert_eq!(per_device.len(), 5);
    assert!(per_device.values().all(|n| *n == 5));
    assert!(per_device.contains_key("watch-0004"));
}

#[tokio::test(start_paused = true)]
async fn failing_broker_counts_errors_only() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 3, 100, 1000);
    let log_path = config.metrics_file.clone();

    let report = run_simulation(config, dry_run(2, 1.0), std::future::pending())
        .await
        .unwrap();

    let m = &report.metrics;
    assert_eq!(m.total_published, 0);
    assert_eq!(m.total_errors, 30);
    assert_eq!(m.avg_latency_ms, 0.0);
    assert_eq!(m.p99_latency_ms, 0);
    assert_eq!(m.success_rate_pct(), 0.0);

    let contents = read_log(&log_path).unwrap();
    assert_eq!(contents.rows.len() as u64, m.total_errors);
    assert!(contents.rows.iter().all(|r| !r.success && r.latency_ms == 2));
}

#[tokio::test(start_paused = true)]
async fn attempts_bounded_by_cadence() {
    // Covers durations that are and are not a multiple of the interval
    for (devices, interval_ms, duration_ms) in [
        (1, 100, 950),
        (20, 75, 400),
        (8, 250, 2000),
        (20, 50, 300),
    ] {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, devices, interval_ms, duration_ms);

        let report = run_simulation(config, dry_run(1, 0.2), std::future::pending())
            .await
            .unwrap();

        let expected = devices as u64 * (duration_ms / interval_ms);
        assert_eq!(
            report.metrics.total_attempts(),
            expected,
            "{} devices every {}ms for {}ms",
            devices,
            interval_ms,
            duration_ms
        );
    }
}

#[tokio::test(start_paused = true)]
async fn histogram_mode_reports_percentiles() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 4, 100, 1000);
    config.percentiles = PercentileMode::Histogram;

    let report = run_simulation(config, dry_run(7, 0.0), std::future::pending())
        .await
        .unwrap();

    let m = &report.metrics;
    assert_eq!(m.avg_latency_ms, 7.0);
    assert_eq!(m.p50_latency_ms, 7);
    assert_eq!(m.p99_latency_ms, 7);
    assert!(m.p50_latency_ms <= m.p95_latency_ms && m.p95_latency_ms <= m.p99_latency_ms);
}

#[tokio::test(start_paused = true)]
async fn yaml_settings_drive_a_run() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join("from-yaml.csv");
    let yaml = format!(
        "tenant_id: north-ward\ndevices: 2\ninterval_ms: 200\nduration_secs: 1\nmetrics_file: {}\ndry_run: true\ndry_run_latency_ms: 3\n",
        log_path.display()
    );

    let config = SimulatorSettings::from_yaml(&yaml)
        .unwrap()
        .into_config()
        .unwrap();
    let publisher: Arc<dyn Publisher> = match &config.transport {
        healthsense_simulator::TransportConfig::DryRun {
            latency,
            failure_rate,
        } => Arc::new(DryRunPublisher::new(*latency, *failure_rate)),
        other => panic!("expected dry run, got {}", other),
    };

    let report = run_simulation(config, publisher, std::future::pending())
        .await
        .unwrap();
    assert_eq!(report.tenant_id, "north-ward");
    assert_eq!(report.metrics.total_published, 10);
    assert!(log_path.exists());
}

#[tokio::test(start_paused = true)]
async fn analyzer_agrees_with_live_snapshot() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 5, 100, 1000);
    let log_path = config.metrics_file.clone();

    let report = run_simulation(config, dry_run(4, 0.1), std::future::pending())
        .await
        .unwrap();
    let summary = analyze_file(&log_path).unwrap();

    let m = &report.metrics;
    assert_eq!(summary.rows, m.total_attempts());
    assert_eq!(summary.successes, m.total_published);
    assert_eq!(summary.devices, 5);
    assert_eq!(summary.malformed_rows, 0);
    if m.total_published > 0 {
        assert_eq!(summary.p95_latency_ms, m.p95_latency_ms);
        assert_eq!(summary.avg_latency_ms, m.avg_latency_ms);
    }
}
