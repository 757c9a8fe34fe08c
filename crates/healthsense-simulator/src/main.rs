//! CLI entry point for the wearable telemetry load simulator.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use healthsense_simulator::{
    analyze::{analyze_files, render_markdown, render_table},
    config::{PercentileMode, SimulatorConfig, SimulatorSettings, TransportConfig},
    coordinator::run_simulation,
    transport::{DryRunPublisher, MqttPublisher, Publisher},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "healthsense-simulator")]
#[command(about = "Wearable telemetry load simulator for MQTT ingestion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a device fleet publishing telemetry
    Run {
        /// YAML settings file; command line flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// MQTT broker URL
        #[arg(long)]
        broker: Option<String>,

        /// Number of devices to simulate
        #[arg(short, long)]
        devices: Option<usize>,

        /// Publish interval per device in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,

        /// Tenant the fleet belongs to
        #[arg(short, long)]
        tenant: Option<String>,

        /// Test duration in seconds (0 = run until interrupted)
        #[arg(short = 'D', long)]
        duration_secs: Option<u64>,

        /// Per-event CSV log
        #[arg(short, long)]
        metrics_file: Option<PathBuf>,

        /// Seconds between progress lines
        #[arg(long)]
        report_interval_secs: Option<u64>,

        /// Publish acknowledgement timeout in milliseconds (0 = none)
        #[arg(long)]
        publish_timeout_ms: Option<u64>,

        /// Percentile computation: exact or histogram
        #[arg(long)]
        percentiles: Option<PercentileMode>,

        /// Seed for reproducible vitals
        #[arg(long)]
        seed: Option<u64>,

        /// Simulate publishes without a broker
        #[arg(long)]
        dry_run: bool,

        /// Simulated publish latency for dry runs
        #[arg(long)]
        dry_run_latency_ms: Option<u64>,

        /// Fraction of simulated publishes that fail
        #[arg(long)]
        dry_run_failure_rate: Option<f64>,

        /// Output file for report (markdown)
        #[arg(short, long)]
        output: Option<String>,

        /// Also output JSON report
        #[arg(long)]
        json: bool,
    },

    /// Summarize metrics logs from earlier runs
    Analyze {
        /// Metrics CSV files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output file for the summary (markdown)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            broker,
            devices,
            interval_ms,
            tenant,
            duration_secs,
            metrics_file,
            report_interval_secs,
            publish_timeout_ms,
            percentiles,
            seed,
            dry_run,
            dry_run_latency_ms,
            dry_run_failure_rate,
            output,
            json,
        } => {
            let file_settings = match &config {
                Some(path) => SimulatorSettings::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => SimulatorSettings::default(),
            };
            let cli_settings = SimulatorSettings {
                tenant_id: tenant,
                devices,
                interval_ms,
                duration_secs,
                metrics_file,
                report_interval_secs,
                publish_timeout_ms,
                percentiles,
                fw_version: None,
                seed,
                broker,
                dry_run: dry_run.then_some(true),
                dry_run_latency_ms,
                dry_run_failure_rate,
            };
            let config = file_settings
                .merge(cli_settings)
                .into_config()
                .context("invalid configuration")?;

            run(config, output, json).await
        }

        Commands::Analyze { files, output } => {
            let summaries = analyze_files(&files)?;
            print!("{}", render_table(&summaries));

            if let Some(output_path) = output {
                let md_path = markdown_path(&output_path);
                std::fs::write(&md_path, render_markdown(&summaries))?;
                info!("Markdown summary saved to: {}", md_path);
            }
            Ok(())
        }
    }
}

async fn run(config: SimulatorConfig, output: Option<String>, json: bool) -> Result<()> {
    info!("Starting telemetry simulator");
    info!("Broker: {}", config.transport);
    info!("Devices: {}", config.device_count);
    info!("Interval: {:?}", config.interval);
    match config.duration {
        Some(d) => info!("Duration: {:?}", d),
        None => info!("Duration: until interrupted"),
    }

    let mut mqtt = None;
    let publisher: Arc<dyn Publisher> = match &config.transport {
        TransportConfig::Mqtt { broker_url } => {
            let client_id = format!("simulator-{}", chrono::Utc::now().timestamp());
            let client = Arc::new(
                MqttPublisher::connect(broker_url, &client_id)
                    .await
                    .with_context(|| format!("failed to connect to {}", broker_url))?,
            );
            mqtt = Some(Arc::clone(&client));
            client as Arc<dyn Publisher>
        }
        TransportConfig::DryRun {
            latency,
            failure_rate,
        } => Arc::new(DryRunPublisher::new(*latency, *failure_rate)),
    };

    let result = run_simulation(config, publisher, shutdown_signal()).await;

    if let Some(client) = mqtt {
        client.disconnect().await;
    }
    let report = result?;

    // Print summary to console
    report.print_summary();

    // Save report if output file specified
    if let Some(output_path) = output {
        let md_path = markdown_path(&output_path);
        std::fs::write(&md_path, report.to_markdown())?;
        info!("Markdown report saved to: {}", md_path);

        if json {
            let json_path = format!("{}.json", md_path.trim_end_matches(".md"));
            std::fs::write(&json_path, report.to_json())?;
            info!("JSON report saved to: {}", json_path);
        }
    }

    Ok(())
}

fn markdown_path(output_path: &str) -> String {
    if output_path.ends_with(".md") {
        output_path.to_string()
    } else {
        format!("{}.md", output_path)
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("SIGINT received, shutting down gracefully...");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down gracefully...");
        }
    }
}
