//! dynmerge - dynamic fan-in merge demo
//!
//! CLI entry point that runs a merge of generated inner streams.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use dynmerge::cli::{Cli, Command, OutputFormat};
use dynmerge::config::Config;
use dynmerge::merge::{Environment, MergeCoordinator, MergeStats};
use dynmerge::reactive::{BoxPublisher, ChannelSubscriber, IterPublisher, Publisher, Signal};

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dynmerge")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Setup tracing subscriber - write to log file, not stdout/stderr
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("dynmerge.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

/// What a demo run observed
#[derive(Debug, Serialize)]
struct RunReport {
    streams: usize,
    expected: u64,
    received: u64,
    completed: bool,
    error: Option<String>,
    #[serde(rename = "elapsed-ms")]
    elapsed_ms: u128,
    stats: MergeStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose).context("Failed to setup logging")?;

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!(
        "dynmerge loaded config: capacity={}, dispatcher={:?}",
        config.merge.capacity, config.merge.dispatcher
    );

    match cli.command {
        Some(Command::Run {
            streams,
            elements,
            batch,
            format,
        }) => {
            let mut demo = config.demo.clone();
            if let Some(streams) = streams {
                demo.inner_streams = streams;
            }
            if let Some(elements) = elements {
                demo.elements_per_stream = elements;
            }
            if let Some(batch) = batch {
                demo.batch = batch;
            }
            let report = run_merge(&config, &demo).await?;
            print_report(&report, &format)?;
        }
        Some(Command::Config) => {
            print!("{}", config.to_yaml()?);
        }
        None => {
            let report = run_merge(&config, &config.demo).await?;
            print_report(&report, &OutputFormat::Text)?;
        }
    }

    Ok(())
}

async fn run_merge(config: &Config, demo: &dynmerge::config::DemoConfig) -> Result<RunReport> {
    info!(
        streams = demo.inner_streams,
        elements = demo.elements_per_stream,
        batch = demo.batch,
        "Starting demo merge"
    );

    let per_stream = demo.elements_per_stream as u64;
    let inners: Vec<BoxPublisher<u64>> = (0..demo.inner_streams as u64)
        .map(|i| {
            let values: Vec<u64> = (i * per_stream..(i + 1) * per_stream).collect();
            Arc::new(IterPublisher::new(values)) as BoxPublisher<u64>
        })
        .collect();
    let outer = IterPublisher::new(inners);

    let coordinator = MergeCoordinator::<u64>::new();
    coordinator
        .capacity(config.merge.capacity)
        .environment(Environment::from_kind(config.merge.dispatcher));

    let (subscriber, mut rx) = ChannelSubscriber::new(demo.batch);
    coordinator.subscribe(subscriber);

    let started = Instant::now();
    outer.subscribe(coordinator.clone());

    let mut received = 0u64;
    let mut completed = false;
    let mut error = None;
    let deadline = Duration::from_millis(demo.timeout_ms);

    loop {
        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(Signal::Next(_))) => received += 1,
            Ok(Some(Signal::Complete)) => {
                completed = true;
                break;
            }
            Ok(Some(Signal::Error(cause))) => {
                warn!(%cause, "Merged stream failed");
                error = Some(cause.to_string());
                break;
            }
            Ok(None) => {
                warn!("Signal channel closed before the merge terminated");
                break;
            }
            Err(_) => {
                warn!(timeout_ms = demo.timeout_ms, "Timed out waiting for the merge");
                error = Some(format!("timed out after {}ms", demo.timeout_ms));
                break;
            }
        }
    }

    let report = RunReport {
        streams: demo.inner_streams,
        expected: per_stream * demo.inner_streams as u64,
        received,
        completed,
        error,
        elapsed_ms: started.elapsed().as_millis(),
        stats: coordinator.stats(),
    };
    info!(received = report.received, completed = report.completed, "Demo merge finished");
    Ok(report)
}

fn print_report(report: &RunReport, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            let status = match (&report.error, report.completed) {
                (Some(e), _) => format!("failed: {}", e).red(),
                (None, true) => "completed".green(),
                (None, false) => "incomplete".yellow(),
            };
            println!("{} {}", "Merge".bold(), status);
            println!("  streams:        {}", report.streams);
            println!("  received:       {}/{}", report.received, report.expected);
            println!("  elapsed:        {}ms", report.elapsed_ms);
            println!("  stage:          {}", report.stats.stage_id.dimmed());
            println!("  inner accepted: {}", report.stats.inner_accepted);
            println!("  inner finished: {}", report.stats.inner_finished);
            println!("  in flight:      {}", report.stats.in_flight);
        }
    }
    Ok(())
}
