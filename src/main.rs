use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::ratelimit::Snapshot;
use quotaguard::{Algorithm, GuardError, QuotaGuardConfig, Registry};

/// Drive a simulated workload through a keyed limiter registry and report
/// the resulting quota state.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Args {
    /// YAML configuration file; QUOTAGUARD__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the admission algorithm
    #[arg(long)]
    algorithm: Option<String>,

    /// Override the per-window capacity
    #[arg(long)]
    capacity: Option<u64>,

    /// Override the window length in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,

    /// Comma-separated keys to spread calls across
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    keys: Vec<String>,

    /// Rounds of calls; each round hits every key once
    #[arg(long, default_value_t = 20)]
    rounds: u32,

    /// Pause between rounds in milliseconds
    #[arg(long, default_value_t = 50)]
    interval_ms: u64,

    /// Probability that a simulated operation fails
    #[arg(long, default_value_t = 0.0, value_parser = parse_probability)]
    failure_rate: f64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Default, Serialize)]
struct Totals {
    admitted: u64,
    limited: u64,
    failed: u64,
}

#[derive(Debug, Serialize)]
struct KeyReport {
    #[serde(flatten)]
    snapshot: Snapshot,
    reset_at: String,
}

#[derive(Debug, Serialize)]
struct Report {
    algorithm: Algorithm,
    capacity: u64,
    window_ms: u64,
    totals: Totals,
    keys: BTreeMap<String, KeyReport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting quotaguard simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = QuotaGuardConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(algorithm) = &args.algorithm {
        config.limiter.algorithm = algorithm.parse()?;
    }
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(window_ms) = args.window_ms {
        config.limiter.window = Duration::from_millis(window_ms);
    }
    info!(
        algorithm = %config.limiter.algorithm,
        capacity = config.limiter.capacity,
        window_ms = config.limiter.window.as_millis() as u64,
        "Configuration loaded"
    );

    let registry = Registry::new(config.limiter.clone(), config.registry.clone())?;
    let workload = simulate(
        &registry,
        &args.keys,
        args.rounds,
        args.interval_ms,
        args.failure_rate,
    );
    let totals = tokio::select! {
        totals = workload => totals,
        _ = shutdown_signal() => {
            warn!("Simulation interrupted");
            Totals::default()
        }
    };

    let now = Instant::now();
    let keys = registry
        .snapshots()
        .into_iter()
        .map(|(key, snapshot)| {
            let until_reset = snapshot.reset_at.saturating_duration_since(now);
            let until_reset =
                chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());
            let reset_at = chrono::Utc::now() + until_reset;
            (
                key,
                KeyReport {
                    snapshot,
                    reset_at: reset_at.to_rfc3339(),
                },
            )
        })
        .collect();

    let report = Report {
        algorithm: config.limiter.algorithm,
        capacity: config.limiter.capacity,
        window_ms: config.limiter.window.as_millis() as u64,
        totals,
        keys,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    registry.destroy();
    info!("Quotaguard simulation finished");
    Ok(())
}

async fn simulate(
    registry: &Registry,
    keys: &[String],
    rounds: u32,
    interval_ms: u64,
    failure_rate: f64,
) -> Totals {
    let mut totals = Totals::default();

    for round in 0..rounds {
        let failures: Vec<bool> = {
            let mut rng = rand::thread_rng();
            keys.iter().map(|_| rng.gen_bool(failure_rate)).collect()
        };

        let calls = keys.iter().zip(failures).map(|(key, fail)| {
            registry.dispatch(key, move || async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                if fail {
                    Err("simulated failure")
                } else {
                    Ok(())
                }
            })
        });

        for result in futures::future::join_all(calls).await {
            match result {
                Ok(()) => totals.admitted += 1,
                Err(GuardError::LimitExceeded { retry_after }) => {
                    totals.limited += 1;
                    info!(
                        round = round,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Call rejected"
                    );
                }
                Err(GuardError::Operation(_)) => {
                    totals.admitted += 1;
                    totals.failed += 1;
                }
                Err(GuardError::Destroyed) => break,
            }
        }

        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }

    totals
}

/// Parse a probability in `[0, 1]`.
fn parse_probability(value: &str) -> Result<f64, String> {
    let probability: f64 = value
        .parse()
        .map_err(|e| format!("`{}` is not a number: {}", value, e))?;
    if !(0.0..=1.0).contains(&probability) {
        return Err(format!("`{}` is not between 0 and 1", value));
    }
    Ok(probability)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
