//! kafka-manager - produce messages through a managed Kafka connection
//!
//! Runs one producer lifecycle: init, optional health check, produce every
//! message given on the command line (and on stdin with `--stdin`), then close.

use anyhow::Result;
use clap::Parser;
use kafka_manager::{args::Args, utils::format_bytes, BrokerProducerManager};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Initialize tracing subscriber with environment filter
///
/// Defaults to "info" level, or "error" in quiet mode.
/// Can be overridden via RUST_LOG environment variable.
fn setup_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(default_level)),
        )
        .init();
}

/// Totals reported when the run ends
#[derive(Default)]
struct ProduceSummary {
    messages: u64,
    bytes: u64,
}

/// Produces every positional message, then stdin lines when requested
async fn produce_all(
    manager: &BrokerProducerManager,
    args: &Args,
    summary: &mut ProduceSummary,
) -> Result<()> {
    for message in &args.messages {
        manager.produce(message.clone()).await?;
        summary.messages += 1;
        summary.bytes += message.len() as u64;
    }

    if args.stdin {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            let len = line.len() as u64;
            manager.produce(line).await?;
            summary.messages += 1;
            summary.bytes += len;
        }
    }
    Ok(())
}

async fn run(manager: &BrokerProducerManager, args: &Args) -> Result<ProduceSummary> {
    let config = args.to_input_config()?;
    manager.init(&config).await?;

    if !args.skip_health {
        manager.health().await?;
        info!("Kafka cluster is healthy");
    }

    let mut summary = ProduceSummary::default();
    produce_all(manager, args, &mut summary).await?;
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.quiet);

    let start = Instant::now();
    let manager = BrokerProducerManager::new();
    let outcome = run(&manager, &args).await;

    // Connections are released whether or not the run succeeded
    manager.close().await;

    let summary = outcome?;
    if summary.messages == 0 && !args.stdin {
        info!("No messages given, nothing produced");
    }
    info!(
        "Produced {} messages ({}) in {:.2}s",
        summary.messages,
        format_bytes(summary.bytes),
        start.elapsed().as_secs_f64()
    );
    if args.quiet {
        println!("{}", summary.messages);
    }
    Ok(())
}
