//! Ping/pong round trips through an in-process router
//!
//! Usage:
//!   nmr_ping --count 100
//!   nmr_ping --config config/nmr.toml --timeout-ms 50 --log-level debug

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use nmr::{Channel, Endpoint, Exchange, Nmr, NmrConfig, NmrError, NmrResult, Pattern, Status};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nmr_ping")]
#[command(about = "Send ping exchanges to an echo endpoint and wait for the pong")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Number of round trips
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,

    /// Per round trip timeout in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

/// Answers every `in` message with an out message containing "pong"
#[derive(Default)]
struct Pong {
    channel: Mutex<Option<Channel>>,
}

#[async_trait]
impl Endpoint for Pong {
    fn set_channel(&self, channel: Channel) {
        *self.channel.lock() = Some(channel);
    }

    async fn process(&self, exchange: Arc<Exchange>) -> NmrResult<()> {
        if exchange.status() != Status::Active {
            return Ok(());
        }
        let channel = self
            .channel
            .lock()
            .clone()
            .ok_or_else(|| NmrError::illegal_state("pong endpoint has no channel"))?;

        let mut out = nmr::Message::new();
        out.set_body("pong");
        exchange.set_message(nmr::MessageType::Out, out)?;
        channel.send(&exchange)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = match &args.config {
        Some(path) => NmrConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => NmrConfig::default(),
    };

    let nmr = Nmr::with_config(config)?;
    nmr.register_endpoint(Arc::new(Pong::default()), Some(properties(json!({"service": "pong"}))))?;

    let client = nmr.create_channel()?;
    let target = nmr.property_reference(properties(json!({"service": "pong"})));
    let timeout = Duration::from_millis(args.timeout_ms);

    info!(router = %nmr.name(), count = args.count, "Starting ping run");
    let started = Instant::now();
    let mut failures = 0usize;

    for i in 0..args.count {
        let exchange = client.create_exchange(Pattern::InOut);
        exchange.set_target(target.clone());
        exchange.in_message().set_body(json!({"ping": i}));

        if !client.send_sync_timeout(&exchange, timeout).await? {
            failures += 1;
            warn!(exchange_id = %exchange.id(), error = ?exchange.error(), "Ping failed");
            continue;
        }

        let reply = exchange.out_message().and_then(|out| out.body());
        exchange.set_status(Status::Done);
        client.send(&exchange)?;
        info!(exchange_id = %exchange.id(), reply = ?reply, "Pong received");
    }

    let elapsed = started.elapsed();
    info!(
        round_trips = args.count - failures,
        failures,
        elapsed_ms = elapsed.as_millis() as u64,
        stats = ?client.stats(),
        "Ping run complete"
    );

    nmr.shutdown()?;
    Ok(())
}

fn properties(value: Value) -> nmr::Properties {
    serde_json::from_value(value).unwrap_or_default()
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
