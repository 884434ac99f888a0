//! `dnsreplay` — thin CLI wiring a captured-query log to the replay engine.
//!
//! Deliberately minimal: parses arguments with `clap`, builds an
//! `EngineConfig`, drives `Engine::run_nowait` in a poll loop, and prints the
//! `current`/`sum` stats snapshots on an interval. All simulation logic
//! lives in `dnsreplay::replay`; nothing here touches client/request state.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use comfy_table::Table;

use dnsreplay::replay::ingest::QueryLogReader;
use dnsreplay::replay::{Engine, Transport};

/// Replay a captured DNS query log against a target resolver.
///
/// Each distinct source IP in the log is replayed as an independent client;
/// per-client UDP sockets or pooled TCP connections fan queries out to the
/// target exactly as the original traffic would have arrived. There is no
/// UDP retransmission — a lost datagram is counted as a timeout, not retried.
#[derive(Parser)]
#[command(name = "dnsreplay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a query log: one JSON object per line, `{"src_ip":...,
    /// "payload_hex":...}`.
    #[arg(value_name = "LOG_FILE")]
    log_file: PathBuf,

    /// Target resolver address.
    #[arg(short = 't', long, env = "DNSREPLAY_TARGET", default_value = "127.0.0.1")]
    target: String,

    /// Target resolver port.
    #[arg(short = 'p', long, env = "DNSREPLAY_PORT", default_value_t = 53)]
    port: u16,

    /// Transport to dispatch queries over.
    #[arg(long, value_enum, default_value = "udp")]
    transport: TransportArg,

    /// Maximum number of distinct client slots (source IPs).
    #[arg(long, default_value_t = 1000)]
    max_clients: u32,

    /// Per-request timeout in milliseconds; also bounds the latency
    /// histogram's range.
    #[arg(long, default_value_t = 2_000)]
    timeout_ms: u64,

    /// Idle timeout before an unused TCP connection is closed.
    #[arg(long, default_value_t = 15_000)]
    tcp_idle_timeout_ms: u64,

    /// How often the `current` stats window rotates, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    stats_interval_ms: u64,

    /// Optional source addresses to bind outgoing sockets to, round-robin.
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Print a stats snapshot to stdout on every rotation instead of just
    /// at the end of the run.
    #[arg(long)]
    watch: bool,
}

#[derive(Clone, clap::ValueEnum)]
enum TransportArg {
    Udp,
    Tcp,
}

impl From<TransportArg> for Transport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Udp => Transport::Udp,
            TransportArg::Tcp => Transport::Tcp,
        }
    }
}

#[tokio::main]
async fn main() {
    simple_logger::init().expect("failed to initialize logger");

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        log::error!("{}", err);
        eprintln!("{} {}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut engine = Engine::new(cli.max_clients)?;
    engine.set_transport(cli.transport.into())?;
    engine.set_target(&cli.target, cli.port)?;
    engine.set_timeout_ms(cli.timeout_ms);
    engine.set_tcp_idle_timeout_ms(cli.tcp_idle_timeout_ms);
    engine.set_stats_interval_ms(cli.stats_interval_ms);
    for source in &cli.sources {
        engine.add_source(source)?;
    }

    log::info!(
        "replaying {} against {}:{} over {:?}",
        cli.log_file.display(),
        cli.target,
        cli.port,
        cli.transport_name()
    );

    let file = File::open(&cli.log_file)?;
    let reader = QueryLogReader::new(BufReader::new(file));
    let mut dispatched = 0usize;
    for line in reader {
        match line {
            Ok(chain) => {
                engine.receive(&chain);
                dispatched += 1;
            }
            Err(e) => log::warn!("skipping malformed log line: {}", e),
        }
        engine.run_nowait();
    }
    log::info!("dispatched {} queries from the log, draining in-flight requests", dispatched);

    loop {
        let pending = engine.run_nowait();
        if cli.watch {
            print_stats(&engine);
        }
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    print_stats(&engine);
    engine.free();
    Ok(())
}

impl Cli {
    fn transport_name(&self) -> &'static str {
        match self.transport {
            TransportArg::Udp => "udp",
            TransportArg::Tcp => "tcp",
        }
    }
}

fn print_stats(engine: &Engine) {
    let stats = engine.stats();
    let mut table = Table::new();
    table.set_header(vec!["window", "requests", "ongoing", "answers", "timeouts", "dropped"]);
    table.add_row(vec![
        "current".to_string(),
        stats.current.requests.to_string(),
        stats.current.ongoing.to_string(),
        stats.current.answers.to_string(),
        stats.current.timeouts.to_string(),
        stats.current.dropped.to_string(),
    ]);
    table.add_row(vec![
        "sum".to_string(),
        stats.sum.requests.to_string(),
        stats.sum.ongoing.to_string(),
        stats.sum.answers.to_string(),
        stats.sum.timeouts.to_string(),
        stats.sum.dropped.to_string(),
    ]);
    println!("{}", table);
}
