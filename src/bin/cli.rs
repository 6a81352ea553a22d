// src/bin/cli.rs
//
//! Bulk object-storage CLI.
//!
//! Examples:
//! ```bash
//! s3bulk cp s3://bucket/logs/*.gz /tmp/logs/
//! s3bulk mv s3://bucket/a s3://bucket/b
//! s3bulk -f commands.txt
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use s3bulk::constants::{
    DEFAULT_DOWNLOAD_CONCURRENCY, DEFAULT_PART_SIZE_MB, DEFAULT_RETRY_COUNT, DEFAULT_WORKER_COUNT,
};
use s3bulk::{Config, DefaultFactory, S3Opts, StatKind, WorkerManager};

#[derive(Parser)]
#[command(
    name = "s3bulk",
    version,
    about = "High-throughput bulk operations between S3-compatible stores and the local filesystem"
)]
struct Cli {
    /// Number of worker tasks.
    #[arg(long = "numworkers", default_value_t = DEFAULT_WORKER_COUNT)]
    numworkers: usize,

    /// Retry count for remote calls.
    #[arg(short = 'r', long = "retries", default_value_t = DEFAULT_RETRY_COUNT)]
    retries: u32,

    /// Upload part size in MiB.
    #[arg(short = 'p', long = "part-size", default_value_t = DEFAULT_PART_SIZE_MB)]
    part_size: usize,

    /// Concurrent ranged GETs per large download.
    #[arg(long = "cc", default_value_t = DEFAULT_DOWNLOAD_CONCURRENCY)]
    concurrency: usize,

    /// S3-compatible endpoint override (forces path-style addressing).
    #[arg(long = "endpoint-url")]
    endpoint_url: Option<String>,

    /// Region override.
    #[arg(long = "region")]
    region: Option<String>,

    /// Accept invalid TLS certificates.
    #[arg(long = "no-verify-ssl")]
    no_verify_ssl: bool,

    /// Print the statistics block even in single-command mode.
    #[arg(long = "stats")]
    print_stats: bool,

    /// Verbose diagnostics (-v info, -vv debug).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Read commands from a file, one per line.
    #[arg(short = 'f', long = "file")]
    command_file: Option<PathBuf>,

    /// The command to run, e.g. `cp s3://bucket/key /tmp/`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn print_ops(name: &str, counter: u64, elapsed: Duration, extra: &str) {
    if counter == 0 {
        return;
    }
    let mut secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        secs = 1.0;
    }
    let ops = (counter as f64 / secs).round() as u64;
    println!("# Stats: {name:<7} {counter:>10} {ops:>4} ops/sec{extra}");
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("-ERR {e:#}");
            2
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    // Loads any variables from .env that are not already set.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let cmd = cli.command.join(" ");
    if cmd.is_empty() && cli.command_file.is_none() {
        eprintln!("-ERR specify a command or -f FILE");
        return Ok(2);
    }
    if !cmd.is_empty() && cli.command_file.is_some() {
        eprintln!("-ERR only specify -f or a command, not both");
        return Ok(2);
    }

    let mut config = Config::default();
    config.worker_count = cli.numworkers;
    config.retry_count = cli.retries;
    config.part_size = cli.part_size * 1024 * 1024;
    config.download_concurrency = cli.concurrency;
    config.endpoint_url = cli.endpoint_url.clone();
    config.region = cli.region.clone();
    config.no_verify_ssl = cli.no_verify_ssl;
    config.verbose = cli.verbose > 0;
    if let Err(e) = config.validate() {
        eprintln!("-ERR {e}");
        return Ok(2);
    }

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            eprintln!("# Got signal, cleaning up...");
            token.cancel();
        });
    }

    let factory = Arc::new(DefaultFactory::new(S3Opts::from(&config)));
    let manager = WorkerManager::new(config, factory, token);

    let cmd_mode = cli.command_file.is_none();
    let started = Instant::now();
    let summary = match &cli.command_file {
        Some(file) => manager.run(file).await?,
        None => manager.run_cmd(&cmd).await?,
    };
    let elapsed = started.elapsed();

    let code = summary.exit_code();
    if !cmd_mode {
        println!("# Exiting with code {code}");
    }

    if !cmd_mode || cli.print_stats {
        let stats = summary.stats();
        let s3_ops = stats.get(StatKind::S3Op);
        let file_ops = stats.get(StatKind::FileOp);
        let shell_ops = stats.get(StatKind::ShellOp);
        let fails = stats.get(StatKind::Fail);
        print_ops("S3", s3_ops, elapsed, "");
        print_ops("File", file_ops, elapsed, "");
        print_ops("Shell", shell_ops, elapsed, "");
        print_ops("Failed", fails, elapsed, "");
        print_ops(
            "Total",
            s3_ops + file_ops + shell_ops + fails,
            elapsed,
            &format!(" {elapsed:?}"),
        );
    }

    Ok(code)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
