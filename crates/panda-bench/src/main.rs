//! panda-bench entry point.
//!
//! Runs the UDP loopback regression against a panda over WiFi, or against the
//! in-process simulator, and prints a throughput summary.

use anyhow::{Context, Result};
use clap::Parser;
use panda_bench::{run_udp_doesnt_drop, UdpDropReport};
use panda_common::config::{BenchConfig, DeviceDriver};
use panda_transport::{CanDevice, CanStream, Panda, PandaWifiStreaming, SimulatedPanda};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Bench command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "panda-bench",
    about = "Check that a panda streams every looped-back CAN frame over WiFi UDP",
    version,
    long_about = None
)]
struct Args {
    /// Path to a bench configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device address (overrides config file).
    #[arg(long, value_name = "IP")]
    ip: Option<String>,

    /// Run against the simulated device.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Print the report as JSON. Progress goes to stderr.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting panda bench");

    let mut config = load_config(&args)?;
    if let Some(ip) = &args.ip {
        config.device.ip.clone_from(ip);
    }
    if args.simulated {
        config.device.driver = DeviceDriver::Simulated;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        driver = ?config.device.driver,
        ip = %config.device.ip,
        speed_kbps = config.bus.speed_kbps,
        "Configuration loaded"
    );

    let (mut device, mut stream) = open_device(&config)?;

    let mut progress: Box<dyn Write> = if args.json {
        Box::new(std::io::stderr())
    } else {
        Box::new(std::io::stdout())
    };
    let report = run_udp_doesnt_drop(device.as_mut(), stream.as_mut(), &config, &mut progress)
        .context("UDP loopback run failed")?;
    drop(progress);

    print_report(&report, args.json)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("panda_bench={level},panda_transport={level},panda_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `PANDA_BENCH_CONFIG` environment variable
/// 3. `/etc/panda/bench.toml` (system path)
/// 4. `config/bench.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<BenchConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return BenchConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("PANDA_BENCH_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from PANDA_BENCH_CONFIG");
            return BenchConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from PANDA_BENCH_CONFIG={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "PANDA_BENCH_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/panda/bench.toml", "config/bench.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return BenchConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(BenchConfig::default())
}

/// Open the control handle and streaming channel for the configured driver.
fn open_device(config: &BenchConfig) -> Result<(Box<dyn CanDevice>, Box<dyn CanStream>)> {
    match config.device.driver {
        DeviceDriver::Simulated => {
            info!("Using simulated panda");
            let panda = SimulatedPanda::new();
            let stream: Box<dyn CanStream> = Box::new(panda.stream());
            let device: Box<dyn CanDevice> = Box::new(panda);
            Ok((device, stream))
        }
        DeviceDriver::Wifi => {
            let panda = Panda::connect(&config.device).with_context(|| {
                format!(
                    "Failed to connect to panda at {}:{}",
                    config.device.ip, config.device.control_port
                )
            })?;
            let stream = PandaWifiStreaming::connect(&config.device)
                .context("Failed to open streaming channel")?;
            info!(device = %stream.device_addr(), "Connected to panda");
            let device: Box<dyn CanDevice> = Box::new(panda);
            let stream: Box<dyn CanStream> = Box::new(stream);
            Ok((device, stream))
        }
    }
}

fn print_report(report: &UdpDropReport, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, report).context("Failed to encode report")?;
        writeln!(stdout)?;
        return Ok(());
    }

    for burst in &report.bursts {
        let s = &burst.summary;
        let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
        writeln!(
            stdout,
            "{:>4} msgs x {:>3}: min {} / mean {} / max {} kbps, mean saturation {}%",
            burst.msg_count,
            s.samples,
            fmt(s.min_kbps),
            fmt(s.mean_kbps),
            fmt(s.max_kbps),
            fmt(s.mean_saturation_pct),
        )?;
    }
    Ok(())
}
