use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser};
use rtc_bench::bench::{BenchError, Benchmark};
use rtc_bench::config::{
    BenchConfig, DEFAULT_DURATION_SECS, DEFAULT_SIGNALING_PORT, DEFAULT_SIGNALING_SERVER,
    DEFAULT_STUN_PORT, DEFAULT_STUN_SERVER, StunServer,
};
use rtc_bench::identity::{DEFAULT_ID_LENGTH, PeerId, random_id};
use rtc_bench::orchestrator::Initiated;
use rtc_bench::signaling::SignalingError;
use rtc_bench::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use rtc_bench::transmission::DEFAULT_MESSAGE_SIZE;
use rtc_bench::transport::TransportError;
use rtc_bench::transport::webrtc::WebRtcSessionFactory;
use thiserror::Error;
use tracing::debug;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    };
    // An interrupted prompt leaves its stdin read blocked; dropping the
    // runtime would wait on it until a line arrives.
    std::process::exit(code);
}

#[derive(Parser, Debug)]
#[command(
    name = "rtc-bench",
    about = "Measure data channel throughput between two peers",
    author,
    version
)]
struct Cli {
    #[arg(
        short = 'n',
        long = "no-stun",
        env = "RTC_BENCH_NO_STUN",
        help = "Do not use a STUN server"
    )]
    no_stun: bool,

    #[arg(
        short = 's',
        long,
        env = "RTC_BENCH_STUN_SERVER",
        default_value = DEFAULT_STUN_SERVER,
        help = "STUN server host"
    )]
    stun_server: String,

    #[arg(
        short = 't',
        long,
        env = "RTC_BENCH_STUN_PORT",
        default_value_t = DEFAULT_STUN_PORT,
        help = "STUN server port"
    )]
    stun_port: u16,

    #[arg(
        short = 'w',
        long,
        env = "RTC_BENCH_SIGNALING_SERVER",
        default_value = DEFAULT_SIGNALING_SERVER,
        help = "Signaling relay host, optionally with a ws:// or wss:// scheme"
    )]
    signaling_server: String,

    #[arg(
        short = 'x',
        long,
        env = "RTC_BENCH_SIGNALING_PORT",
        default_value_t = DEFAULT_SIGNALING_PORT,
        help = "Signaling relay port"
    )]
    signaling_port: u16,

    #[arg(
        short = 'd',
        long,
        env = "RTC_BENCH_DURATION",
        value_name = "SECONDS",
        default_value_t = DEFAULT_DURATION_SECS,
        help = "Benchmark duration in seconds (0 runs until interrupted)"
    )]
    duration: u64,

    #[arg(
        long,
        env = "RTC_BENCH_MESSAGE_SIZE",
        value_name = "BYTES",
        default_value_t = DEFAULT_MESSAGE_SIZE as u32,
        value_parser = clap::value_parser!(u32).range(1..=65_535),
        help = "Size of each benchmark message"
    )]
    message_size: u32,

    #[command(flatten)]
    logging: LoggingArgs,
}

impl Cli {
    fn bench_config(&self) -> BenchConfig {
        BenchConfig {
            signaling_server: self.signaling_server.clone(),
            signaling_port: self.signaling_port,
            stun: (!self.no_stun).then(|| StunServer {
                host: self.stun_server.clone(),
                port: self.stun_port,
            }),
            duration_secs: self.duration,
            message_size: self.message_size as usize,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "RTC_BENCH_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "RTC_BENCH_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Bench(#[from] BenchError),
    #[error("{0}")]
    Signaling(#[from] SignalingError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
}

async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = log_config.level.as_str(), log_file = ?log_config.file, "logging configured");

    let config = cli.bench_config();
    match &config.stun {
        Some(stun) => println!("STUN server is {}", stun.url()),
        None => println!(
            "No STUN server is configured. Only local hosts and public IP addresses supported."
        ),
    }

    let local_id = random_id(DEFAULT_ID_LENGTH);
    println!("The local ID is: {local_id}");

    let url = config.relay_url(&local_id)?;
    println!("URL is {url}");
    let factory = Arc::new(WebRtcSessionFactory::new(config.ice_servers())?);

    println!("Waiting for signaling to be connected...");
    let bench = Benchmark::connect(local_id, &url, factory, config.message_size).await?;
    println!("WebSocket connected, signaling ready");

    let outcome = drive(&bench, &config).await;
    println!("Cleaning up...");
    bench.shutdown().await;
    outcome
}

async fn drive(bench: &Benchmark, config: &BenchConfig) -> Result<(), CliError> {
    println!("Enter a remote ID to send an offer:");
    let line = tokio::select! {
        line = read_line() => line?,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };
    let remote = line.trim();

    if remote.is_empty() {
        println!("No remote ID entered, waiting for incoming offers");
    } else if remote == bench.local_id().as_str() {
        println!("Invalid remote ID (This is my local ID). Exiting...");
        return Ok(());
    } else {
        println!("Offering to {remote}");
        if bench.initiate(PeerId::from(remote)).await? == Initiated::Existing {
            println!("Already connected to {remote}");
        }
    }

    let ticks = config.ticks();
    match ticks {
        Some(seconds) => println!("Benchmark will run for {seconds} seconds"),
        None => println!("Benchmark will run until interrupted"),
    }

    let mut stats = bench.stats();
    tokio::select! {
        _ = stats.run(ticks) => {}
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }
    let orchestrator = bench.orchestrator();
    if orchestrator.sessions().is_empty() {
        println!("No peer connected");
    } else if orchestrator.transmission().channels().is_empty() {
        println!("No data channel was opened");
    }
    let totals = stats.totals();
    debug!(sent = totals.sent, received = totals.received, ticks = stats.ticks(), "benchmark finished");
    Ok(())
}

async fn read_line() -> io::Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(io::Error::other)?
}
