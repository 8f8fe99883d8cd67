extern crate clap;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use log::info;

use netgauge::config::EngineConfig;
use netgauge::errors::{
    exit_codes, format_error_for_display, ErrorKind, NetgaugeError,
};
use netgauge::results::SpeedTestResult;
use netgauge::server::TransportServer;
use netgauge::session::{
    InMemorySessionStore, ProgressCallback, ProgressEvent, SessionOrchestrator,
    SessionStatus, TestConfiguration, TestType, UserContext,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (rev ",
    env!("NETGAUGE_BUILD_GIT_HASH"),
    ")"
);

#[derive(Parser)]
#[command(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    verbose: Verbosity,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one measurement session and print the result
    Run(RunArgs),
    /// Serve the download source and upload sink the probes talk to
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Transport server the throughput probes use
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Host for the latency probe; defaults to the server host
    #[arg(long)]
    latency_host: Option<String>,

    /// Port for the latency probe; defaults to the server port
    #[arg(long)]
    latency_port: Option<u16>,

    #[arg(long = "type", value_enum, default_value = "full")]
    test_type: CliTestType,

    /// Seconds per throughput run (5-60)
    #[arg(long, default_value_t = 10)]
    duration: u32,

    /// Runs per throughput phase (1-10)
    #[arg(long, default_value_t = 3)]
    runs: u32,

    /// Size of the file requested from the download source, in MB
    #[arg(long)]
    file_size_mb: Option<f64>,

    /// User id for the one-session-per-user limit; anonymous if omitted
    #[arg(long)]
    user: Option<String>,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,

    /// Start an in-process transport server and measure against it
    #[arg(long, conflicts_with = "server")]
    local: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTestType {
    Full,
    Download,
    Upload,
    Latency,
}

impl From<CliTestType> for TestType {
    fn from(value: CliTestType) -> Self {
        match value {
            CliTestType::Full => TestType::Full,
            CliTestType::Download => TestType::DownloadOnly,
            CliTestType::Upload => TestType::UploadOnly,
            CliTestType::Latency => TestType::LatencyOnly,
        }
    }
}

/// Prints phase transitions to stderr as the session runs.
struct ConsoleProgress;

impl ProgressCallback for ConsoleProgress {
    fn on_progress(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::PhaseChange { phase, progress, .. } => {
                eprintln!(
                    "{} {:?}",
                    format!("[{:>3}%]", progress).bright_black(),
                    phase
                );
            }
            ProgressEvent::PhaseDegraded { message, .. } => {
                eprintln!("{} {}", "[warn]".yellow(), message);
            }
            ProgressEvent::Finished { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .parse_default_env()
        .init();

    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Serve { listen } => serve(&listen).await,
    };

    match outcome {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{}", format_error_for_display(&e).red());
            process::exit(e.exit_code());
        }
    }
}

async fn run(args: RunArgs) -> Result<i32, NetgaugeError> {
    let mut engine = if args.local {
        let server = TransportServer::bind("127.0.0.1:0").await?;
        let addr = server.local_addr()?;
        tokio::spawn(server.serve());
        EngineConfig::for_server(&format!("http://{}", addr))?
    } else {
        EngineConfig::for_server(&args.server)?
    };

    if let Some(host) = args.latency_host {
        engine.latency_host = host;
    }
    if let Some(port) = args.latency_port {
        engine.latency_port = port;
    }

    let config = TestConfiguration {
        test_file_size_mb: args.file_size_mb,
        ..TestConfiguration::new(args.test_type.into(), args.duration, args.runs)
    };
    config.validate()?;

    let user = args
        .user
        .map(UserContext::identified)
        .unwrap_or_else(UserContext::anonymous);

    let progress: Arc<dyn ProgressCallback> = Arc::new(ConsoleProgress);
    let orchestrator = SessionOrchestrator::with_progress(
        engine,
        Arc::new(InMemorySessionStore::new()),
        progress,
    )?;

    let id = orchestrator.start_session(config, &user).await?;
    info!("Session {}", id);

    let session = tokio::select! {
        session = orchestrator.wait_for_completion(&id, Duration::from_millis(200)) => session?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_session(&id).await?;
            return Err(NetgaugeError::cancelled("session interrupted"));
        }
    };

    match session.status {
        SessionStatus::Completed => {}
        SessionStatus::Cancelled => {
            return Err(NetgaugeError::cancelled("session was cancelled"));
        }
        _ => {
            return Err(NetgaugeError::session(
                session
                    .error_message
                    .unwrap_or_else(|| "session failed".to_string()),
            ));
        }
    }

    let result = orchestrator.get_result(&id).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            NetgaugeError::new(ErrorKind::Unknown, "failed to serialize result")
                .with_source(e)
        })?;
        println!("{}", json);
    } else {
        print_result(&result);
    }

    result.validation.ensure_valid()?;
    Ok(exit_codes::SUCCESS)
}

fn print_result(result: &SpeedTestResult) {
    println!("{} {}", "Session:".bold().white(), result.session_id);

    if let Some(latency) = &result.latency_metrics {
        if latency.is_failed() {
            println!("{} {}", "Latency:".bold().white(), "failed".red());
        } else {
            println!("{} {:.2} ms", "Latency:".bold().white(), latency.ping_ms);
            println!("{} {:.2} ms", "Jitter:".bold().white(), latency.jitter_ms);
            println!(
                "{} {:.1}%",
                "Packet loss:".bold().white(),
                latency.packet_loss_percent
            );
        }
    }

    for (label, metrics) in [
        ("Download speed:", &result.download_metrics),
        ("Upload speed:", &result.upload_metrics),
    ] {
        let Some(metrics) = metrics else { continue };

        let speed = format!("{:.2} Mbps", metrics.speed_mbps).bright_cyan();
        let note = if metrics.is_simulated() {
            " (simulated)".yellow().to_string()
        } else {
            String::new()
        };

        println!(
            "{} {}{} {}",
            label.bold().white(),
            speed,
            note,
            format!(
                "peak {:.2}, stability {:.0}",
                metrics.peak_speed_mbps, metrics.stability_score
            )
            .bright_black()
        );
    }

    if result.validation.valid {
        println!("{} {}", "Validation:".bold().white(), "ok".green());
    } else {
        println!("{} {}", "Validation:".bold().white(), "rejected".red());
        for warning in &result.validation.warnings {
            println!("  {}", warning.yellow());
        }
    }
}

async fn serve(listen: &str) -> Result<i32, NetgaugeError> {
    let server = TransportServer::bind(listen).await?;
    println!(
        "{} {}",
        "Listening on".bold().white(),
        server.local_addr()?.to_string().bright_blue()
    );

    tokio::select! {
        served = server.serve() => served?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(exit_codes::SUCCESS)
}
