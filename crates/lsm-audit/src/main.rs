//! lsm-audit - security hook auditing
//!
//! Records outbound IPv4 connects the kernel allowed and every file open,
//! either from BPF LSM programs or from an in-process simulation.

use clap::{Parser, Subcommand, ValueEnum};
use lsm_audit_capture::{HostStatus, SimulationReport, Simulator, SimulatorConfig};
#[cfg(target_os = "linux")]
use lsm_audit_capture::{LsmCapture, LsmCaptureConfig};
use lsm_audit_core::capture::CaptureSource;
use lsm_audit_core::config::{AuditConfig, ConfigLoader};
use lsm_audit_core::events::AuditEvent;
use lsm_audit_core::metrics::{ChannelSnapshot, SharedMetrics};
use lsm_audit_core::schema::EventKind;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Buffered events between the consumer and the printer
const EVENT_BUFFER: usize = 4096;

#[derive(Parser)]
#[command(name = "lsm-audit")]
#[command(version)]
#[command(about = "Audit outbound connects and file opens through BPF LSM hooks", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "LSM_AUDIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the LSM programs and stream events until Ctrl+C (Linux, root)
    Record {
        /// Path to the compiled LSM object
        #[arg(long)]
        ebpf_path: Option<PathBuf>,

        /// Only record this process (tgid)
        #[arg(long)]
        pid: Option<u32>,

        /// Trace every record decision (bpf_printk)
        #[arg(long)]
        debug: bool,
    },

    /// Drive the userspace pipeline with concurrent synthetic producers
    Simulate {
        /// Producer threads
        #[arg(long, default_value = "4")]
        producers: usize,

        /// Connect/open pairs per producer (0 = until Ctrl+C)
        #[arg(long, default_value = "1000")]
        events: u64,

        /// Share of allowed connects that target IPv6
        #[arg(long, default_value = "0.1")]
        ipv6_ratio: f64,

        /// Share of connects that fail
        #[arg(long, default_value = "0.05")]
        fail_ratio: f64,

        /// Only print the summary
        #[arg(short, long)]
        quiet: bool,

        /// Also print channel metrics (Prometheus text, or JSON with --format json)
        #[arg(long)]
        metrics: bool,
    },

    /// Show whether this host can run the LSM programs
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());

    // CLI verbose flag takes precedence, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.audit.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    // stdout carries events, logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Record {
            ebpf_path,
            pid,
            debug,
        } => {
            let config = merge_record_config(config, ebpf_path, pid, debug);
            record_command(config, cli.format).await
        }
        Commands::Simulate {
            producers,
            events,
            ipv6_ratio,
            fail_ratio,
            quiet,
            metrics,
        } => {
            let sim_config = SimulatorConfig {
                producers,
                events_per_producer: events,
                ipv6_ratio,
                fail_ratio,
                pipeline: config.pipeline_config(),
                channel_sizes: config.channel_sizes(),
                poll_interval: config.poll_interval(),
                ..Default::default()
            };
            simulate_command(sim_config, cli.format, quiet, metrics).await
        }
        Commands::Status => status_command(cli.format),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(cli_path: Option<PathBuf>) -> AuditConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // The subscriber is not installed yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            AuditConfig::default()
        }
    }
}

/// CLI arguments take precedence when explicitly provided
fn merge_record_config(
    mut config: AuditConfig,
    ebpf_path: Option<PathBuf>,
    pid: Option<u32>,
    debug: bool,
) -> AuditConfig {
    if let Some(path) = ebpf_path {
        config.capture.ebpf_path = Some(path.to_string_lossy().into_owned());
    }
    if let Some(pid) = pid {
        config.audit.target_pid = pid;
    }
    if debug {
        config.audit.debug_tracing = true;
    }
    config
}

fn print_event(event: &AuditEvent, format: OutputFormat) {
    match format {
        OutputFormat::Text => println!("{}", event),
        OutputFormat::Json => match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        },
    }
}

/// Print (or just count) events until every sender is gone
fn spawn_printer(
    mut rx: mpsc::Receiver<AuditEvent>,
    format: OutputFormat,
    quiet: bool,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(event) = rx.recv().await {
            if !quiet {
                print_event(&event, format);
            }
            printed += 1;
        }
        printed
    })
}

fn log_channel_totals(metrics: &SharedMetrics) {
    for kind in EventKind::ALL {
        let c = metrics.snapshot(kind);
        info!(
            channel = kind.channel_name(),
            committed = c.committed,
            dropped = c.dropped,
            consumed = c.consumed,
            "Channel totals"
        );
    }
    info!(
        forwarded = metrics.events_forwarded(),
        decode_errors = metrics.decode_errors(),
        uptime_seconds = metrics.uptime_seconds(),
        "Consumer totals"
    );
}

#[cfg(target_os = "linux")]
async fn record_command(config: AuditConfig, format: OutputFormat) -> anyhow::Result<()> {
    info!("Starting lsm-audit...");

    let mut capture = LsmCapture::with_config(LsmCaptureConfig::from_config(&config));
    if !capture.is_available() {
        warn!("Host checks failed, attempting to attach anyway");
    }

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let printer = spawn_printer(rx, format, false);
    capture.start(tx).await?;

    eprintln!();
    eprintln!("  lsm-audit v{}", lsm_audit_core::VERSION);
    eprintln!();
    eprintln!("  Recording connects and file opens");
    eprintln!("  Press Ctrl+C to stop");
    eprintln!();

    tokio::signal::ctrl_c().await?;

    capture.stop().await?;
    let printed = printer.await?;
    log_channel_totals(&capture.metrics());
    info!(events = printed, "lsm-audit stopped");

    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn record_command(_config: AuditConfig, _format: OutputFormat) -> anyhow::Result<()> {
    anyhow::bail!("BPF LSM capture is only available on Linux; try `lsm-audit simulate`")
}

async fn simulate_command(
    config: SimulatorConfig,
    format: OutputFormat,
    quiet: bool,
    show_metrics: bool,
) -> anyhow::Result<()> {
    info!(
        producers = config.producers,
        events = config.events_per_producer,
        "Starting simulation"
    );

    let mut simulator = Simulator::with_config(config);
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let printer = spawn_printer(rx, format, quiet);

    let running = simulator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            running.store(false, Ordering::SeqCst);
        }
    });

    simulator.start(tx).await?;
    let report = simulator.finish().await?;
    printer.await?;

    log_channel_totals(&simulator.metrics());
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_report(&report),
    }
    if show_metrics {
        let metrics = simulator.metrics();
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metrics.to_json())?),
            OutputFormat::Text => print!("{}", metrics.to_prometheus()),
        }
    }

    let violations = report.violations();
    if !violations.is_empty() {
        anyhow::bail!("channel accounting mismatch: {}", violations.join("; "));
    }
    Ok(())
}

fn print_channel(name: &str, c: &ChannelSnapshot) {
    println!(
        "  {:<18} reserved {:>8}  committed {:>8}  discarded {:>6}  dropped {:>8}",
        name, c.reserved, c.committed, c.discarded, c.dropped
    );
}

fn print_report(report: &SimulationReport) {
    let p = &report.producers;
    println!();
    println!("  Simulation finished");
    println!();
    println!(
        "  Connects: {} attempted, {} failed, {} to IPv6, {} filtered",
        p.connect_attempts, p.failed_connects, p.ipv6_connects, p.filtered_connects
    );
    println!(
        "  File opens: {} attempted, {} filtered",
        p.file_opens, p.filtered_opens
    );
    println!();
    print_channel(EventKind::Connect.channel_name(), &report.connect);
    print_channel(EventKind::FileOpen.channel_name(), &report.file_open);
    println!();
    println!(
        "  Forwarded: {}  Decode errors: {}",
        report.forwarded, report.decode_errors
    );
    println!();
}

fn status_command(format: OutputFormat) -> anyhow::Result<()> {
    let status = HostStatus::probe();

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!("lsm-audit v{}", lsm_audit_core::VERSION);
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!();
    match status.kernel {
        Some((major, minor, patch)) => println!("  Kernel: {}.{}.{}", major, minor, patch),
        None => println!("  Kernel: unknown"),
    }
    println!("  Running as root: {}", status.root);
    println!("  BPF filesystem: {}", status.bpf_fs);
    println!("  BTF available: {}", status.btf);
    match status.bpf_lsm {
        Some(enabled) => println!("  BPF LSM enabled: {}", enabled),
        None => println!("  BPF LSM enabled: unknown"),
    }
    println!();

    let problems = status.problems();
    if problems.is_empty() {
        println!("Ready to record.");
    } else {
        println!("Not ready:");
        for problem in problems {
            println!("  - {}", problem);
        }
    }
    println!();

    Ok(())
}
