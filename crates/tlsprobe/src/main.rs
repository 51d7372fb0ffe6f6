//! tlsprobe - TLS plaintext capture
//!
//! Attaches uprobes to the read/write entry points of OpenSSL, GnuTLS and
//! NSPR and prints the plaintext that crosses them.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tlsprobe_capture::library::{self, BUILTIN};
use tlsprobe_capture::{
    builtin_registry, LibraryLocator, SimulatedBackend, TrafficConfig, TrafficGenerator,
};
use tlsprobe_capture_ebpf::UprobeBackend;
use tlsprobe_core::config::ConfigLoader;
use tlsprobe_core::{EventSink, ModuleReport, Orchestrator, SessionConfig, SessionPolicy};
use tlsprobe_export::{ConsoleSink, FanoutSink, JsonlSink, JsonlSinkConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tlsprobe")]
#[command(version)]
#[command(about = "Capture TLS plaintext with eBPF uprobes", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TLSPROBE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture TLS plaintext from OpenSSL, GnuTLS and NSPR (requires root or CAP_BPF)
    #[command(visible_aliases = ["openssl", "gnutls", "nss"])]
    Tls(TlsArgs),

    /// Show capture capabilities and discovered libraries
    Status,

    /// Run the capture pipeline on simulated traffic (no eBPF required)
    Demo {
        /// Milliseconds between simulated exchanges
        #[arg(long, default_value = "1000")]
        interval: u64,

        /// Exchanges to generate (0 = until interrupted)
        #[arg(long, default_value = "0")]
        count: u64,

        /// Print payloads as hex
        #[arg(long)]
        hex: bool,

        /// Output file for JSONL events
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct TlsArgs {
    /// curl binary, used to find the OpenSSL it links against
    #[arg(long)]
    curl: Option<PathBuf>,

    /// libssl.so path, skips discovery
    #[arg(long)]
    libssl: Option<PathBuf>,

    /// wget binary, used to find the GnuTLS it links against
    #[arg(long)]
    wget: Option<PathBuf>,

    /// libgnutls.so path, skips discovery
    #[arg(long)]
    gnutls: Option<PathBuf>,

    /// firefox binary, used to find the NSPR it links against
    #[arg(long)]
    firefox: Option<PathBuf>,

    /// libnspr4.so path, skips discovery
    #[arg(long)]
    nspr: Option<PathBuf>,

    /// Only capture this process
    #[arg(short, long)]
    pid: Option<u32>,

    /// Debug output
    #[arg(short, long)]
    debug: bool,

    /// Print payloads as hex
    #[arg(long)]
    hex: bool,

    /// Output file for JSONL events
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Compiled kernel-side probe object (defaults to the embedded one)
    #[arg(long)]
    ebpf_object: Option<PathBuf>,

    /// Failure policy (fail-fast, best-effort)
    #[arg(long)]
    policy: Option<SessionPolicy>,

    /// Module to run; repeat for several (defaults to the configured list)
    #[arg(short, long = "module")]
    modules: Vec<String>,
}

impl TlsArgs {
    /// Modules implied by library flags, in built-in order
    fn implied_modules(&self) -> Vec<String> {
        let mut modules = Vec::new();
        if self.curl.is_some() || self.libssl.is_some() {
            modules.push(library::OPENSSL.name.to_string());
        }
        if self.wget.is_some() || self.gnutls.is_some() {
            modules.push(library::GNUTLS.name.to_string());
        }
        if self.firefox.is_some() || self.nspr.is_some() {
            modules.push(library::NSPR.name.to_string());
        }
        modules
    }

    /// Fold the flags into `config`; flags win over file and environment
    fn apply(&self, config: &mut SessionConfig) {
        let libraries = [
            (library::OPENSSL.name, &self.libssl, &self.curl),
            (library::GNUTLS.name, &self.gnutls, &self.wget),
            (library::NSPR.name, &self.nspr, &self.firefox),
        ];
        for (name, library, hint) in libraries {
            if let Some(path) = library {
                config.library_mut(name).library = Some(path.clone());
            }
            if let Some(path) = hint {
                config.library_mut(name).hint_binary = Some(path.clone());
            }
        }

        let session = &mut config.session;
        if let Some(pid) = self.pid {
            session.pid = pid;
        }
        if self.debug {
            session.debug = true;
        }
        if self.hex {
            session.hex_output = true;
        }
        if let Some(policy) = self.policy {
            session.policy = policy;
        }
        if let Some(path) = &self.ebpf_object {
            session.ebpf_object = Some(path.clone());
        }
        if let Some(path) = &self.output {
            config.output.jsonl = Some(path.clone());
        }

        let modules = if self.modules.is_empty() {
            self.implied_modules()
        } else {
            self.modules.clone()
        };
        if !modules.is_empty() {
            config.session.modules = modules;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::new().with_cli_path(cli.config.clone());
    let mut config = loader.load().context("failed to load configuration")?;
    if let Commands::Tls(args) = &cli.command {
        args.apply(&mut config);
        loader.validate(&config).context("invalid configuration")?;
    }

    // CLI verbose flag takes precedence, then --debug, then config
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else if config.session.debug {
        Level::DEBUG
    } else {
        match config.session.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Tls(_) => tls_command(config).await,
        Commands::Status => status_command(&config),
        Commands::Demo {
            interval,
            count,
            hex,
            output,
        } => {
            demo_command(
                config,
                DemoConfig {
                    interval,
                    count,
                    hex,
                    output,
                },
            )
            .await
        }
    }
}

/// Console output plus the optional JSONL file
fn build_sink(config: &SessionConfig) -> anyhow::Result<Arc<dyn EventSink>> {
    let mut sink = FanoutSink::new();
    if config.output.console {
        sink = sink.with(Arc::new(ConsoleSink::stdout(config.session.hex_output)));
    }
    if let Some(path) = &config.output.jsonl {
        let jsonl = JsonlSink::open(JsonlSinkConfig::new(path))
            .with_context(|| format!("failed to open {}", path.display()))?;
        sink = sink.with(Arc::new(jsonl));
    }
    if sink.is_empty() {
        warn!("No output configured, events will be counted but not shown");
    }
    Ok(Arc::new(sink))
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down...");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn tls_command(config: SessionConfig) -> anyhow::Result<()> {
    preflight(&config)?;

    let backend = Arc::new(UprobeBackend::new(config.session.ebpf_object.clone()));
    let registry = builtin_registry(backend);
    let sink = build_sink(&config)?;

    let mut orchestrator = Orchestrator::new(registry, sink).with_policy(config.session.policy);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if config.session.pid > 0 {
        info!("Filtering on pid {}", config.session.pid);
    }
    info!(
        "Starting capture: modules {:?}, policy {:?}",
        config.session.modules, config.session.policy
    );
    eprintln!("Press Ctrl+C to stop");

    let result = orchestrator
        .start(cancel, &config.session.modules, &config)
        .await;
    print_reports(orchestrator.reports());

    result.map_err(|e| {
        error!("Capture session failed: {}", e);
        anyhow::Error::new(e)
    })
}

/// Refuse to start a uprobe session the host cannot support
#[cfg(target_os = "linux")]
fn preflight(config: &SessionConfig) -> anyhow::Result<()> {
    let report = tlsprobe_capture_ebpf::CapabilityReport::collect(config.session.ebpf_object.as_deref());
    if report.ready() {
        return Ok(());
    }

    let mut missing = Vec::new();
    if !report.kernel_supported {
        missing.push(format!(
            "kernel 5.15+ (found {})",
            report.kernel.as_deref().unwrap_or("unknown")
        ));
    }
    if !report.bpf_fs {
        missing.push("BPF filesystem at /sys/fs/bpf".to_string());
    }
    if !report.uprobes {
        missing.push("uprobe event support".to_string());
    }
    if !report.cap_bpf {
        missing.push("root or CAP_BPF".to_string());
    }
    if !report.embedded_object && report.object_override.is_none() {
        missing.push("a kernel object (--ebpf-object)".to_string());
    }
    anyhow::bail!(
        "uprobe capture unavailable, missing: {} (see `tlsprobe status`)",
        missing.join(", ")
    )
}

#[cfg(not(target_os = "linux"))]
fn preflight(_config: &SessionConfig) -> anyhow::Result<()> {
    anyhow::bail!(
        "uprobe capture is only available on Linux (running on {})",
        std::env::consts::OS
    )
}

fn print_reports(reports: &[ModuleReport]) {
    if reports.is_empty() {
        return;
    }
    eprintln!();
    eprintln!(
        "{:<10} {:<12} {:>8} {:>10} {:>9} {:>8} {:>11}",
        "MODULE", "STATE", "PROBES", "EVENTS", "BYTES", "DROPPED", "SINK ERRORS"
    );
    for report in reports {
        eprintln!(
            "{:<10} {:<12} {:>8} {:>10} {:>9} {:>8} {:>11}",
            report.name,
            report.state.as_str(),
            report.stats.attached,
            report.stats.events,
            report.stats.bytes,
            report.stats.dropped,
            report.stats.sink_errors
        );
        if let Some(error) = &report.error {
            eprintln!("  error: {}", error);
        }
    }
}

fn status_command(config: &SessionConfig) -> anyhow::Result<()> {
    println!();
    println!("tlsprobe v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    #[cfg(target_os = "linux")]
    {
        let report =
            tlsprobe_capture_ebpf::CapabilityReport::collect(config.session.ebpf_object.as_deref());
        println!();
        println!("Linux Capabilities:");
        println!(
            "  Kernel: {} (5.15+ required: {})",
            report.kernel.as_deref().unwrap_or("unknown"),
            yes_no(report.kernel_supported)
        );
        println!("  Running as root: {}", yes_no(report.root));
        println!("  CAP_BPF: {}", yes_no(report.cap_bpf));
        println!("  BPF filesystem: {}", yes_no(report.bpf_fs));
        println!("  BTF available: {}", yes_no(report.btf));
        println!("  Uprobe events: {}", yes_no(report.uprobes));
        match &report.object_override {
            Some(path) => println!("  Probe object: {}", path.display()),
            None => println!("  Probe object: embedded={}", yes_no(report.embedded_object)),
        }
        println!("  Ready: {}", yes_no(report.ready()));
    }

    println!();
    println!("Libraries:");
    let locator = LibraryLocator::new();
    for profile in BUILTIN {
        let module_config = config.module_config(profile.name);
        match locator.locate(profile, &module_config) {
            Ok(located) => println!(
                "  {:<8} {} ({:?})",
                profile.name,
                located.path.display(),
                located.source
            ),
            Err(e) => println!("  {:<8} not available: {}", profile.name, e),
        }
    }
    println!();

    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

struct DemoConfig {
    interval: u64,
    count: u64,
    hex: bool,
    output: Option<PathBuf>,
}

async fn demo_command(mut config: SessionConfig, demo: DemoConfig) -> anyhow::Result<()> {
    println!();
    println!("==================================================");
    println!("  tlsprobe - demo mode");
    println!("==================================================");
    println!();
    println!("  Simulated uprobes, no kernel access needed.");
    println!("  Modules whose library is missing are skipped.");
    println!();

    if demo.hex {
        config.session.hex_output = true;
    }
    if let Some(path) = demo.output {
        config.output.jsonl = Some(path);
    }

    let backend = SimulatedBackend::new();
    let registry = builtin_registry(Arc::new(backend.clone()));
    let sink = build_sink(&config)?;
    let mut orchestrator = Orchestrator::new(registry, sink).with_policy(SessionPolicy::BestEffort);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let traffic = TrafficGenerator::new(
        backend,
        TrafficConfig {
            interval: std::time::Duration::from_millis(demo.interval.max(1)),
            exchanges: demo.count,
            ..TrafficConfig::default()
        },
    );
    let traffic_cancel = cancel.clone();
    let generator = tokio::spawn(async move {
        let sent = traffic.run(traffic_cancel.clone()).await;
        // A bounded demo ends the session once the last exchange is out
        if sent > 0 && !traffic_cancel.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            traffic_cancel.cancel();
        }
        sent
    });

    let result = orchestrator
        .start(cancel.clone(), &config.session.modules, &config)
        .await;
    cancel.cancel();
    let sent = generator.await.unwrap_or(0);

    info!("Demo finished after {} exchanges", sent);
    print_reports(orchestrator.reports());

    result.map_err(anyhow::Error::new)
}
