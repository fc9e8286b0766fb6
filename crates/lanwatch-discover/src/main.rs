//! CLI entry point for the lanwatch presence monitor.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use lanwatch_core::config::{load_presence_config, load_section};
use lanwatch_presence::{EventStore, NetworkCatalog, Notifier};

use lanwatch_discover::config::{DiscoverConfig, ScanProfile};
use lanwatch_discover::notify::TracingNotifier;
use lanwatch_discover::persist::{self, JsonlEventStore};
use lanwatch_discover::scanner::{NmapScanner, Prober};
use lanwatch_discover::scheduler::{run_single_scan, ScanScheduler};

#[derive(Parser)]
#[command(name = "lanwatch")]
#[command(about = "Track which devices are present on the local network")]
struct Cli {
    /// Target to scan (CIDR notation, e.g., 192.168.1.0/24).
    #[arg(short, long)]
    target: Option<String>,

    /// Follow the sweep with a port scan using this profile: quick, standard, deep.
    #[arg(short, long)]
    ports: Option<String>,

    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon with scheduled sweeps.
    #[arg(long)]
    daemon: bool,

    /// Print a per-kind summary of the event log and exit.
    #[arg(long)]
    show_log: bool,

    /// Event log path (overrides discover.event_log_path).
    #[arg(long)]
    event_log: Option<PathBuf>,

    /// Config file prefix (default: lanwatch).
    #[arg(short, long, default_value = "lanwatch")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let discover_config: DiscoverConfig = load_section(&cli.config, "discover")?;
    let event_log = cli
        .event_log
        .clone()
        .unwrap_or_else(|| PathBuf::from(&discover_config.event_log_path));

    if cli.show_log {
        return show_log(&event_log).await;
    }
    if !cli.once && !cli.daemon {
        anyhow::bail!("Specify --once (one-shot sweep) or --daemon (scheduled sweeps)");
    }

    let presence_config = load_presence_config(&cli.config)?;
    let coordinator = lanwatch_presence::build(presence_config);
    let sink = Arc::clone(coordinator.machine().sink());

    // Verify nmap installation.
    let scanner = NmapScanner::new(&discover_config.nmap_path, discover_config.local_prefix_len);
    let version = scanner.verify_installation().await?;
    tracing::info!(nmap_version = %version.trim(), "Nmap verified");
    let prober: Arc<dyn Prober> = Arc::new(scanner);

    let cancel = CancellationToken::new();
    let store: Arc<dyn EventStore> = Arc::new(JsonlEventStore::new(&event_log));
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier::new());
    let retry_delay = discover_config.delivery_retry();
    let dispatcher = {
        let sink = Arc::clone(&sink);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sink.dispatch(store.as_ref(), notifier.as_ref(), retry_delay, cancel)
                .await;
        })
    };
    tracing::info!(event_log = %event_log.display(), "Event dispatcher running");

    let outcome = if cli.once {
        run_once(&cli, &discover_config, prober, &coordinator, &cancel).await
    } else {
        let catalog = Arc::new(NetworkCatalog::new(Arc::clone(&sink)));
        let scheduler = ScanScheduler::new(discover_config, prober, coordinator, catalog);

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        });

        scheduler.run(cancel.clone()).await.map_err(anyhow::Error::from)
    };

    cancel.cancel();
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Event dispatcher panicked");
    }
    if !sink.is_empty() {
        tracing::warn!(undelivered = sink.len(), "Exiting with undelivered events");
    }

    outcome
}

async fn run_once(
    cli: &Cli,
    config: &DiscoverConfig,
    prober: Arc<dyn Prober>,
    coordinator: &lanwatch_presence::ScanCoordinator,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let target = cli
        .target
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("--target is required in --once mode"))?;
    let profile = cli
        .ports
        .as_deref()
        .map(str::parse::<ScanProfile>)
        .transpose()?;

    if let Some((ip, network)) = prober.local_interface() {
        coordinator.report_local_interface(ip, network);
    }

    let report = run_single_scan(
        prober.as_ref(),
        coordinator,
        target,
        profile.as_ref(),
        config.scan_timeout(),
        cancel,
    )
    .await?;

    for event in &report.events {
        tracing::info!(
            kind = %event.kind(),
            device = %event.device_id().map(|d| d.as_str()).unwrap_or_default(),
            "Presence change"
        );
    }
    Ok(())
}

async fn show_log(path: &std::path::Path) -> anyhow::Result<()> {
    let entries = persist::read_log(path).await?;
    let summary = persist::summarize(&entries);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
