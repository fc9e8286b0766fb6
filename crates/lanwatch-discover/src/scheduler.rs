//! Scan scheduling engine.
//!
//! Spawns one tokio task per configured network, each running a sweep (and
//! optionally a port scan) at the network's interval. A semaphore limits
//! concurrent nmap processes. Every pass is bounded by the scan timeout and
//! the shared cancellation token; a pass that errors, times out or is
//! cancelled is reported to the coordinator as failed.

use std::future::Future;
use std::sync::Arc;

use lanwatch_presence::{BatchReport, NetworkCatalog, ScanCoordinator};
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoverConfig, NetworkSchedule, ScanProfile};
use crate::error::{DiscoverError, Result};
use crate::scanner::Prober;

/// The scheduler manages periodic scan jobs for multiple networks.
pub struct ScanScheduler {
    config: DiscoverConfig,
    prober: Arc<dyn Prober>,
    coordinator: Arc<ScanCoordinator>,
    catalog: Arc<NetworkCatalog>,
    concurrency: Arc<Semaphore>,
}

impl ScanScheduler {
    pub fn new(
        config: DiscoverConfig,
        prober: Arc<dyn Prober>,
        coordinator: Arc<ScanCoordinator>,
        catalog: Arc<NetworkCatalog>,
    ) -> Self {
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_scans.max(1)));
        Self {
            config,
            prober,
            coordinator,
            catalog,
            concurrency,
        }
    }

    /// Register the configured networks, then run one loop per enabled
    /// network until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        report_local_interface(self.prober.as_ref(), &self.coordinator);

        let mut handles = Vec::new();
        for schedule in &self.config.networks {
            let network = schedule.to_network()?;
            if let Err(e) = self.catalog.create(network) {
                tracing::warn!(name = %schedule.name, error = %e, "Network not registered");
                continue;
            }

            if !schedule.enabled {
                tracing::info!(cidr = %schedule.cidr, "Network disabled, skipping");
                continue;
            }

            let pass = NetworkPass {
                prober: Arc::clone(&self.prober),
                coordinator: Arc::clone(&self.coordinator),
                profile: schedule
                    .profile
                    .clone()
                    .unwrap_or(self.config.default_profile.clone()),
                schedule: schedule.clone(),
                timeout: self.config.scan_timeout(),
            };
            let semaphore = Arc::clone(&self.concurrency);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                run_network_loop(pass, semaphore, cancel).await;
            }));
        }

        tracing::info!(network_count = handles.len(), "Scheduler started");

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Network scan task panicked");
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

struct NetworkPass {
    prober: Arc<dyn Prober>,
    coordinator: Arc<ScanCoordinator>,
    schedule: NetworkSchedule,
    profile: ScanProfile,
    timeout: Duration,
}

/// Per-network scan loop with configurable interval.
async fn run_network_loop(pass: NetworkPass, semaphore: Arc<Semaphore>, cancel: CancellationToken) {
    let cidr = pass.schedule.cidr.as_str();
    let mut ticker = interval(Duration::from_secs(pass.schedule.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tracing::info!(cidr = %cidr, port_scan = pass.schedule.port_scan, "Scheduled scan triggered");
        report_local_interface(pass.prober.as_ref(), &pass.coordinator);

        let port_profile = pass.schedule.port_scan.then_some(&pass.profile);
        match run_single_scan(
            pass.prober.as_ref(),
            &pass.coordinator,
            cidr,
            port_profile,
            pass.timeout,
            &cancel,
        )
        .await
        {
            Ok(report) => {
                tracing::debug!(cidr = %cidr, transitions = report.events.len(), "Scheduled scan done");
            }
            Err(DiscoverError::Cancelled) => break,
            Err(e) => {
                tracing::error!(cidr = %cidr, error = %e, "Scheduled scan failed");
            }
        }
    }

    tracing::info!(cidr = %cidr, "Network loop stopped");
}

/// Execute one pass against `target`: a ping sweep, then a port scan with
/// `port_profile` if given. Returns the combined transitions of both.
pub async fn run_single_scan(
    prober: &dyn Prober,
    coordinator: &ScanCoordinator,
    target: &str,
    port_profile: Option<&ScanProfile>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let ticket = coordinator.begin_sweep(target);
    let mut report = match bounded(prober.ping_sweep(target), timeout, cancel).await {
        Ok(responders) => coordinator.complete_sweep(ticket, responders),
        Err(e) => {
            coordinator.fail(ticket, &e.to_string());
            return Err(e);
        }
    };

    if let Some(profile) = port_profile {
        let ticket = coordinator.begin_port_scan(target);
        match bounded(prober.port_scan(target, profile), timeout, cancel).await {
            Ok(result) => report.merge(coordinator.complete_port_scan(ticket, result)),
            Err(e) => {
                coordinator.fail(ticket, &e.to_string());
                return Err(e);
            }
        }
    }

    Ok(report)
}

async fn bounded<T>(
    probe: impl Future<Output = Result<T>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DiscoverError::Cancelled),
        outcome = tokio::time::timeout(timeout, probe) => match outcome {
            Ok(result) => result,
            Err(_) => Err(DiscoverError::Timeout { secs: timeout.as_secs() }),
        },
    }
}

fn report_local_interface(prober: &dyn Prober, coordinator: &ScanCoordinator) {
    match prober.local_interface() {
        Some((ip, network)) => {
            coordinator.report_local_interface(ip, network);
        }
        None => tracing::debug!("Local interface not determined"),
    }
}
