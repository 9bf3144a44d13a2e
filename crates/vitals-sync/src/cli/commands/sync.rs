//! Sync commands for the device client

use std::sync::Arc;

use tokio::sync::watch;

use crate::client::{BackendClient, IngestApi};
use crate::config::Config;
use crate::dashboard::DashboardCache;
use crate::device::JsonFileSource;
use crate::error::{Result, VitalsError};
use crate::storage::SharedSyncDb;
use crate::sync::{
    HttpProbe, NetworkMonitor, SyncOrchestrator, SyncOutcome, SyncScheduler, SyncTransport,
};

/// Wire up one user session from configuration
async fn build_session(config: &Config) -> Result<Arc<SyncOrchestrator>> {
    let export = config.client.device_export.as_ref().ok_or_else(|| {
        VitalsError::config("client.device_export must point at a device sample export")
    })?;
    let device = Arc::new(JsonFileSource::load(export)?);

    let db = SharedSyncDb::open(&config.state_path()?)?;
    let api: Arc<dyn IngestApi> = Arc::new(BackendClient::from_config(&config.client)?);

    let probe = HttpProbe::new(&config.client.backend_url, config.network.probe_timeout)?;
    let monitor = Arc::new(NetworkMonitor::new(Arc::new(probe), &config.network));
    monitor.check().await;

    let transport = SyncTransport::new(api.clone(), db, &config.client);
    let cache = Arc::new(DashboardCache::new(
        api.clone(),
        &config.client.user_id,
        config.dashboard.ttl,
    ));

    let orchestrator = SyncOrchestrator::new(
        device,
        api,
        transport,
        monitor,
        &config.sync,
        &config.network,
    )
    .with_dashboard(cache);

    Ok(Arc::new(orchestrator))
}

/// Run one sync, or keep syncing on a schedule when `continuous`
pub async fn run(config: &Config, initial: bool, continuous: bool) -> Result<()> {
    let orchestrator = build_session(config).await?;

    let mut notices = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            println!("{}", notice);
        }
    });

    if initial {
        report(orchestrator.perform_initial_sync().await?);
    }

    if continuous {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(orchestrator.monitor().clone().run(shutdown_rx.clone()));
        let scheduler = SyncScheduler::new(orchestrator.clone(), config.sync.interval);

        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(true);
        });

        scheduler.run(shutdown_rx).await;
        let _ = monitor.await;
    } else if !initial {
        report(orchestrator.sync().await?);
    }

    printer.abort();
    Ok(())
}

fn report(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(_) => {}
        SyncOutcome::Skipped => println!("A sync is already running"),
        SyncOutcome::RetryScheduled { delay, .. } => {
            println!("Sync failed on the network; next attempt due in {}s", delay.as_secs())
        }
        SyncOutcome::WaitingForNetwork => println!("Offline; run again once the network is back"),
    }
}

/// Show local sync cursors
pub async fn status(config: &Config) -> Result<()> {
    let path = config.state_path()?;
    if !path.exists() {
        println!("No sync state found at: {}", path.display());
        println!("Run 'vitals sync' to create one.");
        return Ok(());
    }

    let db = SharedSyncDb::open(&path)?;
    let statuses = db.list_statuses(&config.client.user_id).await?;

    println!("State: {}", path.display());
    println!("User: {}", config.client.user_id);
    println!();

    if statuses.is_empty() {
        println!("No metrics synced yet.");
        return Ok(());
    }

    println!(
        "{:<12} {:<26} {:<26} {:<6} ERROR",
        "SOURCE", "METRIC", "LAST SYNC", "OK"
    );
    for status in statuses {
        println!(
            "{:<12} {:<26} {:<26} {:<6} {}",
            status.source,
            status.metric_type.as_str(),
            status
                .last_sync_date
                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            if status.success { "yes" } else { "no" },
            status.error_message.unwrap_or_default()
        );
    }

    Ok(())
}

/// Print the backend dashboard view as JSON
pub async fn dashboard(config: &Config) -> Result<()> {
    let client = BackendClient::from_config(&config.client)?;
    let view = client.dashboard(&config.client.user_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
