//! Backend commands: API server and aggregation

use crate::backend::{self, AggregationWorker, RawStore};
use crate::config::Config;
use crate::error::Result;
use crate::models::AggregationStatus;

async fn open_store(config: &Config) -> Result<RawStore> {
    let path = config.database_path()?;
    println!("Using database: {}", path.display());
    RawStore::open(&path, &config.backend).await
}

/// Serve the ingestion API with aggregation workers until ctrl-c
pub async fn serve(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    backend::serve(store, &config.backend).await
}

/// Drain the pending queue once, optionally rebuilding a user's aggregates
pub async fn aggregate(config: &Config, rebuild: Option<String>) -> Result<()> {
    let store = open_store(config).await?;

    // Claims younger than the threshold may belong to a running server
    let recovered = store.recover_stale_claims(config.backend.stale_claim_after).await?;
    if recovered > 0 {
        println!("  Recovered {} abandoned rows", recovered);
    }

    let worker = AggregationWorker::new(0, store.clone(), &config.backend);
    let stats = worker.run_pass().await?;
    println!("Aggregation complete: {}", stats);

    if let Some(user_id) = rebuild {
        let buckets = store.rebuild_aggregates(&user_id).await?;
        println!("Rebuilt {} buckets for {}", buckets, user_id);
    }

    let counts = store.status_counts().await?;
    println!();
    println!("Raw samples:");
    for status in [
        AggregationStatus::Pending,
        AggregationStatus::Processing,
        AggregationStatus::Aggregated,
        AggregationStatus::Failed,
    ] {
        println!(
            "  {:<12}{:>8}",
            format!("{}:", status),
            counts.get(&status).copied().unwrap_or(0)
        );
    }

    Ok(())
}
