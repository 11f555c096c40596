//! Z-Entitle Worker - lifecycle sweeps and consistency reconciliation
//!
//! This is the main entry point for the z-entitle worker.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use z_entitle_service::{
    BillingOrchestrator, ConsistencyReconciler, LocalProcessor, ServiceConfig,
};
use z_entitle_store::{MemoryCache, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,z_entitle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Z-Entitle Worker");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        data_dir = %config.data_dir,
        reconcile_interval_seconds = config.reconcile_interval_seconds,
        past_due_grace_days = config.past_due_grace_days,
        processor_configured = %config.processor_api_key.is_some(),
        "Service configuration loaded"
    );

    let catalog = config.load_catalog()?;
    tracing::info!(plans = catalog.plans().len(), "Plan catalog loaded");

    let store = open_store(&config)?;
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(config.cache_ttl_seconds)));

    if config.processor_api_key.is_none() {
        tracing::warn!("Processor not configured - using the local in-memory processor");
    }
    let processor = Arc::new(LocalProcessor::new());

    let interval = Duration::from_secs(config.reconcile_interval_seconds);
    let orchestrator = Arc::new(BillingOrchestrator::new(
        Arc::clone(&store),
        cache,
        processor,
        catalog,
        config,
    ));
    let reconciler = ConsistencyReconciler::new(Arc::clone(&orchestrator));

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }

        for customer in store.list_customers()? {
            if let Err(e) = orchestrator.advance(customer).await {
                tracing::warn!(customer_id = %customer, error = %e, "lifecycle sweep failed");
            }
            if let Err(e) = orchestrator.reset_due_grants(customer).await {
                tracing::warn!(customer_id = %customer, error = %e, "grant reset failed");
            }
        }

        match reconciler.run_all_checks().await {
            Ok(report) => {
                for finding in report.findings.iter().filter(|f| !f.repaired) {
                    tracing::warn!(
                        rule = %finding.rule,
                        severity = %finding.severity,
                        customer_id = %finding.customer,
                        description = %finding.description,
                        "Unresolved finding"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
        }
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(z_entitle_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!(
        path = %config.data_dir,
        "Built without rocksdb-backend - state is kept in memory"
    );
    Ok(Arc::new(z_entitle_store::MemoryStore::new()))
}
