use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::info;

use timeline_validator::config::Config;
use timeline_validator::notify::NotifyHub;
use timeline_validator::store::{InMemoryStore, ItemStore, JournaledStore};
use timeline_validator::trigger::TriggerHandler;
use timeline_validator::{runner, sweeper};

const COMPACT_CHECK_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries reports; logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    timeline_validator::observability::init(config.metrics_port)?;

    let store: Arc<dyn ItemStore> = if config.journal {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.journal_path();
        let journaled = Arc::new(JournaledStore::open(&path)?);
        tokio::spawn(sweeper::run_compactor(
            journaled.clone(),
            config.compact_threshold,
            COMPACT_CHECK_EVERY,
        ));
        info!("journal: {}", path.display());
        journaled
    } else {
        info!("journal: disabled, documents kept in memory only");
        Arc::new(InMemoryStore::new())
    };

    let handler = Arc::new(
        TriggerHandler::new(store, Arc::new(NotifyHub::new()))
            .with_revalidate_on_delete(config.revalidate_on_delete)
            .with_concurrency(config.revalidate_concurrency),
    );
    if let Some(period) = config.revalidate_interval {
        tokio::spawn(sweeper::run_revalidator(handler.clone(), period));
    }
    info!("  revalidate_on_delete: {}", config.revalidate_on_delete);
    info!(
        "  revalidation sweep: {}",
        config
            .revalidate_interval
            .map_or("disabled".to_string(), |p| format!("every {}s", p.as_secs()))
    );

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };

    let reader = BufReader::new(tokio::io::stdin());
    let stats = runner::run_until(&handler, reader, tokio::io::stdout(), shutdown).await?;
    info!(events = stats.events, errors = stats.errors, "event loop finished");

    info!("timeline-validator stopped");
    Ok(())
}
