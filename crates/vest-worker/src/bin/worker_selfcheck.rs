use std::path::Path;
use std::time::Duration;

use vest_queue::{QueueConfig, QueueRegistry};
use vest_worker::retry::{retry_async, RetryConfig};
use vest_worker::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env();
    let queue_config = QueueConfig::from_env();

    println!(
        "worker-selfcheck: starting with store={:?} report_dir={}",
        queue_config.store,
        config.report_output_dir.display()
    );
    ensure_report_dir(&config.report_output_dir).await?;
    ensure_store(queue_config).await?;
    if let Some(seed) = &config.investments_seed {
        ensure_file(seed)?;
    }

    println!("worker-selfcheck: ok");
    Ok(())
}

async fn ensure_report_dir(path: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(path).await?;
    let probe = path.join(".selfcheck");
    tokio::fs::write(&probe, b"ok")
        .await
        .map_err(|e| anyhow::anyhow!("report dir {} not writable: {}", path.display(), e))?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

async fn ensure_store(config: QueueConfig) -> anyhow::Result<()> {
    let registry = QueueRegistry::from_config(config)?;
    let retry = RetryConfig::new("store ping")
        .with_max_retries(3)
        .with_base_delay(Duration::from_millis(500));

    retry_async(&retry, || registry.initialize_queues())
        .await
        .map_err(|(e, attempts)| anyhow::anyhow!("queue store unreachable after {} attempts: {}", attempts, e))?;

    for stats in registry.get_all_queue_stats().await? {
        println!(
            "worker-selfcheck: {} waiting={} active={} failed={}",
            stats.queue_name, stats.waiting_count, stats.active_count, stats.failed_count
        );
    }
    Ok(())
}

fn ensure_file(path: &Path) -> anyhow::Result<()> {
    if !path.is_file() {
        return Err(anyhow::anyhow!("missing seed file {}", path.display()));
    }
    Ok(())
}
