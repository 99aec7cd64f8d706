//! Job worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vest_queue::{QueueConfig, QueueRegistry};
use vest_worker::services::{
    EmailTransport, FsArtifactStore, InMemoryInvestments, InvestmentReportSource, LogNotifier,
    LogTransport, SmtpMailer, TemplateRegistry,
};
use vest_worker::{
    EmailProcessor, NotificationProcessor, ReportProcessor, RoiDistributionProcessor,
    WorkerConfig, WorkerRuntime,
};

fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vest=info".parse()?)
        .add_directive("lettre=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting vest-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!("Serving metrics on {}", addr);
    }

    let registry = Arc::new(
        QueueRegistry::from_config(QueueConfig::from_env()).context("failed to create queue registry")?,
    );
    registry
        .initialize_queues()
        .await
        .context("queue store is not reachable")?;

    let investments = Arc::new(match &config.investments_seed {
        Some(path) => InMemoryInvestments::load_seed_file(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => InMemoryInvestments::new(),
    });

    let transport: Arc<dyn EmailTransport> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp, &config.mail_from)?),
        None => Arc::new(LogTransport),
    };
    let templates = Arc::new(TemplateRegistry::with_defaults());

    let runtime = Arc::new(
        WorkerRuntime::new(config.clone(), registry.clone())
            .with_processor(Arc::new(EmailProcessor::new(transport, templates)))
            .with_processor(Arc::new(RoiDistributionProcessor::new(
                investments.clone(),
                investments.clone(),
                registry.clone(),
            )))
            .with_processor(Arc::new(ReportProcessor::new(
                Arc::new(InvestmentReportSource::new(investments.clone(), investments)),
                Arc::new(FsArtifactStore::new(&config.report_output_dir)),
                registry.clone(),
                config.report_timeout,
            )))
            .with_processor(Arc::new(NotificationProcessor::new(Arc::new(LogNotifier)))),
    );

    runtime.start().await?;

    shutdown_signal().await;
    info!("Received shutdown signal");

    // A second signal during the drain exits immediately
    let shutdown = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.shutdown().await }
    });
    tokio::select! {
        _ = shutdown => info!("Worker shutdown complete"),
        _ = shutdown_signal() => {
            error!("Second shutdown signal received, exiting without drain");
            std::process::exit(1);
        }
    }

    Ok(())
}
