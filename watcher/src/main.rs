// Watcher binary entry point

use anyhow::{anyhow, Context};
use common::chain::NodeClient;
use common::config::{Settings, TransportKind};
use common::db::repositories::{OracleWatchRepository, SubscriberRepository, TriggerRepository};
use common::db::DbPool;
use common::notifications::TemplateTable;
use common::queue::{NatsClient, NatsNotificationPublisher};
use common::router::{LogTransport, MessageTransport, NotificationRouter};
use common::schedule::SystemClock;
use common::scheduler::EpochScheduler;
use common::telemetry;
use common::triggers::catalog::required_templates;
use common::triggers::TriggerContext;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(&settings.observability.log_level)?;
    info!("Starting epoch notifier watcher");

    settings
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    let policy = settings
        .policy
        .parse()
        .map_err(|e| anyhow!("Invalid policy: {}", e))?;

    if settings.observability.metrics_port != 0 {
        telemetry::init_metrics(settings.observability.metrics_port)?;
    }

    info!(
        node_url = %settings.chain.node_url,
        nats_url = %settings.nats.url,
        transport = ?settings.notifier.transport,
        "Configuration loaded"
    );

    let templates = TemplateTable::load(&settings.notifier.templates_path)?;
    templates.validate(&required_templates())?;
    info!(path = %settings.notifier.templates_path, "Templates loaded");

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    db_pool.run_migrations().await?;

    let chain = Arc::new(NodeClient::from_config(&settings.chain)?);

    let transport: Arc<dyn MessageTransport> = match settings.notifier.transport {
        TransportKind::Nats => {
            let client = NatsClient::connect(settings.nats.clone()).await.map_err(|e| {
                error!(error = %e, "Failed to initialize NATS client");
                e
            })?;
            client.initialize_stream().await?;
            Arc::new(NatsNotificationPublisher::new(client))
        }
        TransportKind::Log => Arc::new(LogTransport),
    };

    let shutdown = CancellationToken::new();
    // Cancelled once the scheduler has stopped
    let router_shutdown = CancellationToken::new();
    let (router, emitter) = NotificationRouter::new(transport);
    let router_handle = tokio::spawn(router.run(router_shutdown.clone()));

    let ctx = TriggerContext {
        chain,
        store: Arc::new(TriggerRepository::new(db_pool.clone())),
        watches: Arc::new(OracleWatchRepository::new(db_pool.clone())),
        templates: Arc::new(templates),
        emitter,
        clock: Arc::new(SystemClock),
        policy,
        links: settings.links.clone(),
        oracle: settings.oracle.clone(),
        state_poll: settings.scheduler.state_poll(),
    };
    let directory = Arc::new(SubscriberRepository::new(db_pool.clone()));
    let scheduler = EpochScheduler::new(ctx, directory, settings.scheduler.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C signal, initiating graceful shutdown");
            shutdown.cancel();
        });
    }

    tokio::select! {
        _ = scheduler.launch() => {
            scheduler.run(shutdown.clone()).await;
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested during launch");
        }
    }

    router_shutdown.cancel();
    if let Err(e) = router_handle.await {
        error!(error = %e, "Notification router task failed");
    }
    db_pool.close().await;

    info!("Watcher stopped");
    Ok(())
}
