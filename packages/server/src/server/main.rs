// Main entry point for the mailroom server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mailroom_core::config::QueueModeConfig;
use mailroom_core::kernel::deps::{EngineDeps, EngineSettings};
use mailroom_core::kernel::jobs::{JobQueue, JobRegistry, QueueMode, WorkerRuntime};
use mailroom_core::kernel::mailbox::GmailMailbox;
use mailroom_core::kernel::model::OpenAiModel;
use mailroom_core::kernel::traits::StaticTokenSource;
use mailroom_core::kernel::vision::VisionExtraction;
use mailroom_core::scheduler::PollingScheduler;
use mailroom_core::server::{build_app, AppState, NotificationVerifier};
use mailroom_core::store::PgStore;
use mailroom_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailroom_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting mailroom server");

    let config = Config::from_env().context("failed to load configuration")?;
    if config.mail_access_token.is_empty() {
        tracing::warn!("MAIL_ACCESS_TOKEN is unset; mailbox and storage calls will be rejected");
    }

    tracing::info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let tokens = Arc::new(StaticTokenSource::new(config.mail_access_token.clone()));
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue_mode = match config.queue_mode {
        QueueModeConfig::Queue => QueueMode::Queue,
        QueueModeConfig::Inline => QueueMode::Inline,
    };
    let queue = Arc::new(JobQueue::new(store.clone(), queue_mode));

    let deps = Arc::new(
        EngineDeps::builder()
            .store(store)
            .mailbox(Arc::new(GmailMailbox::new(tokens.clone())))
            .model(Arc::new(OpenAiModel::new(&config.openai_api_key)))
            .extraction(Arc::new(VisionExtraction::new(
                tokens,
                config.extraction_bucket.clone(),
            )))
            .queue(queue.clone())
            .settings(EngineSettings::from_config(&config))
            .build(),
    );

    let registry = Arc::new(JobRegistry::standard());
    let runtime = match queue_mode {
        QueueMode::Inline => {
            tracing::info!("queue mode: inline, jobs run on the enqueueing task");
            let inline_deps = deps.clone();
            let inline_registry = registry.clone();
            queue.install_inline_executor(move |job| {
                let registry = inline_registry.clone();
                let deps = inline_deps.clone();
                Box::pin(async move { registry.run(job, deps).await })
            });
            None
        }
        QueueMode::Queue => {
            let runtime = Arc::new(WorkerRuntime::new(deps.clone(), registry));
            runtime.ensure_started().await;
            Some(runtime)
        }
    };

    let scheduler = Arc::new(PollingScheduler::new(
        deps.clone(),
        Duration::from_secs(config.poll_tick_secs),
    ));
    let scheduler_handle = scheduler.start();

    let app = build_app(AppState {
        deps,
        scheduler: scheduler.clone(),
        verifier: Arc::new(NotificationVerifier::new(&config)),
        db_pool: Some(pool),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "shutdown signal listener failed");
            }
        })
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    scheduler.stop();
    if let Err(e) = scheduler_handle.await {
        tracing::warn!(error = %e, "scheduler task ended abnormally");
    }
    if let Some(runtime) = runtime {
        runtime.shutdown().await;
    }

    Ok(())
}
