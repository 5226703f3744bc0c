//! Simple Bank task worker
//!
//! Runs the background task processor:
//!
//! ```text
//! ┌──────────────┐   claim    ┌───────────────┐   handler   ┌──────────────┐
//! │ Task Broker  │──────────▶│ TaskProcessor │───────────▶│ verify email │
//! │ (tasks tbl)  │◀──────────│  (N workers)  │            │ store + mail │
//! └──────────────┘  outcome   └───────────────┘            └──────────────┘
//! ```
//!
//! Usage: `simple_bank [--env <name>]` reads `config/<name>.yaml` (default `dev`).

use anyhow::{Context, Result};
use std::sync::Arc;

use simple_bank::config::AppConfig;
use simple_bank::db::schema::init_schema;
use simple_bank::db::{Backend, Database, MemoryDatabase, Store};
use simple_bank::mail::LogSender;
use simple_bank::worker::{
    Broker, MemoryBroker, PgBroker, SendVerifyEmailHandler, ServeMux, TASK_SEND_VERIFY_EMAIL,
    TaskProcessor,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = simple_bank::logging::init_logging(&config);

    tracing::info!("Starting Simple Bank worker in {} mode", env);

    match config.postgres_url.as_deref() {
        Some(url) => {
            let db = Database::connect(url, &config.database)
                .await
                .context("Failed to connect to PostgreSQL")?;
            init_schema(db.pool()).await?;
            let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(&db));
            run(db, broker, &config).await
        }
        None => {
            tracing::warn!("postgres_url not set, using the in-memory backend");
            run(MemoryDatabase::new(), Arc::new(MemoryBroker::new()), &config).await
        }
    }
}

async fn run<B: Backend>(backend: B, broker: Arc<dyn Broker>, config: &AppConfig) -> Result<()> {
    let mut store = Store::new(backend);
    if let Some(timeout) = config.database.tx_timeout() {
        store = store.with_tx_timeout(timeout);
    }

    let mailer = Arc::new(LogSender::new(
        config.email.sender_name.clone(),
        config.email.sender_address.clone(),
    ));
    let mut mux = ServeMux::new();
    mux.handle(
        TASK_SEND_VERIFY_EMAIL,
        Arc::new(SendVerifyEmailHandler::new(
            Arc::new(store),
            mailer,
            config.email.clone(),
        )),
    );

    let processor = TaskProcessor::new(broker, mux, config.worker.processor_config());
    let handle = processor.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    handle.shutdown().await;
    Ok(())
}
