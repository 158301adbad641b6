//! Bot Engine - runs the worker loop over all active bots
//!
//! Uses PostgreSQL when `database_url` is configured and an in-memory store
//! otherwise. Orders go to the paper exchange.

use std::sync::Arc;
use tracing::{info, Level};

use bot_engine::store::{init_db, BotStore, MemoryStore, PgStore};
use bot_engine::{Engine, PaperExchange, Settings, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    // Initialize logging
    let level = settings.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Bot Engine...");

    let store: Arc<dyn BotStore> = match &settings.database_url {
        Some(url) => {
            let db = init_db(url, settings.database_max_connections).await?;
            info!("✓ Database connected");
            let store = PgStore::new(db);
            store.migrate().await?;
            info!("✓ Migrations applied");
            Arc::new(store)
        }
        None => {
            info!("No database_url configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let paper = Arc::new(PaperExchange::new(settings.paper.clone()));
    info!("Exchange: paper ({})", settings.paper.name);

    let engine = Engine::new(&settings, store, paper.clone(), paper);
    let worker = Worker::new(engine, settings.worker.clone());

    worker
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    info!("Bot Engine stopped");
    Ok(())
}
