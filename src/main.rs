use pipeline_config_engine::config::AppConfig;
use pipeline_config_engine::model::ConfigurationDocument;
use pipeline_config_engine::seed;
use pipeline_config_engine::store::{ConfigStore, InMemoryStore, PostgresStore};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::{info, LevelFilter};

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: server={}:{}, merge_enabled={}",
        config.server.host, config.server.port, config.engine.merge_enabled
    );

    let initial = ConfigurationDocument::new().with_security(config.security.clone());
    let load_seed = std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true";

    match config.database_url() {
        Some(database_url) => {
            info!("Connecting to PostgreSQL...");
            let store = PostgresStore::new(&database_url, config.max_connections()).await?;
            store.migrate().await?;
            let fingerprint = store.initialize(&initial).await?;
            info!("Configuration head at {}", fingerprint.short());
            run_server(Arc::new(store), &config, load_seed).await
        }
        None => {
            info!("No database configured, keeping configuration in memory");
            let store = InMemoryStore::new(initial)?;
            run_server(Arc::new(store), &config, load_seed).await
        }
    }
}

async fn run_server<S: ConfigStore + 'static>(
    store: Arc<S>,
    config: &AppConfig,
    load_seed: bool,
) -> anyhow::Result<()> {
    if load_seed {
        log::info!("Loading seed data...");
        seed::load_seed_data(store.as_ref()).await?;
    }

    let app = pipeline_config_engine::build_app(store, config);
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("Configuration server running on http://{}", bind_address);

    pipeline_config_engine::serve(listener, app).await
}
