use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use tokio::net::TcpListener;

use admission_server::admission::{AdmissionOrchestrator, AdmissionPolicy, PurchaseRegistry};
use admission_server::config::Config;
use admission_server::init_tracing;
use admission_server::routes::{create_routes, AppState, RouteOptions};
use admission_server::store::{PgTicketStore, TicketStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    init_tracing("admission_server=debug,tower_http=debug");

    let config = Config::from_env()?;

    let store = PgTicketStore::connect(
        &config.database_url,
        config.db_max_connections,
        config.db_lock_timeout,
    )
    .await?;
    tracing::info!("Successfully connected to database");

    store.migrate().await?;

    let store: Arc<dyn TicketStore> = Arc::new(store);
    let state = AppState {
        orchestrator: AdmissionOrchestrator::new(
            store.clone(),
            AdmissionPolicy::new(config.duplicate_scan_window),
        ),
        registry: PurchaseRegistry::new(store, config.individual_cutover),
    };

    let app = create_routes(
        state,
        RouteOptions {
            include_hsts: config.production,
            cors_allowed_origins: config.cors_allowed_origins.as_deref(),
        },
    );

    tracing::info!(
        duplicate_window_secs = config.duplicate_scan_window.num_seconds(),
        cutover = %config.individual_cutover,
        "Server running at http://{}",
        config.bind_addr
    );

    let listener = TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
