use idempotency_engine::api::{create_router, AppState, EchoOperation};
use idempotency_engine::config::Settings;
use idempotency_engine::idempotency::{
    CoordinatorConfig, LeaseStore, PostgresRecordStore, RecordReaper, RecordStore, RedisLeaseStore,
};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging and metrics
    init_logging(&LogConfig::from(&settings.application))?;
    let metrics_handle = init_metrics()?;
    info!("Configuration loaded");

    // Connect to PostgreSQL
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    // Connect to Redis
    info!("Connecting to Redis...");
    let redis_client = redis::Client::open(settings.redis.url.as_str())?;
    let mut con = redis_client.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("PING").query_async(&mut con).await?;
    info!("Redis connection established");

    let records: Arc<dyn RecordStore> = Arc::new(PostgresRecordStore::new(pool.clone()));
    let leases: Arc<dyn LeaseStore> = Arc::new(RedisLeaseStore::new(
        redis_client.clone(),
        settings.idempotency.key_prefix.clone(),
    ));

    match settings.idempotency.retention() {
        Some(retention) => {
            RecordReaper::new(
                Arc::clone(&records),
                retention,
                Duration::from_secs(settings.idempotency.reaper_interval_secs),
            )
            .start();
            info!("Record reaper started with retention of {}s", retention.as_secs());
        }
        None => info!("No retention configured, terminal records are kept"),
    }

    let state = AppState::new(
        records,
        leases,
        CoordinatorConfig::from(&settings.idempotency),
        Arc::new(EchoOperation),
    )
    .with_metrics(metrics_handle)
    .with_health_checker(Arc::new(HealthChecker::for_stores(pool, redis_client)));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.application.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Idempotency engine listening on {}", addr);

    axum::serve(listener, create_router(state)).await?;

    Ok(())
}
