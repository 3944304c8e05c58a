use std::sync::Arc;

use anyhow::Context;
use creditmeter_backend::{
    config::Config,
    db::{
        account_repository::AccountRepository,
        billing_event_log_repository::BillingEventLogRepository,
        consumption_audit_repository::ConsumptionAuditRepository,
        postgres_account_repository::PostgresAccountRepository,
        postgres_billing_event_log_repository::PostgresBillingEventLogRepository,
        postgres_consumption_audit_repository::PostgresConsumptionAuditRepository,
    },
    routes, AppState,
};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing();

    let pg_pool = establish_connection(&config.database_url, config.database_max_connections)
        .await?;

    let accounts = Arc::new(PostgresAccountRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn AccountRepository>;
    let billing_events = Arc::new(PostgresBillingEventLogRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn BillingEventLogRepository>;
    let audit_log = Arc::new(PostgresConsumptionAuditRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn ConsumptionAuditRepository>;

    let addr = config.bind_addr;
    info!(
        %addr,
        plans = config.plans.plans().len(),
        free_tier_quota = config.ledger.free_tier_quota,
        signed_webhooks = config.webhook_secret.is_some(),
        "starting creditmeter"
    );

    let state = AppState {
        accounts,
        billing_events,
        audit_log,
        config: Arc::new(config),
    };
    let app = routes::router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    pg_pool.close().await;
    info!("creditmeter stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to the database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("failed to verify database connection")?;

    info!("connected to the database");
    Ok(pool)
}
