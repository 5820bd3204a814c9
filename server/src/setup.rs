use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::{HttpTokenVerifier, StaticTokenVerifier, TokenVerifier};
use crate::bridge::{AggregatorRouter, BridgeRouter, MockBridgeRouter};
use crate::chain::{EscrowChain, EvmChainClient};
use crate::conf::Conf;
use crate::cross_chain::CrossChainEngine;
use crate::deal::DealService;
use crate::deployer::{ArtifactDeployer, EscrowArtifact, EscrowDeployer};
use crate::networks::Network;
use crate::scheduler::DeadlineScheduler;
use crate::services::user_service::{StaticUserDirectory, User, UserDirectory, UserService};
use crate::store::{DealStore, MemoryDealStore, PgDealStore};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./src/migrations");

pub fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_database(config: &Conf) -> Result<PgPool> {
    info!("Connecting to database: {}", config.database_url);
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .acquire_timeout(std::time::Duration::from_secs(1))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to the config database")?;

    if config.database_url.ends_with(&config.database_name) {
        return Ok(pool);
    }

    // Check if database exists
    let database_exists = sqlx::query(
        format!(
            "SELECT 1 FROM pg_database WHERE datname = '{}'",
            config.database_name
        )
        .as_str(),
    )
    .fetch_optional(&pool)
    .await?;

    if database_exists.is_none() {
        info!("Creating database: {}", config.database_name);
        sqlx::query(format!("CREATE DATABASE {}", config.database_name).as_str())
            .execute(&pool)
            .await?;
    }

    let database_url = format!("{}/{}", config.database_url, config.database_name);
    info!("Connecting to database: {}", database_url);

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(1))
        .connect(&database_url)
        .await
        .context("Failed to connect to the created database")?;

    Ok(pool)
}

pub async fn setup_database(config: &Conf, clean_db: bool) -> Result<PgPool> {
    let pool = connect_database(config).await?;

    if clean_db {
        info!("Cleaning database: {}", config.database_name);
        sqlx::query("DROP SCHEMA public CASCADE;")
            .execute(&pool)
            .await
            .context("cleaning database")?;
        sqlx::query("CREATE SCHEMA public;")
            .execute(&pool)
            .await
            .context("creating public schema")?;
    }

    info!("Running database migrations");
    MIGRATOR.run(&pool).await?;
    info!("Database migrations completed");

    Ok(pool)
}

pub struct ServiceContext {
    pub store: Arc<dyn DealStore>,
    pub users: Arc<dyn UserDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub engine: Arc<CrossChainEngine>,
    pub deal_service: Arc<DealService>,
    pub scheduler: Option<Arc<DeadlineScheduler>>,
}

pub async fn setup_services(config: &Conf, pool: Option<PgPool>) -> Result<ServiceContext> {
    let (store, users, router, verifier): (
        Arc<dyn DealStore>,
        Arc<dyn UserDirectory>,
        Arc<dyn BridgeRouter>,
        Arc<dyn TokenVerifier>,
    ) = match pool {
        Some(pool) => (
            Arc::new(PgDealStore::new(pool.clone())),
            Arc::new(UserService::new(pool)),
            Arc::new(AggregatorRouter::new(config.bridge.aggregator_url.clone())?),
            Arc::new(HttpTokenVerifier::new(config.auth_verify_url.clone())),
        ),
        None => {
            info!("Running offline: in-memory store, mock bridge, static auth");
            (
                Arc::new(MemoryDealStore::new()),
                Arc::new(StaticUserDirectory::new(offline_users())),
                Arc::new(MockBridgeRouter::with_default_route()),
                Arc::new(StaticTokenVerifier),
            )
        }
    };

    let chain: Option<Arc<dyn EscrowChain>> = if config.chain.rpc_url.is_empty()
        || config.chain.backend_wallet_private_key.is_empty()
    {
        warn!("RPC url or backend wallet key missing; deadline scheduler disabled");
        None
    } else {
        let network = config
            .chain
            .network
            .parse::<Network>()
            .context("parsing chain network")?;
        Some(Arc::new(
            EvmChainClient::connect(
                &config.chain.rpc_url,
                &config.chain.backend_wallet_private_key,
                network,
            )
            .await
            .context("initializing chain client")?,
        ))
    };

    let deployer: Option<Arc<dyn EscrowDeployer>> = if config.chain.deployer_private_key.is_empty()
    {
        info!("Deployer key missing; deal creation will skip contract deployment");
        None
    } else {
        Some(Arc::new(ArtifactDeployer::new(
            EscrowArtifact::embedded()?,
            config.chain.rpc_url.clone(),
            config.chain.deployer_private_key.clone(),
            config.service_fee_wallet.clone(),
        )))
    };

    let engine = Arc::new(CrossChainEngine::new(store.clone(), router));
    let deal_service = Arc::new(DealService::new(
        store.clone(),
        users.clone(),
        engine.clone(),
        deployer,
    ));

    let scheduler = chain.clone().map(|chain| {
        Arc::new(DeadlineScheduler::new(
            store.clone(),
            Some(chain),
            engine.clone(),
            config.scheduler.clone(),
        ))
    });

    Ok(ServiceContext {
        store,
        users,
        verifier,
        engine,
        deal_service,
        scheduler,
    })
}

fn offline_users() -> Vec<User> {
    vec![
        User {
            id: "buyer-1".to_string(),
            email: "buyer@example.com".to_string(),
            display_name: Some("Offline Buyer".to_string()),
        },
        User {
            id: "seller-1".to_string(),
            email: "seller@example.com".to_string(),
            display_name: Some("Offline Seller".to_string()),
        },
    ]
}
