//! Automated perpetual-futures trading platform: ingests market data,
//! runs per-model strategy workers, and actuates orders against a
//! single derivatives exchange, fronted by a thin HTTP façade.

mod algo;
mod config;
mod domain;
mod error;
mod exchange;
mod http;
mod ingestor;
mod klines;
mod liquidation;
mod llm;
mod middleware;
mod orchestrator;
mod persistence;
mod scheduler;
mod strategy;

use crate::algo::AlgoEngine;
use crate::config::Config;
use crate::exchange::rest::Credentials;
use crate::exchange::ExchangeGateway;
use crate::http::AppState;
use crate::ingestor::Ingestor;
use crate::klines::KlineStreamManager;
use crate::liquidation::LiquidationLoop;
use crate::llm::LlmDispatcher;
use crate::orchestrator::{OrchestratorContext, WorkerSupervisor};
use crate::persistence::Db;
use crate::scheduler::SchedulerFabric;
use crate::strategy::StrategyExecutor;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BINANCE_REST_BASE: &str = "https://fapi.binance.com";
const BINANCE_WS_BASE: &str = "wss://fstream.binance.com";
const CREDENTIALS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const KLINE_INTERVALS: [&str; 7] = ["1m", "5m", "15m", "1h", "4h", "1d", "1w"];

/// Overrides `Config::from_env`'s corresponding env var, same as the
/// teacher's `bin/dataset_inspect.rs` CLI flags do for its own config.
#[derive(Parser, Debug)]
#[command(name = "futurepilot", about = "Automated perpetual-futures trading platform")]
struct Cli {
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,
    #[arg(long, env = "PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("failed to load configuration")?;
    if let Some(p) = cli.database_path {
        config.database_path = p;
    }
    if let Some(p) = cli.http_port {
        config.http_port = p;
    }

    info!(database_path = %config.database_path, http_port = config.http_port, "starting futurepilot-core");

    let db = Db::open(&config.database_path).context("failed to open database")?;
    db.migrate().await.context("failed to run migrations")?;

    let exchange = Arc::new(ExchangeGateway::new(BINANCE_REST_BASE, BINANCE_WS_BASE));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let credentials_cache: Arc<SyncRwLock<HashMap<String, Credentials>>> = Arc::new(SyncRwLock::new(HashMap::new()));
    refresh_credentials_cache(&db, &credentials_cache).await?;
    spawn_credentials_refresh(db.clone(), credentials_cache.clone(), shutdown_rx.clone());

    let ingestor = Arc::new(Ingestor::new(db.clone(), exchange.clone()));
    tokio::spawn(ingestor.clone().run(shutdown_rx.clone()));

    let kline_manager = Arc::new(KlineStreamManager::new(exchange.clone()));
    reconcile_kline_subscriptions(&db, &kline_manager).await?;

    let scheduler = SchedulerFabric::new();
    spawn_scheduled_jobs(&scheduler, &config, &db, &ingestor, &kline_manager, &shutdown_rx)?;

    let llm = LlmDispatcher::new();
    let strategy_executor = Arc::new(StrategyExecutor::new(db.clone(), llm));
    let algo_engine = Arc::new(AlgoEngine::new(db.clone(), exchange.clone()));
    let orchestrator_ctx = Arc::new(OrchestratorContext {
        db: db.clone(),
        strategy_executor,
        algo_engine: algo_engine.clone(),
    });
    let supervisor = Arc::new(WorkerSupervisor::new(orchestrator_ctx));
    supervisor.reconcile_all().await.context("initial worker reconcile failed")?;

    {
        let cache = credentials_cache.clone();
        let lookup = move |model_id: &str| cache.read().get(model_id).cloned();
        tokio::spawn(algo_engine.clone().run_supervisor(lookup, shutdown_rx.clone()));
    }

    {
        let liquidation = Arc::new(LiquidationLoop::new(db.clone(), exchange.clone()));
        let cache = credentials_cache.clone();
        let lookup = move |model_id: &str| cache.read().get(model_id).cloned();
        tokio::spawn(liquidation.run(config.auto_liquidation_scan_interval_secs, lookup, shutdown_rx.clone()));
    }

    let app_state = AppState { db: db.clone(), supervisor: supervisor.clone() };
    let app = crate::http::router(app_state);
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind HTTP listener")?;
    info!(addr = %addr, "http facade listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("http server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    exchange.shutdown();
    Ok(())
}

/// Loads every model's stored credentials into an in-process cache so the
/// Algo-Order Engine and Auto-Liquidation Loop's `creds_lookup` closures
/// (plain synchronous `Fn`, not async) never need to touch the DB inline.
async fn refresh_credentials_cache(db: &Db, cache: &SyncRwLock<HashMap<String, Credentials>>) -> Result<()> {
    let models = db.list_models().await?;
    let mut fresh = HashMap::with_capacity(models.len());
    for model in &models {
        if let Some(creds) = model.api_credentials.as_deref().and_then(parse_credentials) {
            fresh.insert(model.id.clone(), creds);
        }
    }
    *cache.write() = fresh;
    Ok(())
}

fn spawn_credentials_refresh(db: Db, cache: Arc<SyncRwLock<HashMap<String, Credentials>>>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CREDENTIALS_REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => { if *shutdown.borrow() { return; } }
                _ = ticker.tick() => {
                    if let Err(e) = refresh_credentials_cache(&db, &cache).await {
                        error!(error = %e, "credentials_cache_refresh_failed");
                    }
                }
            }
        }
    });
}

fn parse_credentials(raw: &str) -> Option<Credentials> {
    #[derive(serde::Deserialize)]
    struct Stored {
        api_key: String,
        api_secret: String,
    }
    let parsed: Stored = serde_json::from_str(raw).ok()?;
    Some(Credentials { api_key: parsed.api_key, api_secret: parsed.api_secret })
}

/// Kline subscriptions are driven by the tracked `futures` table across
/// every interval spec §4.3 names.
async fn reconcile_kline_subscriptions(db: &Db, manager: &KlineStreamManager) -> Result<()> {
    let futures = db.list_futures().await?;
    let desired: Vec<(String, String)> = futures
        .iter()
        .flat_map(|f| KLINE_INTERVALS.iter().map(move |i| (f.symbol.clone(), i.to_string())))
        .collect();
    manager.reconcile(&desired).await;
    Ok(())
}

fn spawn_scheduled_jobs(
    scheduler: &SchedulerFabric,
    config: &Config,
    db: &Db,
    ingestor: &Arc<Ingestor>,
    kline_manager: &Arc<KlineStreamManager>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Result<()> {
    {
        let ingestor = ingestor.clone();
        scheduler.spawn_cron_job("price_refresh", &config.price_refresh_cron, shutdown_rx.clone(), move || {
            let ingestor = ingestor.clone();
            async move { ingestor.refresh_open_prices().await }
        })?;
    }
    {
        let ingestor = ingestor.clone();
        let retention_days = config.kline_cleanup_retention_days;
        scheduler.spawn_cron_job("ticker_cleanup", &config.kline_cleanup_cron, shutdown_rx.clone(), move || {
            let ingestor = ingestor.clone();
            async move { ingestor.cleanup_old_tickers(retention_days).await }
        })?;
    }
    {
        let db = db.clone();
        let retention_days = config.strategy_decision_purge_retention_days;
        scheduler.spawn_cron_job(
            "strategy_decision_purge",
            &config.strategy_decision_purge_cron,
            shutdown_rx.clone(),
            move || {
                let db = db.clone();
                async move {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                    db.delete_old_decisions(cutoff).await.map(|_| ())
                }
            },
        )?;
    }
    {
        let kline_manager = kline_manager.clone();
        let unhealthy_after = Duration::from_secs(config.kline_sync_check_interval_secs.max(1) * 3);
        scheduler.spawn_interval_job(
            "kline_health_check",
            Duration::from_secs(config.kline_sync_check_interval_secs),
            shutdown_rx.clone(),
            move || {
                let kline_manager = kline_manager.clone();
                async move {
                    kline_manager.health_check_and_rotate(unhealthy_after).await;
                    Ok(())
                }
            },
        );
    }
    {
        let db = db.clone();
        let kline_manager = kline_manager.clone();
        scheduler.spawn_interval_job(
            "kline_subscription_sync",
            Duration::from_secs(config.kline_sync_check_interval_secs.max(1) * 6),
            shutdown_rx.clone(),
            move || {
                let db = db.clone();
                let kline_manager = kline_manager.clone();
                async move { reconcile_kline_subscriptions(&db, &kline_manager).await }
            },
        );
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "futurepilot_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
