//! Model Orchestrator (spec §4.5): one in-process worker task per
//! `(model, side)`, idempotent spawn/stop keyed on `buy-{modelId}`/
//! `sell-{modelId}`, strategy resolution, decision persistence, and
//! batched order enqueueing.
//!
//! Grounded on `main.rs`'s `tokio::spawn`-per-task-with-shutdown-flag
//! idiom, generalized per spec §9 DESIGN NOTES into a `WorkerSupervisor`
//! that replaces the original container-runtime spawn/stop with
//! in-process tasks carrying the same "exactly one active worker per
//! enabled (model,side)" contract.

use crate::algo::AlgoEngine;
use crate::domain::{DecisionStatus, Model, Portfolio, Side, Signal, StrategyDecision, StrategyType};
use crate::exchange::rest::Credentials;
use crate::llm::GenerationConfig;
use crate::persistence::Db;
use crate::strategy::{validate_decisions, StrategyExecutor, ValidatedDecision};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

const FORCED_STOP_GRACE: Duration = Duration::from_secs(30);
const DEFAULT_CYCLE_FALLBACK_SECS: u64 = 30;

pub struct OrchestratorContext {
    pub db: Db,
    pub strategy_executor: Arc<StrategyExecutor>,
    pub algo_engine: Arc<AlgoEngine>,
}

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    abort: AbortHandle,
    task: JoinHandle<()>,
}

pub struct WorkerSupervisor {
    ctx: Arc<OrchestratorContext>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerSupervisor {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles one model's workers against its `auto_*_enabled` flags.
    /// Idempotent: spawning an already-running worker and stopping an
    /// already-stopped one are both no-ops.
    pub async fn reconcile(&self, model: &Model) {
        self.set_worker(&model.id, StrategyType::Buy, model.auto_buy_enabled).await;
        self.set_worker(&model.id, StrategyType::Sell, model.auto_sell_enabled).await;
    }

    /// Reconciles every model's workers, and stops workers for models that
    /// no longer exist (e.g. `delete_model` ran out from under a running
    /// worker).
    pub async fn reconcile_all(&self) -> anyhow::Result<()> {
        let models = self.ctx.db.list_models().await?;
        for model in &models {
            self.reconcile(model).await;
        }

        let present: HashSet<&str> = models.iter().map(|m| m.id.as_str()).collect();
        let mut workers = self.workers.lock().await;
        let stale: Vec<String> = workers
            .keys()
            .filter(|key| !present.contains(model_id_of(key)))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = workers.remove(&key) {
                info!(worker = %key, "stopping_worker_for_deleted_model");
                tokio::spawn(graceful_stop(key, handle));
            }
        }
        Ok(())
    }

    async fn set_worker(&self, model_id: &str, side: StrategyType, enabled: bool) {
        let key = worker_key(model_id, side);
        let mut workers = self.workers.lock().await;
        let running = workers.contains_key(&key);
        match (running, enabled) {
            (false, true) => {
                let (tx, rx) = watch::channel(false);
                let ctx = self.ctx.clone();
                let model_id = model_id.to_string();
                let task = tokio::spawn(run_worker(ctx, model_id, side, rx));
                workers.insert(
                    key.clone(),
                    WorkerHandle {
                        shutdown: tx,
                        abort: task.abort_handle(),
                        task,
                    },
                );
                info!(worker = %key, "worker_spawned");
            }
            (true, false) => {
                if let Some(handle) = workers.remove(&key) {
                    info!(worker = %key, "worker_stop_requested");
                    tokio::spawn(graceful_stop(key, handle));
                }
            }
            _ => {}
        }
    }
}

async fn graceful_stop(key: String, handle: WorkerHandle) {
    let _ = handle.shutdown.send(true);
    if tokio::time::timeout(FORCED_STOP_GRACE, handle.task).await.is_err() {
        warn!(worker = %key, "worker_forced_stop_after_grace_period");
        handle.abort.abort();
    }
}

fn worker_key(model_id: &str, side: StrategyType) -> String {
    match side {
        StrategyType::Buy => format!("buy-{model_id}"),
        StrategyType::Sell => format!("sell-{model_id}"),
    }
}

fn model_id_of(key: &str) -> &str {
    key.splitn(2, '-').nth(1).unwrap_or("")
}

async fn run_worker(ctx: Arc<OrchestratorContext>, model_id: String, side: StrategyType, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let sleep_secs = match run_cycle(&ctx, &model_id, side).await {
            Ok(secs) => secs,
            Err(e) => {
                error!(model_id = %model_id, side = ?side, error = %e, "worker_cycle_failed");
                DEFAULT_CYCLE_FALLBACK_SECS
            }
        };
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }
    }
}

/// One cooperative cycle of spec §4.5 steps 1-6. Returns the
/// `batch_execution_interval` to sleep for (step 7).
async fn run_cycle(ctx: &OrchestratorContext, model_id: &str, side: StrategyType) -> anyhow::Result<u64> {
    let Some(model) = ctx.db.get_model(model_id).await? else {
        return Ok(DEFAULT_CYCLE_FALLBACK_SECS);
    };
    let enabled = match side {
        StrategyType::Buy => model.auto_buy_enabled,
        StrategyType::Sell => model.auto_sell_enabled,
    };
    if !enabled {
        return Ok(DEFAULT_CYCLE_FALLBACK_SECS);
    }

    let Some(creds) = model.api_credentials.as_deref().and_then(parse_credentials) else {
        warn!(model_id, "worker_missing_credentials_skipping_cycle");
        let batch = batch_config_for(&model, side);
        return Ok(batch.batch_execution_interval_secs as u64);
    };

    let candidate_symbols = ctx.strategy_executor.build_candidates(&model).await?;
    let positions = ctx.strategy_executor.build_positions(&model_id).await?;
    let strategies = ctx.db.strategies_for_model(model_id, side).await?;

    let default_leverage = if model.leverage == 0 { 1 } else { model.leverage };
    let mut decided_symbols: HashSet<String> = HashSet::new();
    let mut decisions: Vec<(String, ValidatedDecision)> = Vec::new();

    for strategy in &strategies {
        let allowed_symbols: Vec<String> = match side {
            StrategyType::Buy => candidate_symbols
                .iter()
                .filter(|s| !decided_symbols.contains(*s))
                .cloned()
                .collect(),
            StrategyType::Sell => positions
                .iter()
                .map(|p| p.symbol.clone())
                .filter(|s| !decided_symbols.contains(s))
                .collect(),
        };
        if allowed_symbols.is_empty() {
            continue;
        }

        let metadata = parse_metadata(&strategy.metadata);
        let raw = if metadata.backend.as_deref() == Some("llm") {
            let Some(provider) = ctx.db.get_provider(&model.provider_id).await? else {
                warn!(model_id, strategy = %strategy.name, "strategy_disabled_missing_provider");
                continue;
            };
            let system_text = metadata.system_prompt.unwrap_or_default();
            let user_prompt = render_user_prompt(&strategy.program_text, &allowed_symbols, &positions);
            ctx.strategy_executor
                .evaluate_llm_backed(&model, &provider, &strategy.id, &system_text, &user_prompt, &GenerationConfig::default())
                .await
        } else {
            ctx.strategy_executor.evaluate_program_supplied(&strategy.program_text)
        };

        let raw = match raw {
            Ok(r) => r,
            Err(e) => {
                warn!(model_id, strategy = %strategy.name, error = %e, "strategy_compile_failed_disabled_for_cycle");
                continue;
            }
        };

        for validated in validate_decisions(&raw, &allowed_symbols, default_leverage) {
            decided_symbols.insert(validated.symbol.clone());
            decisions.push((strategy.name.clone(), validated));
        }
    }

    if side == StrategyType::Buy {
        enforce_max_positions(&model, &positions, &mut decisions);
    }

    let batch = batch_config_for(&model, side);
    decisions.truncate(batch.batch_size as usize);

    for group in decisions.chunks(batch.batch_execution_group_size.max(1) as usize) {
        for (strategy_name, decision) in group {
            if let Err(e) = persist_and_execute(ctx, &model, side, strategy_name, decision, &creds).await {
                error!(model_id, symbol = %decision.symbol, error = %e, "decision_execution_failed");
            }
        }
        if group.len() == batch.batch_execution_group_size.max(1) as usize {
            tokio::time::sleep(Duration::from_secs(batch.batch_execution_interval_secs as u64)).await;
        }
    }

    Ok(batch.batch_execution_interval_secs as u64)
}

/// Drops buy-side decisions that would open a brand-new `(symbol, side)`
/// `Portfolio` row beyond `model.max_positions` (DESIGN.md: LONG and SHORT
/// on the same symbol count as two positions toward the cap). Decisions
/// that only add to an already-open row never count against the cap.
fn enforce_max_positions(
    model: &Model,
    positions: &[Portfolio],
    decisions: &mut Vec<(String, ValidatedDecision)>,
) {
    let max = model.max_positions as usize;
    let mut open: HashSet<(String, Side)> = positions.iter().map(|p| (p.symbol.clone(), p.side)).collect();
    let mut open_count = open.len();

    decisions.retain(|(_, decision)| {
        let target_side = match decision.signal {
            Signal::BuyToLong => Side::Long,
            Signal::BuyToShort => Side::Short,
            _ => return true,
        };
        let key = (decision.symbol.clone(), target_side);
        if open.contains(&key) {
            return true;
        }
        if open_count >= max {
            warn!(
                model_id = %model.id,
                symbol = %decision.symbol,
                max_positions = model.max_positions,
                "decision_dropped_max_positions_reached"
            );
            return false;
        }
        open.insert(key);
        open_count += 1;
        true
    });
}

async fn persist_and_execute(
    ctx: &OrchestratorContext,
    model: &Model,
    side: StrategyType,
    strategy_name: &str,
    decision: &ValidatedDecision,
    creds: &Credentials,
) -> anyhow::Result<()> {
    let decision_id = Uuid::new_v4().to_string();
    ctx.db
        .insert_strategy_decision(&StrategyDecision {
            id: decision_id.clone(),
            model_id: model.id.clone(),
            strategy_name: strategy_name.to_string(),
            strategy_type: side,
            signal: decision.signal,
            symbol: decision.symbol.clone(),
            quantity: decision.quantity,
            leverage: decision.leverage,
            price: decision.price,
            stop_price: decision.stop_price,
            justification: decision.justification.clone(),
            status: DecisionStatus::Triggered,
            created_at: chrono::Utc::now(),
            trade_id: None,
            error_reason: None,
        })
        .await?;

    ctx.algo_engine.execute_decision(&model.id, creds, &decision_id, decision).await
}

fn batch_config_for(model: &Model, side: StrategyType) -> crate::domain::BatchConfig {
    match side {
        StrategyType::Buy => model.buy_batch.clone(),
        StrategyType::Sell => model.sell_batch.clone(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StrategyMetadata {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
}

/// Strategy rows don't carry a dedicated "backend" column; the LLM-backed
/// vs. program-supplied split (spec §4.6) is read from the strategy's
/// `metadata` JSON (`{"backend":"llm","system_prompt":"..."}`). Absent or
/// unrecognized metadata defaults to program-supplied, treating
/// `program_text` as the literal decision program.
fn parse_metadata(raw: &Option<String>) -> StrategyMetadata {
    raw.as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct StoredCredentials {
    api_key: String,
    api_secret: String,
}

fn parse_credentials(raw: &str) -> Option<Credentials> {
    let parsed: StoredCredentials = serde_json::from_str(raw).ok()?;
    Some(Credentials {
        api_key: parsed.api_key,
        api_secret: parsed.api_secret,
    })
}

fn render_user_prompt(template: &str, candidates: &[String], positions: &[Portfolio]) -> String {
    let candidates_json = serde_json::to_string(candidates).unwrap_or_default();
    let positions_json = serde_json::to_string(positions).unwrap_or_default();
    format!("{template}\n\nCANDIDATES: {candidates_json}\n\nPOSITIONS: {positions_json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_key_format() {
        assert_eq!(worker_key("m1", StrategyType::Buy), "buy-m1");
        assert_eq!(worker_key("m1", StrategyType::Sell), "sell-m1");
    }

    #[test]
    fn model_id_of_extracts_suffix() {
        assert_eq!(model_id_of("buy-m1"), "m1");
        assert_eq!(model_id_of("sell-model-with-dash"), "model-with-dash");
    }

    #[test]
    fn metadata_defaults_to_program_supplied() {
        let m = parse_metadata(&None);
        assert_eq!(m.backend, None);
        let m2 = parse_metadata(&Some("not json".to_string()));
        assert_eq!(m2.backend, None);
    }

    #[test]
    fn metadata_recognizes_llm_backend() {
        let m = parse_metadata(&Some(r#"{"backend":"llm","system_prompt":"be concise"}"#.to_string()));
        assert_eq!(m.backend.as_deref(), Some("llm"));
        assert_eq!(m.system_prompt.as_deref(), Some("be concise"));
    }

    #[test]
    fn credentials_roundtrip() {
        let c = parse_credentials(r#"{"api_key":"k","api_secret":"s"}"#).unwrap();
        assert_eq!(c.api_key, "k");
        assert_eq!(c.api_secret, "s");
    }

    fn sample_model(max_positions: u32) -> Model {
        use crate::domain::{BatchConfig, SymbolSource};
        Model {
            id: "m1".into(),
            display_name: "m".into(),
            provider_id: "p".into(),
            provider_model_name: "gpt".into(),
            initial_capital: 1000.0,
            leverage: 1,
            max_positions,
            api_credentials: None,
            auto_buy_enabled: true,
            auto_sell_enabled: true,
            auto_close_percent: None,
            base_volume_filter: None,
            symbol_source: SymbolSource::Leaderboard,
            buy_batch: BatchConfig::default(),
            sell_batch: BatchConfig::default(),
            created_at: chrono::Utc::now(),
        }
    }

    fn sample_decision(symbol: &str, signal: Signal) -> ValidatedDecision {
        ValidatedDecision {
            symbol: symbol.into(),
            signal,
            quantity: 1.0,
            leverage: 1,
            price: None,
            stop_price: None,
            justification: None,
        }
    }

    fn sample_position(symbol: &str, side: Side) -> Portfolio {
        Portfolio {
            model_id: "m1".into(),
            symbol: symbol.into(),
            side,
            quantity: 1.0,
            avg_entry_price: 100.0,
            initial_margin: 10.0,
            leverage: 1,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn drops_new_position_decisions_once_cap_reached() {
        let model = sample_model(1);
        let positions = vec![sample_position("BTCUSDT", Side::Long)];
        let mut decisions = vec![(
            "s1".to_string(),
            sample_decision("ETHUSDT", Signal::BuyToLong),
        )];
        enforce_max_positions(&model, &positions, &mut decisions);
        assert!(decisions.is_empty());
    }

    #[test]
    fn allows_decisions_adding_to_already_open_position() {
        let model = sample_model(1);
        let positions = vec![sample_position("BTCUSDT", Side::Long)];
        let mut decisions = vec![(
            "s1".to_string(),
            sample_decision("BTCUSDT", Signal::BuyToLong),
        )];
        enforce_max_positions(&model, &positions, &mut decisions);
        assert_eq!(decisions.len(), 1);
    }

    #[test]
    fn counts_long_and_short_on_same_symbol_as_two_positions() {
        let model = sample_model(1);
        let positions = vec![sample_position("BTCUSDT", Side::Long)];
        let mut decisions = vec![(
            "s1".to_string(),
            sample_decision("BTCUSDT", Signal::BuyToShort),
        )];
        enforce_max_positions(&model, &positions, &mut decisions);
        assert!(decisions.is_empty());
    }

    #[test]
    fn admits_new_positions_up_to_remaining_capacity() {
        let model = sample_model(2);
        let positions = vec![sample_position("BTCUSDT", Side::Long)];
        let mut decisions = vec![
            ("s1".to_string(), sample_decision("ETHUSDT", Signal::BuyToLong)),
            ("s1".to_string(), sample_decision("SOLUSDT", Signal::BuyToLong)),
        ];
        enforce_max_positions(&model, &positions, &mut decisions);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].1.symbol, "ETHUSDT");
    }
}
