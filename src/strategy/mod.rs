//! Strategy Executor (spec §4.6): candidate/position set construction,
//! strategy compile+cache+invoke for both execution backends, and decision
//! validation.
//!
//! Grounded on `vault/llm.rs`'s `parse_decision_dsl`/`ParsedDecisionDsl`
//! (strict DSL parsing, clamping) generalized to the candidate-set-producing
//! decision list spec §4.6 requires; the compile/cache split mirrors the
//! "compiled once per (strategy, model)" contract literally — the LLM call
//! happens at most once per (strategy, model) pair, while validation against
//! the live candidate/position set happens on every invocation.

pub mod dsl;

use crate::domain::{Model, Portfolio, Provider, Signal};
use crate::error::CoreError;
use crate::llm::{GenerationConfig, LlmDispatcher};
use crate::persistence::Db;
use dsl::RawDecision;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

const LEADERBOARD_CANDIDATE_LIMIT: usize = 20;

/// A decision that survived validation (spec §4.6) and is ready for the
/// Algo-Order Engine.
#[derive(Debug, Clone)]
pub struct ValidatedDecision {
    pub symbol: String,
    pub signal: Signal,
    pub quantity: f64,
    pub leverage: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub justification: Option<String>,
}

pub struct StrategyExecutor {
    db: Db,
    llm: LlmDispatcher,
    cache: Mutex<HashMap<String, Vec<RawDecision>>>,
}

impl StrategyExecutor {
    pub fn new(db: Db, llm: LlmDispatcher) -> Self {
        Self {
            db,
            llm,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Buy-side candidate set (spec §4.6): leaderboard top gainers filtered
    /// by `base_volume_filter`, or the tracked `futures` table symbols.
    pub async fn build_candidates(&self, model: &Model) -> anyhow::Result<Vec<String>> {
        use crate::domain::SymbolSource;
        match model.symbol_source {
            SymbolSource::Leaderboard => {
                let tickers = self
                    .db
                    .top_gainers(LEADERBOARD_CANDIDATE_LIMIT, model.base_volume_filter)
                    .await?;
                Ok(tickers.into_iter().map(|t| t.symbol).collect())
            }
            SymbolSource::Future => {
                let futures = self.db.list_futures().await?;
                Ok(futures.into_iter().map(|f| f.symbol).collect())
            }
        }
    }

    /// Sell-side position set (spec §4.6): every open portfolio row.
    pub async fn build_positions(&self, model_id: &str) -> anyhow::Result<Vec<Portfolio>> {
        self.db.list_portfolios_for_model(model_id).await
    }

    /// Compile (if not already cached) and return an LLM-backed strategy's
    /// decision list. The LLM is called at most once per `(strategy, model)`
    /// for the process lifetime; later cycles reuse the cached program and
    /// re-validate it against the then-current candidate/position set.
    pub async fn evaluate_llm_backed(
        &self,
        model: &Model,
        provider: &Provider,
        strategy_id: &str,
        system_text: &str,
        user_prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Vec<RawDecision>, CoreError> {
        let cache_key = format!("{strategy_id}:{}", model.id);
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&cache_key) {
                return Ok(cached.clone());
            }
        }

        let code = self
            .llm
            .generate_strategy_code(
                provider.provider_type,
                &provider.normalized_base_url(),
                &provider.api_key,
                &model.provider_model_name,
                system_text,
                user_prompt,
                config,
            )
            .await?;

        let decisions = dsl::parse_decision_program(&code)
            .map_err(|e| CoreError::ValidationFailed(format!("strategy compile failed: {e}")))?;

        self.cache.lock().await.insert(cache_key, decisions.clone());
        Ok(decisions)
    }

    /// Program-supplied strategies compile directly from the stored text
    /// (spec §4.6) — no LLM round trip, so no cross-cycle cache is needed.
    pub fn evaluate_program_supplied(&self, program_text: &str) -> Result<Vec<RawDecision>, CoreError> {
        dsl::parse_decision_program(program_text)
            .map_err(|e| CoreError::ValidationFailed(format!("strategy compile failed: {e}")))
    }

    /// Drops a strategy's cached LLM-generated program, forcing a fresh
    /// compile on the next `evaluate_llm_backed` call (e.g. after an operator
    /// edits the strategy's prompt template).
    pub async fn invalidate_cache(&self, strategy_id: &str, model_id: &str) {
        self.cache
            .lock()
            .await
            .remove(&format!("{strategy_id}:{model_id}"));
    }
}

/// Validation rules of spec §4.6: unknown signal → drop; quantity ≤ 0 →
/// drop; leverage outside [1,125] → clamp to `default_leverage`; symbol not
/// in `allowed_symbols` → drop. Dropped decisions are logged, not returned.
pub fn validate_decisions(
    raw: &[RawDecision],
    allowed_symbols: &[String],
    default_leverage: u32,
) -> Vec<ValidatedDecision> {
    let mut out = Vec::new();
    for d in raw {
        let Some(signal) = Signal::parse(&d.raw_signal) else {
            warn!(signal = %d.raw_signal, symbol = %d.symbol, "decision_dropped_unknown_signal");
            continue;
        };
        if d.quantity <= 0.0 {
            warn!(symbol = %d.symbol, quantity = d.quantity, "decision_dropped_nonpositive_quantity");
            continue;
        }
        if !allowed_symbols.iter().any(|s| s.eq_ignore_ascii_case(&d.symbol)) {
            warn!(symbol = %d.symbol, "decision_dropped_unrecognized_symbol");
            continue;
        }
        let leverage = match d.leverage {
            Some(l) if (1..=125).contains(&l) => l,
            Some(l) => {
                warn!(symbol = %d.symbol, leverage = l, "decision_leverage_clamped_to_default");
                default_leverage
            }
            None => default_leverage,
        };

        out.push(ValidatedDecision {
            symbol: d.symbol.clone(),
            signal,
            quantity: d.quantity,
            leverage,
            price: d.price,
            stop_price: d.stop_price,
            justification: d.justification.clone(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(symbol: &str, signal: &str, qty: f64, leverage: Option<u32>) -> RawDecision {
        RawDecision {
            symbol: symbol.to_string(),
            raw_signal: signal.to_string(),
            quantity: qty,
            leverage,
            price: None,
            stop_price: None,
            justification: None,
        }
    }

    #[test]
    fn drops_unknown_signal_and_nonpositive_quantity_and_unrecognized_symbol() {
        let allowed = vec!["BTCUSDT".to_string()];
        let raws = vec![
            raw("BTCUSDT", "buy_to_the_moon", 1.0, None),
            raw("BTCUSDT", "buy_to_long", 0.0, None),
            raw("ETHUSDT", "buy_to_long", 1.0, None),
            raw("BTCUSDT", "buy_to_long", 1.0, None),
        ];
        let validated = validate_decisions(&raws, &allowed, 10);
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].symbol, "BTCUSDT");
    }

    #[test]
    fn clamps_out_of_range_leverage_to_default() {
        let allowed = vec!["BTCUSDT".to_string()];
        let raws = vec![raw("BTCUSDT", "buy_to_long", 1.0, Some(200))];
        let validated = validate_decisions(&raws, &allowed, 10);
        assert_eq!(validated[0].leverage, 10);
    }

    #[test]
    fn keeps_in_range_leverage_as_is() {
        let allowed = vec!["BTCUSDT".to_string()];
        let raws = vec![raw("BTCUSDT", "buy_to_long", 1.0, Some(25))];
        let validated = validate_decisions(&raws, &allowed, 10);
        assert_eq!(validated[0].leverage, 25);
    }
}
