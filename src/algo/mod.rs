//! Algo-Order Engine and trade execution (spec §4.7): immediate vs
//! conditional order paths, the AlgoOrder/StrategyDecision state machines,
//! the supervisor loop, and per-`(model,symbol)` mutex serialization.
//!
//! Grounded on `vault/execution.rs` (`OrderAck` shape, fee-aware pnl
//! accounting) and `vault/trade_executor.rs` (decision → order → trade
//! recording flow), adapted from Polymarket CLOB settlement to Binance
//! futures MARKET/STOP_MARKET/TAKE_PROFIT_MARKET semantics.

use crate::domain::{
    AlgoOrder, AlgoStatus, AlgoType, DecisionStatus, Side, Signal, Trade, TradeSide,
};
use crate::exchange::rest::{Credentials, OrderSide, OrderSpec, OrderType, PositionSide};
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::persistence::Db;
use crate::strategy::ValidatedDecision;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Binance USDT-M futures taker fee rate used to compute realized pnl for
/// the simulated fills this engine produces.
const TAKER_FEE_RATE: f64 = 0.0004;
const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct AlgoEngine {
    db: Db,
    exchange: Arc<ExchangeGateway>,
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl AlgoEngine {
    pub fn new(db: Db, exchange: Arc<ExchangeGateway>) -> Self {
        Self {
            db,
            exchange,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, model_id: &str, symbol: &str) -> Arc<Mutex<()>> {
        let key = (model_id.to_string(), symbol.to_string());
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Executes one validated decision (spec §4.7): persists the
    /// `StrategyDecision` as `TRIGGERED`, routes to the immediate or
    /// conditional path, then transitions it to `EXECUTED`/`REJECTED`.
    /// Serialized per `(model, symbol)` via the keyed mutex.
    pub async fn execute_decision(
        &self,
        model_id: &str,
        creds: &Credentials,
        decision_id: &str,
        decision: &ValidatedDecision,
    ) -> anyhow::Result<()> {
        let lock = self.lock_for(model_id, &decision.symbol).await;
        let _guard = lock.lock().await;

        let is_conditional = matches!(decision.signal, Signal::StopLoss | Signal::TakeProfit)
            || decision.stop_price.is_some();

        let outcome = if is_conditional {
            self.submit_conditional(model_id, creds, decision_id, decision)
                .await
        } else {
            self.submit_immediate(model_id, creds, decision)
                .await
        };

        match outcome {
            Ok(trade_id) => {
                self.db
                    .update_strategy_decision_status(decision_id, DecisionStatus::Executed, trade_id.as_deref(), None)
                    .await?;
            }
            Err(e) => {
                warn!(decision_id, error = %e, "decision_rejected");
                self.db
                    .update_strategy_decision_status(decision_id, DecisionStatus::Rejected, None, Some(&e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn submit_immediate(
        &self,
        model_id: &str,
        creds: &Credentials,
        decision: &ValidatedDecision,
    ) -> Result<Option<String>, ExchangeError> {
        let (order_side, position_side, closing) = match decision.signal {
            Signal::BuyToLong => (OrderSide::Buy, PositionSide::Long, false),
            Signal::BuyToShort => (OrderSide::Sell, PositionSide::Short, false),
            Signal::ClosePosition => {
                let (s, p) = self.resolve_closing_side(model_id, &decision.symbol).await;
                (s, p, true)
            }
            _ => unreachable!("non-immediate signal routed to submit_immediate"),
        };

        let spec = OrderSpec {
            symbol: decision.symbol.clone(),
            side: order_side,
            position_side,
            order_type: OrderType::Market,
            quantity: decision.quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
        };
        let ack = self.exchange.place_order(creds, &spec).await?;

        let domain_side = position_side_to_side(position_side);
        let trade_side = order_side_to_trade_side(order_side);
        let fee = ack.avg_price * ack.executed_qty * TAKER_FEE_RATE;

        let pnl = if closing {
            let existing = self
                .db
                .get_portfolio(model_id, &decision.symbol, domain_side)
                .await
                .ok()
                .flatten();
            existing.map(|p| close_pnl(domain_side, p.avg_entry_price, ack.avg_price, ack.executed_qty, fee))
        } else {
            None
        };

        let trade_id = Uuid::new_v4().to_string();
        self.db
            .insert_trade(&Trade {
                id: trade_id.clone(),
                model_id: model_id.to_string(),
                symbol: decision.symbol.clone(),
                side: trade_side,
                signal: decision.signal,
                quantity: ack.executed_qty,
                price: ack.avg_price,
                fee,
                pnl,
                timestamp: chrono::Utc::now(),
            })
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        self.apply_fill_to_portfolio(
            model_id,
            &decision.symbol,
            domain_side,
            closing,
            ack.executed_qty,
            ack.avg_price,
            decision.leverage,
        )
        .await
        .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        Ok(Some(trade_id))
    }

    async fn submit_conditional(
        &self,
        model_id: &str,
        creds: &Credentials,
        decision_id: &str,
        decision: &ValidatedDecision,
    ) -> Result<Option<String>, ExchangeError> {
        let trigger_price = decision
            .stop_price
            .or(decision.price)
            .ok_or_else(|| ExchangeError::PermanentApiError("conditional decision missing stop/trigger price".to_string()))?;

        let (order_side, position_side) = self.resolve_closing_side(model_id, &decision.symbol).await;
        let (order_type, algo_type) = match decision.signal {
            Signal::TakeProfit => (OrderType::TakeProfitMarket, AlgoType::TakeProfit),
            _ => (OrderType::StopMarket, AlgoType::Stop),
        };

        let spec = OrderSpec {
            symbol: decision.symbol.clone(),
            side: order_side,
            position_side,
            order_type,
            quantity: decision.quantity,
            price: None,
            stop_price: Some(trigger_price),
            time_in_force: None,
        };
        let ack = self.exchange.place_algo_order(creds, &spec).await?;

        let now = chrono::Utc::now();
        let algo_id = Uuid::new_v4().to_string();
        let client_algo_id = format!("algo-{algo_id}");
        self.db
            .insert_algo_order(&AlgoOrder {
                id: algo_id.clone(),
                external_algo_id: Some(ack.external_algo_id.to_string()),
                client_algo_id,
                algo_type,
                order_type: order_type_str(order_type).to_string(),
                symbol: decision.symbol.clone(),
                side: order_side_to_trade_side(order_side),
                position_side: position_side_to_side(position_side),
                quantity: decision.quantity,
                trigger_price,
                limit_price: None,
                status: AlgoStatus::New,
                model_id: model_id.to_string(),
                strategy_decision_id: Some(decision_id.to_string()),
                trade_id: None,
                error_reason: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        // Spec §9 decision: a fresh NEW algo for this (model, symbol) supersedes
        // older NEW algos for that pair, regardless of side or algo type.
        self.db
            .supersede_new_algo_orders(model_id, &decision.symbol, &algo_id)
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        // Conditional orders don't produce a trade until they fire; the
        // StrategyDecision still transitions to EXECUTED because the order
        // was accepted by the exchange (spec §4.7's "successful trade write"
        // reading extends to "successful order placement" for the
        // conditional path, since no trade exists yet to link).
        Ok(None)
    }

    /// Infers which side a close/stop/take-profit decision targets by
    /// checking for an open LONG row first, then SHORT (spec §9: favors the
    /// more conservative / already-decided reading for hedge-mode ambiguity).
    async fn resolve_closing_side(&self, model_id: &str, symbol: &str) -> (OrderSide, PositionSide) {
        if let Ok(Some(p)) = self.db.get_portfolio(model_id, symbol, Side::Long).await {
            if p.quantity != 0.0 {
                return (OrderSide::Sell, PositionSide::Long);
            }
        }
        (OrderSide::Buy, PositionSide::Short)
    }

    async fn apply_fill_to_portfolio(
        &self,
        model_id: &str,
        symbol: &str,
        side: Side,
        closing: bool,
        qty: f64,
        price: f64,
        leverage: u32,
    ) -> anyhow::Result<()> {
        let existing = self.db.get_portfolio(model_id, symbol, side).await?;

        if closing {
            let Some(p) = existing else { return Ok(()) };
            let remaining = (p.quantity - qty).max(0.0);
            let margin_fraction = if p.quantity > 0.0 { remaining / p.quantity } else { 0.0 };
            self.db
                .upsert_portfolio(&crate::domain::Portfolio {
                    model_id: model_id.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    quantity: remaining,
                    avg_entry_price: p.avg_entry_price,
                    initial_margin: p.initial_margin * margin_fraction,
                    leverage: p.leverage,
                    unrealized_pnl: 0.0,
                })
                .await?;
        } else {
            let notional = qty * price;
            let margin = notional / leverage.max(1) as f64;
            let (new_qty, new_avg, new_margin) = match existing {
                Some(p) => {
                    let total_qty = p.quantity + qty;
                    let weighted_avg = (p.avg_entry_price * p.quantity + price * qty) / total_qty;
                    (total_qty, weighted_avg, p.initial_margin + margin)
                }
                None => (qty, price, margin),
            };
            self.db
                .upsert_portfolio(&crate::domain::Portfolio {
                    model_id: model_id.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    quantity: new_qty,
                    avg_entry_price: new_avg,
                    initial_margin: new_margin,
                    leverage,
                    unrealized_pnl: 0.0,
                })
                .await?;
        }
        Ok(())
    }

    /// Background poll of every `NEW` AlgoOrder (spec §4.7 supervisor loop):
    /// defensive local trigger check against the latest ticker price, in
    /// case the exchange's own trigger hasn't fired yet.
    pub async fn run_supervisor(self: Arc<Self>, creds_lookup: impl Fn(&str) -> Option<Credentials> + Send + Sync + 'static, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SUPERVISOR_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once(&creds_lookup).await {
                        error!(error = %e, "algo_supervisor_scan_failed");
                    }
                }
            }
        }
    }

    async fn scan_once(&self, creds_lookup: &impl Fn(&str) -> Option<Credentials>) -> anyhow::Result<()> {
        let pending = self.db.list_all_new_algo_orders().await?;
        for algo in pending {
            let Some(ticker) = self.db.get_market_ticker(&algo.symbol).await? else {
                continue;
            };
            if !is_triggered(&algo, ticker.last_price) {
                continue;
            }
            let Some(creds) = creds_lookup(&algo.model_id) else {
                warn!(model_id = %algo.model_id, "algo_supervisor_missing_credentials");
                continue;
            };
            if let Err(e) = self.fire_algo(&algo, ticker.last_price, &creds).await {
                warn!(algo_id = %algo.id, error = %e, "algo_supervisor_fire_failed");
            }
        }
        Ok(())
    }

    async fn fire_algo(&self, algo: &AlgoOrder, last_price: f64, creds: &Credentials) -> anyhow::Result<()> {
        let lock = self.lock_for(&algo.model_id, &algo.symbol).await;
        let _guard = lock.lock().await;

        // Re-check status under the lock: another path may have superseded
        // or cancelled this algo order since the scan read it.
        let Some(current) = self.db.get_algo_order(&algo.id).await? else { return Ok(()) };
        if current.status != AlgoStatus::New {
            return Ok(());
        }

        let order_side = match algo.side {
            TradeSide::Buy => OrderSide::Buy,
            TradeSide::Sell => OrderSide::Sell,
        };
        let position_side = match algo.position_side {
            Side::Long => PositionSide::Long,
            Side::Short => PositionSide::Short,
        };
        let spec = OrderSpec {
            symbol: algo.symbol.clone(),
            side: order_side,
            position_side,
            order_type: OrderType::Market,
            quantity: algo.quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
        };
        let ack = self.exchange.place_order(creds, &spec).await?;
        let fee = ack.avg_price * ack.executed_qty * TAKER_FEE_RATE;

        let existing = self.db.get_portfolio(&algo.model_id, &algo.symbol, algo.position_side).await?;
        let pnl = existing
            .as_ref()
            .map(|p| close_pnl(algo.position_side, p.avg_entry_price, ack.avg_price, ack.executed_qty, fee));

        let trade_id = Uuid::new_v4().to_string();
        self.db
            .insert_trade(&Trade {
                id: trade_id.clone(),
                model_id: algo.model_id.clone(),
                symbol: algo.symbol.clone(),
                side: algo.side,
                signal: match algo.algo_type {
                    AlgoType::Stop => Signal::StopLoss,
                    AlgoType::TakeProfit => Signal::TakeProfit,
                },
                quantity: ack.executed_qty,
                price: ack.avg_price,
                fee,
                pnl,
                timestamp: chrono::Utc::now(),
            })
            .await?;

        self.apply_fill_to_portfolio(
            &algo.model_id,
            &algo.symbol,
            algo.position_side,
            true,
            ack.executed_qty,
            ack.avg_price,
            existing.map(|p| p.leverage).unwrap_or(1),
        )
        .await?;

        self.db.update_trade_id_and_status(&algo.id, &trade_id, AlgoStatus::Filled).await?;
        if let Some(decision_id) = &algo.strategy_decision_id {
            self.db
                .update_strategy_decision_status(decision_id, DecisionStatus::Executed, Some(&trade_id), None)
                .await?;
        }
        info!(algo_id = %algo.id, symbol = %algo.symbol, last_price, "algo_order_filled_locally");
        Ok(())
    }
}

/// STOP orders close a LONG when price falls to/through the trigger, and
/// close a SHORT when price rises to/through it; TAKE_PROFIT is the mirror
/// image (spec §4.7).
fn is_triggered(algo: &AlgoOrder, last_price: f64) -> bool {
    match (algo.algo_type, algo.position_side) {
        (AlgoType::Stop, Side::Long) => last_price <= algo.trigger_price,
        (AlgoType::Stop, Side::Short) => last_price >= algo.trigger_price,
        (AlgoType::TakeProfit, Side::Long) => last_price >= algo.trigger_price,
        (AlgoType::TakeProfit, Side::Short) => last_price <= algo.trigger_price,
    }
}

/// Closing pnl formulas (spec §4.7).
fn close_pnl(side: Side, entry_avg: f64, exit_price: f64, qty: f64, fee: f64) -> f64 {
    match side {
        Side::Long => (exit_price - entry_avg) * qty - fee,
        Side::Short => (entry_avg - exit_price) * qty - fee,
    }
}

fn position_side_to_side(p: PositionSide) -> Side {
    match p {
        PositionSide::Long => Side::Long,
        PositionSide::Short => Side::Short,
    }
}

fn order_side_to_trade_side(s: OrderSide) -> TradeSide {
    match s {
        OrderSide::Buy => TradeSide::Buy,
        OrderSide::Sell => TradeSide::Sell,
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn algo(algo_type: AlgoType, position_side: Side, trigger: f64) -> AlgoOrder {
        let now = chrono::Utc::now();
        AlgoOrder {
            id: "a1".into(),
            external_algo_id: None,
            client_algo_id: "c1".into(),
            algo_type,
            order_type: "STOP_MARKET".into(),
            symbol: "BTCUSDT".into(),
            side: TradeSide::Sell,
            position_side,
            quantity: 1.0,
            trigger_price: trigger,
            limit_price: None,
            status: AlgoStatus::New,
            model_id: "m1".into(),
            strategy_decision_id: None,
            trade_id: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn stop_triggers_below_for_long_above_for_short() {
        assert!(is_triggered(&algo(AlgoType::Stop, Side::Long, 100.0), 99.0));
        assert!(!is_triggered(&algo(AlgoType::Stop, Side::Long, 100.0), 101.0));
        assert!(is_triggered(&algo(AlgoType::Stop, Side::Short, 100.0), 101.0));
        assert!(!is_triggered(&algo(AlgoType::Stop, Side::Short, 100.0), 99.0));
    }

    #[test]
    fn take_profit_triggers_above_for_long_below_for_short() {
        assert!(is_triggered(&algo(AlgoType::TakeProfit, Side::Long, 100.0), 101.0));
        assert!(is_triggered(&algo(AlgoType::TakeProfit, Side::Short, 100.0), 99.0));
    }

    #[test]
    fn close_pnl_formulas() {
        assert_eq!(close_pnl(Side::Long, 100.0, 110.0, 2.0, 1.0), 19.0);
        assert_eq!(close_pnl(Side::Short, 100.0, 90.0, 2.0, 1.0), 19.0);
    }
}
