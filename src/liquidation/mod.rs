//! Auto-Liquidation Loop (spec §4.8): periodic scan of every open position,
//! forced MARKET close once the unrealized loss ratio breaches a model's
//! `auto_close_percent`.
//!
//! Grounded on the scheduler fabric's periodic-task shape (`main.rs`'s
//! `tokio::time::interval` loop) and `scrapers/binance_session.rs`'s
//! `BackoffCalculator` for the bounded retry-then-skip policy.

use crate::domain::{Side, Trade, TradeSide};
use crate::exchange::backoff::{BackoffCalculator, BackoffConfig};
use crate::exchange::rest::{Credentials, OrderSide, OrderSpec, OrderType, PositionSide};
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::persistence::Db;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_LIQUIDATION_ATTEMPTS: u32 = 3;
const TAKER_FEE_RATE: f64 = 0.0004;

pub struct LiquidationLoop {
    db: Db,
    exchange: Arc<ExchangeGateway>,
}

impl LiquidationLoop {
    pub fn new(db: Db, exchange: Arc<ExchangeGateway>) -> Self {
        Self { db, exchange }
    }

    /// Background scan loop (spec §4.8), default interval 60s
    /// (`auto_liquidation_scan_interval_secs`).
    pub async fn run(
        self: Arc<Self>,
        scan_interval_secs: u64,
        creds_lookup: impl Fn(&str) -> Option<Credentials> + Send + Sync + 'static,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(scan_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once(&creds_lookup).await {
                        error!(error = %e, "auto_liquidation_scan_failed");
                    }
                }
            }
        }
    }

    async fn scan_once(&self, creds_lookup: &impl Fn(&str) -> Option<Credentials>) -> anyhow::Result<()> {
        let positions = self.db.list_all_portfolios().await?;
        for p in positions {
            if p.quantity == 0.0 {
                continue;
            }
            let Some(model) = self.db.get_model(&p.model_id).await? else {
                continue;
            };
            if !model.auto_liquidation_enabled() {
                continue;
            }
            let threshold = model.auto_close_percent.unwrap_or(0.0) / 100.0;
            let loss_ratio = if p.initial_margin > 0.0 {
                (-p.unrealized_pnl / p.initial_margin).max(0.0)
            } else {
                0.0
            };
            if loss_ratio < threshold {
                continue;
            }

            let Some(creds) = creds_lookup(&p.model_id) else {
                warn!(model_id = %p.model_id, "auto_liquidation_missing_credentials");
                continue;
            };

            info!(
                model_id = %p.model_id,
                symbol = %p.symbol,
                loss_ratio,
                threshold,
                "auto_liquidation_triggered"
            );
            self.liquidate_with_retry(&p.model_id, &p.symbol, p.side, p.quantity, p.avg_entry_price, &creds)
                .await;
        }
        Ok(())
    }

    /// Up to `MAX_LIQUIDATION_ATTEMPTS` attempts with jittered backoff;
    /// a position that never closes is logged and skipped until the next
    /// scan (spec §4.8: persistent failures logged, not escalated).
    async fn liquidate_with_retry(
        &self,
        model_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_avg: f64,
        creds: &Credentials,
    ) {
        let mut backoff = BackoffCalculator::new(BackoffConfig::default());
        for attempt in 1..=MAX_LIQUIDATION_ATTEMPTS {
            match self.close_full_position(model_id, symbol, side, quantity, entry_avg, creds).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(model_id, symbol, attempt, error = %e, "auto_liquidation_attempt_failed");
                    if attempt < MAX_LIQUIDATION_ATTEMPTS {
                        tokio::time::sleep(backoff.next_backoff()).await;
                    }
                }
            }
        }
        error!(model_id, symbol, "auto_liquidation_exhausted_retries");
    }

    async fn close_full_position(
        &self,
        model_id: &str,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_avg: f64,
        creds: &Credentials,
    ) -> Result<(), ExchangeError> {
        let (order_side, position_side) = match side {
            Side::Long => (OrderSide::Sell, PositionSide::Long),
            Side::Short => (OrderSide::Buy, PositionSide::Short),
        };
        let spec = OrderSpec {
            symbol: symbol.to_string(),
            side: order_side,
            position_side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
        };
        let ack = self.exchange.place_order(creds, &spec).await?;
        let fee = ack.avg_price * ack.executed_qty * TAKER_FEE_RATE;
        let pnl = close_pnl(side, entry_avg, ack.avg_price, ack.executed_qty, fee);

        let trade_side = match order_side {
            OrderSide::Buy => TradeSide::Buy,
            OrderSide::Sell => TradeSide::Sell,
        };
        self.db
            .insert_trade(&Trade {
                id: Uuid::new_v4().to_string(),
                model_id: model_id.to_string(),
                symbol: symbol.to_string(),
                side: trade_side,
                signal: crate::domain::Signal::ClosePosition,
                quantity: ack.executed_qty,
                price: ack.avg_price,
                fee,
                pnl: Some(pnl),
                timestamp: chrono::Utc::now(),
            })
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        self.db
            .delete_portfolio(model_id, symbol, side)
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        Ok(())
    }
}

/// Same closing-pnl formulas as the Algo-Order Engine (spec §4.7/§4.8).
fn close_pnl(side: Side, entry_avg: f64, exit_price: f64, qty: f64, fee: f64) -> f64 {
    match side {
        Side::Long => (exit_price - entry_avg) * qty - fee,
        Side::Short => (entry_avg - exit_price) * qty - fee,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_pnl_long_and_short() {
        assert_eq!(close_pnl(Side::Long, 100.0, 120.0, 1.0, 0.5), 19.5);
        assert_eq!(close_pnl(Side::Short, 100.0, 80.0, 1.0, 0.5), 19.5);
    }

    #[test]
    fn loss_ratio_clamped_nonnegative() {
        let unrealized_pnl = 50.0; // profit, not a loss
        let initial_margin = 100.0;
        let ratio = (-unrealized_pnl / initial_margin).max(0.0);
        assert_eq!(ratio, 0.0);
    }
}
