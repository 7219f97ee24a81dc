//! Entity types of the data model (spec §3). Plain serde structs; the
//! Persistence Gateway (`persistence::`) is the only component that turns
//! these into SQL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Openai,
    AzureOpenai,
    Deepseek,
    Anthropic,
    Gemini,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    BuyToLong,
    BuyToShort,
    ClosePosition,
    StopLoss,
    TakeProfit,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::BuyToLong => "buy_to_long",
            Signal::BuyToShort => "buy_to_short",
            Signal::ClosePosition => "close_position",
            Signal::StopLoss => "stop_loss",
            Signal::TakeProfit => "take_profit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy_to_long" => Some(Signal::BuyToLong),
            "buy_to_short" => Some(Signal::BuyToShort),
            "close_position" => Some(Signal::ClosePosition),
            "stop_loss" => Some(Signal::StopLoss),
            "take_profit" => Some(Signal::TakeProfit),
            _ => None,
        }
    }

    /// Whether this signal, absent an explicit stop price, takes the
    /// immediate MARKET path rather than the conditional algo-order path
    /// (spec §4.7).
    pub fn is_immediate_by_default(&self) -> bool {
        matches!(
            self,
            Signal::BuyToLong | Signal::BuyToShort | Signal::ClosePosition
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionStatus {
    Triggered,
    Executed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlgoStatus {
    New,
    Cancelled,
    Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolSource {
    Leaderboard,
    Future,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: u32,
    pub batch_execution_interval_secs: u32,
    pub batch_execution_group_size: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_execution_interval_secs: 30,
            batch_execution_group_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub display_name: String,
    pub provider_id: String,
    pub provider_model_name: String,
    pub initial_capital: f64,
    /// 0 means "decide per call"; otherwise a literal multiplier in [0,125].
    pub leverage: u32,
    pub max_positions: u32,
    pub api_credentials: Option<String>,
    pub auto_buy_enabled: bool,
    pub auto_sell_enabled: bool,
    /// None or 0 disables auto-liquidation; otherwise 0 < x <= 100.
    pub auto_close_percent: Option<f64>,
    pub base_volume_filter: Option<f64>,
    pub symbol_source: SymbolSource,
    pub buy_batch: BatchConfig,
    pub sell_batch: BatchConfig,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn validate(&self) -> Result<(), String> {
        if self.leverage > 125 {
            return Err("leverage must be in [0,125]".into());
        }
        if self.max_positions == 0 {
            return Err("max_positions must be >= 1".into());
        }
        if let Some(p) = self.auto_close_percent {
            if !(p == 0.0 || (p > 0.0 && p <= 100.0)) {
                return Err("auto_close_percent must be null, 0, or in (0,100]".into());
            }
        }
        Ok(())
    }

    /// `auto_close_percent = null` or `0` both disable auto-liquidation (spec §8 boundary).
    pub fn auto_liquidation_enabled(&self) -> bool {
        matches!(self.auto_close_percent, Some(p) if p > 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub display_name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub api_key: String,
}

impl Provider {
    /// base URL must normalize to end in `/v1` except gemini, which ends at `/models`.
    pub fn normalized_base_url(&self) -> String {
        let trimmed = self.base_url.trim_end_matches('/');
        match self.provider_type {
            ProviderType::Gemini => {
                if trimmed.ends_with("/models") {
                    trimmed.to_string()
                } else {
                    format!("{trimmed}/models")
                }
            }
            _ => {
                if trimmed.ends_with("/v1") {
                    trimmed.to_string()
                } else {
                    format!("{trimmed}/v1")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Future {
    pub id: String,
    pub symbol: String,
    pub display_name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub strategy_type: StrategyType,
    pub program_text: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStrategy {
    pub id: String,
    pub model_id: String,
    pub strategy_id: String,
    pub strategy_type: StrategyType,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub model_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub initial_margin: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub model_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub signal: Signal,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub pnl: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_prompt: String,
    pub ai_response: String,
    pub cot_trace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub id: String,
    pub model_id: String,
    pub strategy_name: String,
    pub strategy_type: StrategyType,
    pub signal: Signal,
    pub symbol: String,
    pub quantity: f64,
    pub leverage: u32,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub justification: Option<String>,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
    pub trade_id: Option<String>,
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum AlgoType {
    Stop,
    TakeProfit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgoOrder {
    pub id: String,
    pub external_algo_id: Option<String>,
    pub client_algo_id: String,
    pub algo_type: AlgoType,
    pub order_type: String,
    pub symbol: String,
    pub side: TradeSide,
    pub position_side: Side,
    pub quantity: f64,
    pub trigger_price: f64,
    pub limit_price: Option<f64>,
    pub status: AlgoStatus,
    pub model_id: String,
    pub strategy_decision_id: Option<String>,
    pub trade_id: Option<String>,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountValue {
    pub model_id: String,
    pub account_alias: String,
    pub balance: f64,
    pub available_balance: f64,
    pub cross_wallet_balance: f64,
    pub cross_pnl: f64,
    pub cross_un_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountValueHistory {
    pub id: String,
    pub model_id: String,
    pub account_alias: String,
    pub balance: f64,
    pub available_balance: f64,
    pub cross_wallet_balance: f64,
    pub cross_un_pnl: f64,
    pub trade_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountValuesDaily {
    pub id: String,
    pub model_id: String,
    pub balance: f64,
    pub available_balance: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTicker {
    pub symbol: String,
    pub last_price: f64,
    pub open_price: f64,
    pub price_change: Option<f64>,
    pub price_change_percent: Option<f64>,
    pub quote_volume: f64,
    pub base_volume: f64,
    pub event_time: DateTime<Utc>,
    pub ingestion_time: DateTime<Utc>,
    pub update_price_date: Option<DateTime<Utc>>,
    pub side: Option<Side>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_base_url_normalization() {
        let mut p = Provider {
            id: "p1".into(),
            display_name: "oai".into(),
            provider_type: ProviderType::Openai,
            base_url: "https://api.openai.com".into(),
            api_key: "k".into(),
        };
        assert_eq!(p.normalized_base_url(), "https://api.openai.com/v1");

        p.provider_type = ProviderType::Gemini;
        p.base_url = "https://generativelanguage.googleapis.com/v1beta".into();
        assert_eq!(
            p.normalized_base_url(),
            "https://generativelanguage.googleapis.com/v1beta/models"
        );
    }

    #[test]
    fn model_validation_boundaries() {
        let base = Model {
            id: "m1".into(),
            display_name: "m".into(),
            provider_id: "p".into(),
            provider_model_name: "gpt".into(),
            initial_capital: 1000.0,
            leverage: 0,
            max_positions: 1,
            api_credentials: None,
            auto_buy_enabled: false,
            auto_sell_enabled: false,
            auto_close_percent: None,
            base_volume_filter: None,
            symbol_source: SymbolSource::Leaderboard,
            buy_batch: BatchConfig::default(),
            sell_batch: BatchConfig::default(),
            created_at: Utc::now(),
        };
        assert!(base.validate().is_ok());
        assert!(!base.auto_liquidation_enabled());

        let mut zero_positions = base.clone();
        zero_positions.max_positions = 0;
        assert!(zero_positions.validate().is_err());

        let mut over_leverage = base.clone();
        over_leverage.leverage = 126;
        assert!(over_leverage.validate().is_err());

        let mut disabled_zero = base.clone();
        disabled_zero.auto_close_percent = Some(0.0);
        assert!(disabled_zero.validate().is_ok());
        assert!(!disabled_zero.auto_liquidation_enabled());

        let mut enabled = base;
        enabled.auto_close_percent = Some(50.0);
        assert!(enabled.auto_liquidation_enabled());
    }
}
