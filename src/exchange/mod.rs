//! Exchange Gateway (spec §4.1): the sole I/O boundary to the futures
//! exchange. A singleton shared by the Ingestor, Kline Stream Manager,
//! Algo-Order Engine and Auto-Liquidation Loop (spec §5).
//!
//! Grounded on `vault/execution.rs` (`ExecutionAdapter`-style REST client,
//! HMAC request signing) and `scrapers/binance_hardened_ingest.rs` /
//! `scrapers/binance_session.rs` (WS reconnect/backoff state machine).

pub mod backoff;
pub mod ratelimit;
pub mod rest;
pub mod ws;

pub(crate) use rest::de_f64_from_str as rest_de_f64;

use rest::{AccountSnapshot, AlgoAck, Credentials, Kline, OrderAck, OrderSpec, Position, RestClient};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use ws::{KlineEvent, TickerEvent};

/// Error-kind taxonomy for every exchange call (spec §4.1, §7). `error.rs`
/// maps each variant onto the platform-wide `CoreError`.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connect error: {0}")]
    ConnectError(String),
    #[error("rate limited: {0}")]
    RateLimited(String, Option<u64>),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("auth error: {0}")]
    AuthError(String),
    #[error("permanent api error: {0}")]
    PermanentApiError(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ExchangeError {
    /// Transient errors retry with backoff at the call site (spec §7 policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_)
                | ExchangeError::ConnectError(_)
                | ExchangeError::RateLimited(_, _)
                | ExchangeError::ServerError(_)
        )
    }

    /// The `Retry-After` value carried by a 429, when the exchange sent one.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            ExchangeError::RateLimited(_, Some(secs)) => Some(std::time::Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Facade the rest of the platform depends on. Owns one `RestClient` and
/// exposes the WS subscription entry points; a `watch` channel signals
/// shutdown to every spawned stream task (spec §5 cancellation).
pub struct ExchangeGateway {
    rest: RestClient,
    ws_base_url: String,
    shutdown_tx: watch::Sender<bool>,
}

impl ExchangeGateway {
    pub fn new(rest_base_url: impl Into<String>, ws_base_url: impl Into<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            rest: RestClient::new(rest_base_url),
            ws_base_url: ws_base_url.into(),
            shutdown_tx,
        }
    }

    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        self.rest.fetch_klines(symbol, interval, limit, start_time, end_time).await
    }

    pub async fn place_order(&self, creds: &Credentials, spec: &OrderSpec) -> Result<OrderAck, ExchangeError> {
        self.rest.place_order(creds, spec).await
    }

    pub async fn place_algo_order(&self, creds: &Credentials, spec: &OrderSpec) -> Result<AlgoAck, ExchangeError> {
        self.rest.place_algo_order(creds, spec).await
    }

    pub async fn cancel_order(&self, creds: &Credentials, symbol: &str, external_id: &str) -> Result<(), ExchangeError> {
        self.rest.cancel_order(creds, symbol, external_id).await
    }

    pub async fn get_account(&self, creds: &Credentials) -> Result<AccountSnapshot, ExchangeError> {
        self.rest.get_account(creds).await
    }

    pub async fn get_positions(&self, creds: &Credentials) -> Result<Vec<Position>, ExchangeError> {
        self.rest.get_positions(creds).await
    }

    /// At-most-one active subscription (spec §4.1): repeated calls share the
    /// same underlying task via the returned broadcast receiver's clones.
    pub fn subscribe_all_tickers(&self) -> broadcast::Receiver<Vec<TickerEvent>> {
        ws::subscribe_all_tickers(self.ws_base_url.clone(), self.shutdown_tx.subscribe())
    }

    pub fn subscribe_kline(&self, symbol: &str, interval: &str) -> broadcast::Receiver<KlineEvent> {
        ws::subscribe_kline(
            self.ws_base_url.clone(),
            symbol.to_string(),
            interval.to_string(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// Signals every spawned WS task to close (spec §5 graceful shutdown).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
