//! REST surface of the Exchange Gateway (spec §4.1): klines, orders, algo
//! orders, account/positions. HMAC request signing generalized from
//! `vault/execution.rs`'s Polymarket CLOB signer to Binance-futures-style
//! query-string signing.

use super::backoff::retry_with_backoff;
use super::ratelimit::{EndpointFamily, RateLimiter};
use super::ExchangeError;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const MAX_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    fn as_binance_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    #[serde(rename = "avgPrice", deserialize_with = "de_f64_from_str", default)]
    pub avg_price: f64,
    #[serde(rename = "executedQty", deserialize_with = "de_f64_from_str", default)]
    pub executed_qty: f64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlgoAck {
    #[serde(rename = "orderId")]
    pub external_algo_id: i64,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub open: f64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub high: f64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub low: f64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub close: f64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub volume: f64,
    pub close_time: i64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSnapshot {
    #[serde(deserialize_with = "de_f64_from_str")]
    pub total_wallet_balance: f64,
    #[serde(deserialize_with = "de_f64_from_str")]
    pub available_balance: f64,
    #[serde(rename = "totalCrossWalletBalance", deserialize_with = "de_f64_from_str", default)]
    pub cross_wallet_balance: f64,
    #[serde(rename = "totalCrossUnPnl", deserialize_with = "de_f64_from_str", default)]
    pub cross_un_pnl: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(rename = "positionSide")]
    pub position_side: String,
    #[serde(rename = "positionAmt", deserialize_with = "de_f64_from_str")]
    pub position_amt: f64,
    #[serde(rename = "entryPrice", deserialize_with = "de_f64_from_str")]
    pub entry_price: f64,
    #[serde(rename = "unrealizedProfit", deserialize_with = "de_f64_from_str")]
    pub unrealized_profit: f64,
    pub leverage: String,
}

pub(crate) fn de_f64_from_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrF64 {
        S(String),
        F(f64),
    }
    match StrOrF64::deserialize(deserializer)? {
        StrOrF64::S(s) => s.parse().map_err(serde::de::Error::custom),
        StrOrF64::F(f) => Ok(f),
    }
}

pub struct RestClient {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build exchange HTTP client"),
            base_url: base_url.into(),
            limiter: RateLimiter::new(),
        }
    }

    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ExchangeError {
        match status.as_u16() {
            401 | 403 => ExchangeError::AuthError(body.to_string()),
            429 => ExchangeError::RateLimited(body.to_string(), retry_after_secs(headers)),
            500..=599 => ExchangeError::ServerError(body.to_string()),
            _ => ExchangeError::PermanentApiError(format!("{status}: {body}")),
        }
    }

    /// `FetchKlines` (spec §4.1): REST, capped at 500 rows, ascending by open time.
    pub async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<Kline>, ExchangeError> {
        self.limiter.acquire(symbol, EndpointFamily::Klines).await;
        let capped_limit = limit.min(500);
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, capped_limit
        );
        if let Some(s) = start_time {
            url.push_str(&format!("&startTime={s}"));
        }
        if let Some(e) = end_time {
            url.push_str(&format!("&endTime={e}"));
        }

        let body = retry_with_backoff(
            "fetch_klines",
            MAX_RETRY_ATTEMPTS,
            ExchangeError::is_retryable,
            ExchangeError::retry_after,
            || async {
                let resp = self.http.get(&url).send().await.map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(Self::classify_status(status, &headers, &body));
                }
                Ok(body)
            },
        )
        .await?;

        let raw: Vec<Vec<serde_json::Value>> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;
        raw.into_iter().map(parse_kline_row).collect()
    }

    pub async fn place_order(&self, creds: &Credentials, spec: &OrderSpec) -> Result<OrderAck, ExchangeError> {
        self.limiter.acquire(&creds.api_key, EndpointFamily::Orders).await;
        let side = match spec.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let position_side = match spec.position_side {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        };

        let body = retry_with_backoff(
            "place_order",
            MAX_RETRY_ATTEMPTS,
            ExchangeError::is_retryable,
            ExchangeError::retry_after,
            || async {
                // rebuilt per attempt so `timestamp` stays within Binance's recvWindow
                let mut query = format!(
                    "symbol={}&side={}&positionSide={}&type={}&quantity={}",
                    spec.symbol,
                    side,
                    position_side,
                    spec.order_type.as_binance_str(),
                    spec.quantity
                );
                if let Some(p) = spec.price {
                    query.push_str(&format!("&price={p}"));
                }
                if let Some(sp) = spec.stop_price {
                    query.push_str(&format!("&stopPrice={sp}"));
                }
                if let Some(tif) = &spec.time_in_force {
                    query.push_str(&format!("&timeInForce={tif}"));
                }
                query.push_str(&format!("&timestamp={}", Utc::now().timestamp_millis()));

                let signature = Self::sign(&creds.api_secret, &query);
                let url = format!("{}/fapi/v1/order?{}&signature={}", self.base_url, query, signature);

                let resp = self
                    .http
                    .post(&url)
                    .header("X-MBX-APIKEY", &creds.api_key)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(Self::classify_status(status, &headers, &body));
                }
                Ok(body)
            },
        )
        .await?;

        serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))
    }

    pub async fn place_algo_order(&self, creds: &Credentials, spec: &OrderSpec) -> Result<AlgoAck, ExchangeError> {
        self.limiter.acquire(&creds.api_key, EndpointFamily::AlgoOrders).await;
        let ack = self.place_order(creds, spec).await?;
        Ok(AlgoAck {
            external_algo_id: ack.order_id,
            status: ack.status,
        })
    }

    pub async fn cancel_order(&self, creds: &Credentials, symbol: &str, external_id: &str) -> Result<(), ExchangeError> {
        self.limiter.acquire(&creds.api_key, EndpointFamily::Orders).await;
        retry_with_backoff(
            "cancel_order",
            MAX_RETRY_ATTEMPTS,
            ExchangeError::is_retryable,
            ExchangeError::retry_after,
            || async {
                let query = format!(
                    "symbol={symbol}&orderId={external_id}&timestamp={}",
                    Utc::now().timestamp_millis()
                );
                let signature = Self::sign(&creds.api_secret, &query);
                let url = format!("{}/fapi/v1/order?{}&signature={}", self.base_url, query, signature);

                let resp = self
                    .http
                    .delete(&url)
                    .header("X-MBX-APIKEY", &creds.api_key)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                if !status.is_success() {
                    let headers = resp.headers().clone();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Self::classify_status(status, &headers, &body));
                }
                Ok(())
            },
        )
        .await
    }

    pub async fn get_account(&self, creds: &Credentials) -> Result<AccountSnapshot, ExchangeError> {
        self.limiter.acquire(&creds.api_key, EndpointFamily::Account).await;
        let body = retry_with_backoff(
            "get_account",
            MAX_RETRY_ATTEMPTS,
            ExchangeError::is_retryable,
            ExchangeError::retry_after,
            || async {
                let query = format!("timestamp={}", Utc::now().timestamp_millis());
                let signature = Self::sign(&creds.api_secret, &query);
                let url = format!("{}/fapi/v2/account?{}&signature={}", self.base_url, query, signature);

                let resp = self
                    .http
                    .get(&url)
                    .header("X-MBX-APIKEY", &creds.api_key)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(Self::classify_status(status, &headers, &body));
                }
                Ok(body)
            },
        )
        .await?;
        serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))
    }

    pub async fn get_positions(&self, creds: &Credentials) -> Result<Vec<Position>, ExchangeError> {
        self.limiter.acquire(&creds.api_key, EndpointFamily::Account).await;
        let body = retry_with_backoff(
            "get_positions",
            MAX_RETRY_ATTEMPTS,
            ExchangeError::is_retryable,
            ExchangeError::retry_after,
            || async {
                let query = format!("timestamp={}", Utc::now().timestamp_millis());
                let signature = Self::sign(&creds.api_secret, &query);
                let url = format!(
                    "{}/fapi/v2/positionRisk?{}&signature={}",
                    self.base_url, query, signature
                );

                let resp = self
                    .http
                    .get(&url)
                    .header("X-MBX-APIKEY", &creds.api_key)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let status = resp.status();
                let headers = resp.headers().clone();
                let body = resp.text().await.unwrap_or_default();
                if !status.is_success() {
                    return Err(Self::classify_status(status, &headers, &body));
                }
                Ok(body)
            },
        )
        .await?;
        let all: Vec<Position> =
            serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;
        Ok(all.into_iter().filter(|p| p.position_amt != 0.0).collect())
    }
}

/// Parses a numeric `Retry-After: <seconds>` header. Binance has not been
/// observed to send the HTTP-date form; that form is treated the same as a
/// missing header.
fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

fn map_reqwest_err(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout(e.to_string())
    } else if e.is_connect() {
        ExchangeError::ConnectError(e.to_string())
    } else {
        ExchangeError::ConnectError(e.to_string())
    }
}

fn parse_kline_row(row: Vec<serde_json::Value>) -> Result<Kline, ExchangeError> {
    let err = || ExchangeError::MalformedResponse("kline row shape mismatch".to_string());
    let get_str = |v: &serde_json::Value| -> Result<f64, ExchangeError> {
        v.as_str().and_then(|s| s.parse().ok()).ok_or_else(err)
    };
    if row.len() < 8 {
        return Err(err());
    }
    Ok(Kline {
        open_time: row[0].as_i64().ok_or_else(err)?,
        open: get_str(&row[1])?,
        high: get_str(&row[2])?,
        low: get_str(&row[3])?,
        close: get_str(&row[4])?,
        volume: get_str(&row[5])?,
        close_time: row[6].as_i64().ok_or_else(err)?,
        quote_volume: get_str(&row[7])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let sig1 = RestClient::sign("secret", "symbol=BTCUSDT&timestamp=1");
        let sig2 = RestClient::sign("secret", "symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn kline_row_parses_binance_shape() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1625097600000,"100.0","110.0","95.0","105.0","1000.0",1625097899999,"105000.0",100,"500.0","52500.0","0"]"#,
        )
        .unwrap();
        let k = parse_kline_row(row).unwrap();
        assert_eq!(k.open, 100.0);
        assert_eq!(k.close, 105.0);
    }

    #[test]
    fn classify_status_429_reads_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        let err = RestClient::classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_status_500_has_no_retry_after_but_is_retryable() {
        let headers = HeaderMap::new();
        let err = RestClient::classify_status(StatusCode::INTERNAL_SERVER_ERROR, &headers, "boom");
        assert_eq!(err.retry_after(), None);
        assert!(err.is_retryable());
    }

    #[test]
    fn classify_status_403_is_not_retryable() {
        let headers = HeaderMap::new();
        let err = RestClient::classify_status(StatusCode::FORBIDDEN, &headers, "denied");
        assert!(!err.is_retryable());
    }
}
