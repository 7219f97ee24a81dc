//! WS surface of the Exchange Gateway (spec §4.1): all-tickers stream and
//! per-`(symbol, interval)` kline streams, with reconnect-on-drop.
//!
//! Grounded on `scrapers/binance_price_feed.rs` (broadcast-channel fan-out
//! to reactive consumers) and `scrapers/binance_session.rs` (backoff +
//! heartbeat state machine), generalized from `barter_data`'s spot L1 feed
//! to raw `tokio_tungstenite` against the futures ticker/kline streams.

use super::backoff::{BackoffCalculator, BackoffConfig};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct TickerEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c", deserialize_with = "super::rest_de_f64")]
    pub last_price: f64,
    #[serde(rename = "P", deserialize_with = "super::rest_de_f64")]
    pub price_change_percent: f64,
    #[serde(rename = "q", deserialize_with = "super::rest_de_f64")]
    pub quote_volume: f64,
    #[serde(rename = "v", deserialize_with = "super::rest_de_f64")]
    pub base_volume: f64,
    #[serde(rename = "E")]
    pub event_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o", deserialize_with = "super::rest_de_f64")]
    pub open: f64,
    #[serde(rename = "h", deserialize_with = "super::rest_de_f64")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "super::rest_de_f64")]
    pub low: f64,
    #[serde(rename = "c", deserialize_with = "super::rest_de_f64")]
    pub close: f64,
    #[serde(rename = "v", deserialize_with = "super::rest_de_f64")]
    pub volume: f64,
    /// `true` only on the final update of a bar (spec §4.3 "finalized klines").
    #[serde(rename = "x")]
    pub is_final: bool,
}

/// Spawns the all-tickers consumer task. At-most-one active subscription
/// (spec §4.1): callers share the returned receiver rather than resubscribing.
pub fn subscribe_all_tickers(ws_base_url: String, shutdown: tokio::sync::watch::Receiver<bool>) -> broadcast::Receiver<Vec<TickerEvent>> {
    let (tx, rx) = broadcast::channel(256);
    tokio::spawn(run_ticker_stream(ws_base_url, tx, shutdown));
    rx
}

async fn run_ticker_stream(
    ws_base_url: String,
    tx: broadcast::Sender<Vec<TickerEvent>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let url = format!("{ws_base_url}/ws/!ticker@arr");
    let mut backoff = BackoffCalculator::new(BackoffConfig::default());

    loop {
        if *shutdown.borrow() {
            return;
        }
        match tokio_tungstenite::connect_async(&url).await {
            Ok((mut stream, _)) => {
                info!(url = %url, "ticker_stream_connected");
                backoff.reset();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = stream.close(None).await;
                                return;
                            }
                        }
                        msg = tokio::time::timeout(WS_IDLE_TIMEOUT, stream.next()) => {
                            match msg {
                                Ok(Some(Ok(Message::Text(text)))) => {
                                    if let Ok(events) = serde_json::from_str::<Vec<TickerEvent>>(&text) {
                                        let _ = tx.send(events);
                                    }
                                }
                                Ok(Some(Ok(Message::Ping(payload)))) => {
                                    let _ = stream.send(Message::Pong(payload)).await;
                                }
                                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                    warn!("ticker_stream_closed_by_server");
                                    break;
                                }
                                Ok(Some(Err(e))) => {
                                    warn!(error = %e, "ticker_stream_error");
                                    break;
                                }
                                Err(_timeout) => {
                                    warn!("ticker_stream_idle_timeout");
                                    break;
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "ticker_stream_connect_failed");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        let delay = backoff.next_backoff();
        debug!(delay_ms = delay.as_millis() as u64, "ticker_stream_reconnect_backoff");
        tokio::time::sleep(delay).await;
    }
}

/// Spawns one consumer task per `(symbol, interval)` (spec §4.3). The
/// caller (Kline Stream Manager) owns rotation before the 30-minute cap
/// by dropping and respawning this task.
pub fn subscribe_kline(
    ws_base_url: String,
    symbol: String,
    interval: String,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> broadcast::Receiver<KlineEvent> {
    let (tx, rx) = broadcast::channel(64);
    tokio::spawn(run_kline_stream(ws_base_url, symbol, interval, tx, shutdown));
    rx
}

async fn run_kline_stream(
    ws_base_url: String,
    symbol: String,
    interval: String,
    tx: broadcast::Sender<KlineEvent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let stream_name = format!("{}@kline_{}", symbol.to_lowercase(), interval);
    let url = format!("{ws_base_url}/ws/{stream_name}");
    let mut backoff = BackoffCalculator::new(BackoffConfig::default());

    loop {
        if *shutdown.borrow() {
            return;
        }
        match tokio_tungstenite::connect_async(&url).await {
            Ok((mut stream, _)) => {
                info!(symbol = %symbol, interval = %interval, "kline_stream_connected");
                backoff.reset();
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                let _ = stream.close(None).await;
                                return;
                            }
                        }
                        msg = tokio::time::timeout(WS_IDLE_TIMEOUT, stream.next()) => {
                            match msg {
                                Ok(Some(Ok(Message::Text(text)))) => {
                                    if let Ok(event) = serde_json::from_str::<KlineEvent>(&text) {
                                        let _ = tx.send(event);
                                    }
                                }
                                Ok(Some(Ok(Message::Ping(payload)))) => {
                                    let _ = stream.send(Message::Pong(payload)).await;
                                }
                                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                                Ok(Some(Err(e))) => {
                                    warn!(error = %e, symbol = %symbol, "kline_stream_error");
                                    break;
                                }
                                Err(_timeout) => break,
                                _ => {}
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, symbol = %symbol, "kline_stream_connect_failed");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(backoff.next_backoff()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_event_parses_binance_arr_shape() {
        let json = r#"{"e":"24hrTicker","s":"BTCUSDT","c":"50000.0","P":"2.5","q":"1000000.0","v":"20.0","E":1625097600000}"#;
        let ev: TickerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.symbol, "BTCUSDT");
        assert_eq!(ev.last_price, 50000.0);
    }

    #[test]
    fn kline_event_only_marks_final_on_bar_close() {
        let json = r#"{"s":"BTCUSDT","k":{"t":1,"i":"1m","o":"1","h":"2","l":"0.5","c":"1.5","v":"10","x":false}}"#;
        let ev: KlineEvent = serde_json::from_str(json).unwrap();
        assert!(!ev.kline.is_final);
    }
}
