use super::{CandleStream, Exchange, SUBSCRIPTION_BUFFER};
use crate::config::BinanceConfig;
use crate::models::{Candle, SymbolInfo};
use crate::rate_limiter::RateLimiter;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use reqwest::Client;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type KlineSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const MAX_KLINES_PER_REQUEST: usize = 1000;

// Request weights as published by Binance
const WEIGHT_PING: u32 = 1;
const WEIGHT_EXCHANGE_INFO: u32 = 10;
const WEIGHT_KLINES: u32 = 2;

/// Binance spot REST client
///
/// Cloneable; clones share the HTTP connection pool and the rate limiter.
/// Live candles come from the `<symbol>@kline_<interval>` WebSocket stream,
/// which does not count against the REST request weight.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<RateLimiter>,
    ws_url: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
}

/// `[open_time, open, high, low, close, volume, close_time, quote_volume,
/// trades, taker_base, taker_quote, unused]`
#[derive(Debug, Deserialize)]
struct RawKline(
    i64,
    String,
    String,
    String,
    String,
    String,
    i64,
    IgnoredAny,
    u64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

fn parse_price(field: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| Error::InvalidData(format!("{} is not a number: {:?}", field, value)))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::InvalidData(format!("bad timestamp {}", millis)))
}

impl RawKline {
    fn into_candle(self, symbol: &str, timeframe: &str, now: DateTime<Utc>) -> Result<Candle> {
        let close_time = from_millis(self.6)?;
        Ok(Candle {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            time: from_millis(self.0)?,
            open: parse_price("open", &self.1)?,
            high: parse_price("high", &self.2)?,
            low: parse_price("low", &self.3)?,
            close: parse_price("close", &self.4)?,
            volume: parse_price("volume", &self.5)?,
            trades: self.8,
            complete: close_time < now,
        })
    }
}

/// Push message of a kline stream
#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "k")]
    kline: Option<StreamKline>,
}

#[derive(Debug, Deserialize)]
struct StreamKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trades: u64,
    /// Bar is closed
    #[serde(rename = "x")]
    closed: bool,
}

impl StreamKline {
    fn into_candle(self, symbol: &str, timeframe: &str) -> Result<Candle> {
        Ok(Candle {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            time: from_millis(self.open_time)?,
            open: parse_price("open", &self.open)?,
            high: parse_price("high", &self.high)?,
            low: parse_price("low", &self.low)?,
            close: parse_price("close", &self.close)?,
            volume: parse_price("volume", &self.volume)?,
            trades: self.trades,
            complete: self.closed,
        })
    }
}

/// Candle carried by a stream message; `None` for non-kline messages
fn parse_kline_message(text: &str, symbol: &str, timeframe: &str) -> Result<Option<Candle>> {
    let event: KlineEvent = serde_json::from_str(text)?;
    match event.kline {
        Some(kline) if event.event == "kline" => kline.into_candle(symbol, timeframe).map(Some),
        _ => Ok(None),
    }
}

fn kline_stream_url(ws_url: &str, symbol: &str, timeframe: &str) -> String {
    format!("{}/ws/{}@kline_{}", ws_url, symbol.to_lowercase(), timeframe)
}

/// Forward stream messages until the receiver goes away or the socket fails
///
/// Malformed messages are skipped. A socket error, a server close or the
/// end of the stream is reported as one `Err` item so the subscriber
/// reconnects.
async fn forward_klines(
    mut socket: KlineSocket,
    symbol: String,
    timeframe: String,
    tx: mpsc::Sender<Result<Candle>>,
) {
    loop {
        let message = tokio::select! {
            _ = tx.closed() => {
                let _ = socket.close(None).await;
                return;
            }
            message = socket.next() => message,
        };

        let failure = match message {
            Some(Ok(Message::Text(text))) => {
                match parse_kline_message(&text, &symbol, &timeframe) {
                    Ok(Some(candle)) => {
                        if tx.send(Ok(candle)).await.is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "Skipping kline message");
                    }
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => {
                Error::Transport(format!("kline stream closed by server: {:?}", frame))
            }
            // Pings are answered by the socket itself
            Some(Ok(_)) => continue,
            Some(Err(e)) => Error::Transport(format!("kline stream error: {}", e)),
            None => Error::Transport("kline stream ended".to_string()),
        };

        tracing::debug!(symbol = %symbol, timeframe = %timeframe, error = %failure, "Kline stream failed");
        let _ = tx.send(Err(failure)).await;
        break;
    }
}

impl BinanceClient {
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = Client::builder().timeout(timeout).build()?;
        let rate_limiter = RateLimiter::new(
            config.requests_per_second,
            config.requests_per_second,
            timeout,
        )?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rate_limiter: Arc::new(rate_limiter),
            ws_url: config.ws_url.trim_end_matches('/').to_string(),
        })
    }

    /// Connectivity check, used once at startup
    pub async fn ping(&self) -> Result<()> {
        let _: serde_json::Value = self.get("/api/v3/ping", &[], WEIGHT_PING).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        weight: u32,
    ) -> Result<T> {
        self.rate_limiter.acquire(weight).await?;

        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Exchange {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    async fn klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start {
            query.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = end {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }

        let raw: Vec<RawKline> = self.get("/api/v3/klines", &query, WEIGHT_KLINES).await?;
        let now = Utc::now();
        raw.into_iter()
            .map(|kline| kline.into_candle(symbol, timeframe, now))
            .collect()
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn symbols(&self) -> Result<Vec<SymbolInfo>> {
        let info: ExchangeInfoResponse = self
            .get("/api/v3/exchangeInfo", &[], WEIGHT_EXCHANGE_INFO)
            .await?;

        Ok(info
            .symbols
            .into_iter()
            .map(|s| SymbolInfo {
                symbol: s.symbol,
                status: s.status,
                base_asset: s.base_asset,
                quote_asset: s.quote_asset,
            })
            .collect())
    }

    async fn candles_by_limit(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        if limit > MAX_KLINES_PER_REQUEST {
            return Err(Error::InvalidData(format!(
                "klines limit {} exceeds {}",
                limit, MAX_KLINES_PER_REQUEST
            )));
        }
        self.klines(symbol, timeframe, limit, None, None).await
    }

    async fn candles_by_period(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;

        while cursor <= end {
            let batch = self
                .klines(symbol, timeframe, MAX_KLINES_PER_REQUEST, Some(cursor), Some(end))
                .await?;
            let full = batch.len() == MAX_KLINES_PER_REQUEST;
            let Some(last) = batch.last().map(|c| c.time) else {
                break;
            };
            candles.extend(batch);
            if !full {
                break;
            }
            cursor = last + chrono::Duration::milliseconds(1);
        }

        Ok(candles)
    }

    async fn candles_subscription(&self, symbol: &str, timeframe: &str) -> Result<CandleStream> {
        let url = kline_stream_url(&self.ws_url, symbol, timeframe);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", url, e)))?;
        tracing::debug!(url = %url, "Kline stream connected");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(forward_klines(socket, symbol.to_string(), timeframe.to_string(), tx));
        Ok(rx)
    }
}
