use super::{CandleStream, Exchange, SUBSCRIPTION_BUFFER};
use crate::models::{Candle, SeriesKey, SymbolInfo, SYMBOL_STATUS_TRADING};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// One CSV file holding the history of a (symbol, timeframe) pair
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFeed {
    pub symbol_info: SymbolInfo,
    pub timeframe: String,
    pub file: PathBuf,
}

impl SymbolFeed {
    pub fn new(
        symbol: &str,
        timeframe: &str,
        file: impl Into<PathBuf>,
        quote_asset: &str,
    ) -> Self {
        let base_asset = symbol.strip_suffix(quote_asset).unwrap_or(symbol);
        Self {
            symbol_info: SymbolInfo {
                symbol: symbol.to_string(),
                status: SYMBOL_STATUS_TRADING.to_string(),
                base_asset: base_asset.to_string(),
                quote_asset: quote_asset.to_string(),
            },
            timeframe: timeframe.to_string(),
            file: file.into(),
        }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.symbol_info.symbol, &self.timeframe)
    }
}

/// Row layout: symbol, timeframe, open time (unix seconds), open, close,
/// low, high, volume, trades. No header.
#[derive(Debug, Deserialize)]
struct CsvRow {
    symbol: String,
    timeframe: String,
    time: i64,
    open: f64,
    close: f64,
    low: f64,
    high: f64,
    volume: f64,
    trades: u64,
}

impl TryFrom<CsvRow> for Candle {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let time = Utc
            .timestamp_opt(row.time, 0)
            .single()
            .ok_or_else(|| Error::InvalidData(format!("bad timestamp {}", row.time)))?;

        Ok(Candle {
            symbol: row.symbol,
            timeframe: row.timeframe,
            time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            trades: row.trades,
            complete: true,
        })
    }
}

/// Replays recorded candles for backtests
///
/// Every candle is complete. `candles_by_limit` consumes from the front of
/// the history so the subscription continues right after the preloaded
/// window.
pub struct CsvFeed {
    symbols: Vec<SymbolInfo>,
    candles: Mutex<HashMap<SeriesKey, VecDeque<Candle>>>,
}

impl CsvFeed {
    /// Load every feed file up front
    pub fn new(feeds: impl IntoIterator<Item = SymbolFeed>) -> Result<Self> {
        let mut loaded = Vec::new();

        for feed in feeds {
            let file = std::fs::File::open(&feed.file)?;
            let candles = parse_candles(file)?;

            let key = feed.key();
            if let Some(foreign) = candles.iter().find(|c| c.key() != key) {
                return Err(Error::InvalidData(format!(
                    "{} contains a {} candle, expected {}",
                    feed.file.display(),
                    foreign.key(),
                    key
                )));
            }

            tracing::info!(
                key = %key,
                file = %feed.file.display(),
                candles = candles.len(),
                "Loaded csv feed"
            );
            loaded.push((feed.symbol_info, feed.timeframe, candles));
        }

        Ok(Self::from_memory(loaded))
    }

    /// Build a feed from candles already in memory
    pub fn from_memory(feeds: Vec<(SymbolInfo, String, Vec<Candle>)>) -> Self {
        let mut symbols: Vec<SymbolInfo> = Vec::new();
        let mut candles = HashMap::new();

        for (info, timeframe, history) in feeds {
            candles.insert(SeriesKey::new(&info.symbol, timeframe), history.into());
            if !symbols.iter().any(|s| s.symbol == info.symbol) {
                symbols.push(info);
            }
        }

        Self {
            symbols,
            candles: Mutex::new(candles),
        }
    }

    /// Candles not yet consumed for a pair
    pub fn remaining(&self, symbol: &str, timeframe: &str) -> usize {
        self.candles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&SeriesKey::new(symbol, timeframe))
            .map_or(0, VecDeque::len)
    }
}

/// Parse headerless candle rows
pub fn parse_candles<R: Read>(reader: R) -> Result<Vec<Candle>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    reader
        .deserialize::<CsvRow>()
        .map(|row| Candle::try_from(row?))
        .collect()
}

#[async_trait]
impl Exchange for CsvFeed {
    async fn symbols(&self) -> Result<Vec<SymbolInfo>> {
        Ok(self.symbols.clone())
    }

    async fn candles_by_limit(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let key = SeriesKey::new(symbol, timeframe);
        let mut candles = self.candles.lock().unwrap_or_else(PoisonError::into_inner);
        let history = candles.entry(key.clone()).or_default();

        if history.len() < limit {
            return Err(Error::insufficient(key.to_string(), limit, history.len()));
        }

        Ok(history.drain(..limit).collect())
    }

    async fn candles_by_period(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let candles = self.candles.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(candles
            .get(&SeriesKey::new(symbol, timeframe))
            .map(|history| {
                history
                    .iter()
                    .filter(|c| c.time >= start && c.time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn candles_subscription(&self, symbol: &str, timeframe: &str) -> Result<CandleStream> {
        let history = {
            let mut candles = self.candles.lock().unwrap_or_else(PoisonError::into_inner);
            candles
                .get_mut(&SeriesKey::new(symbol, timeframe))
                .map(std::mem::take)
                .unwrap_or_default()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            for candle in history {
                if tx.send(Ok(candle)).await.is_err() {
                    return;
                }
            }
            // tx drops here: end of data
        });

        Ok(rx)
    }
}
