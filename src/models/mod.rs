use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SYMBOL_STATUS_TRADING: &str = "TRADING";

/// OHLCV candlestick for one (symbol, timeframe) pair
///
/// Live streams may emit the same `time` many times while the bar is still
/// open; `complete` turns true once the bar is closed and will not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    /// Open time of the bar
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trades: u64,
    pub complete: bool,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.symbol, &self.timeframe)
    }
}

/// Composite (symbol, timeframe) key
///
/// Used by the candle controller, the strategy controller and the MA-cross
/// state map. Compared field by field, so a separator inside a symbol name
/// can never make two pairs collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// Tradable symbol as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == SYMBOL_STATUS_TRADING
    }
}

/// Length of one bar for a Binance-style timeframe string ("15m", "4h", "1d")
pub fn timeframe_duration(timeframe: &str) -> Option<Duration> {
    let (split, _) = timeframe.char_indices().last()?;
    let (amount, unit) = timeframe.split_at(split);
    let amount: i64 = amount.parse().ok().filter(|n| *n > 0)?;

    match unit {
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        "w" => Some(Duration::weeks(amount)),
        _ => None,
    }
}
