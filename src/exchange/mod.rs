// Market data collaborators: live Binance client and CSV replay feed
pub mod binance;
pub mod csv_feed;

pub use binance::BinanceClient;
pub use csv_feed::{CsvFeed, SymbolFeed};

use crate::models::{Candle, SymbolInfo};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Buffer size of a candle subscription channel
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Push stream of candles for one (symbol, timeframe) pair
///
/// An `Err` item signals that the subscription failed and will produce
/// nothing more; the channel closing means a graceful end of data.
/// Dropping the receiver stops the producer.
pub type CandleStream = mpsc::Receiver<Result<Candle>>;

/// Source of historical and live candles
#[async_trait]
pub trait Exchange: Send + Sync {
    /// All symbols listed by the exchange
    async fn symbols(&self) -> Result<Vec<SymbolInfo>>;

    /// The most recent `limit` candles, oldest first
    async fn candles_by_limit(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Candles with open time in `[start, end]`, oldest first
    async fn candles_by_period(
        &self,
        symbol: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Open a live candle subscription
    async fn candles_subscription(&self, symbol: &str, timeframe: &str) -> Result<CandleStream>;
}
