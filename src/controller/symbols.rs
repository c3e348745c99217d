use crate::exchange::Exchange;
use crate::models::SymbolInfo;
use crate::shutdown::Shutdown;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
struct SymbolSets {
    trading: BTreeMap<String, SymbolInfo>,
    deprecated: BTreeMap<String, SymbolInfo>,
}

/// Tradable symbol list kept fresh from the exchange
///
/// Only symbols quoted in `quote_asset` with status TRADING are kept.
/// Symbols that drop out of the list are remembered as deprecated.
pub struct SymbolsController {
    exchange: Arc<dyn Exchange>,
    quote_asset: String,
    sets: RwLock<SymbolSets>,
}

impl std::fmt::Debug for SymbolsController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolsController")
            .field("quote_asset", &self.quote_asset)
            .finish_non_exhaustive()
    }
}

impl SymbolsController {
    /// Build the controller with an initial fetch; a failed fetch is fatal
    pub async fn new(exchange: Arc<dyn Exchange>, quote_asset: impl Into<String>) -> Result<Self> {
        let controller = Self {
            exchange,
            quote_asset: quote_asset.into(),
            sets: RwLock::new(SymbolSets::default()),
        };
        controller.refresh().await?;
        Ok(controller)
    }

    pub async fn refresh(&self) -> Result<()> {
        let fetched = self.exchange.symbols().await?;
        let trading: BTreeMap<String, SymbolInfo> = fetched
            .into_iter()
            .filter(|info| info.quote_asset == self.quote_asset && info.is_trading())
            .map(|info| (info.symbol.clone(), info))
            .collect();

        let mut sets = self.sets.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::take(&mut sets.trading);
        for (symbol, info) in previous {
            if !trading.contains_key(&symbol) {
                tracing::info!(symbol = %symbol, "Symbol no longer trading");
                sets.deprecated.insert(symbol, info);
            }
        }
        // A relisted symbol is no longer deprecated
        for symbol in trading.keys() {
            sets.deprecated.remove(symbol);
        }
        tracing::debug!(count = trading.len(), quote = %self.quote_asset, "Refreshed trading symbols");
        sets.trading = trading;
        Ok(())
    }

    /// Trading symbols, sorted by name
    pub fn trading_symbols(&self) -> Vec<SymbolInfo> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.trading.values().cloned().collect()
    }

    pub fn deprecated_symbols(&self) -> Vec<SymbolInfo> {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.deprecated.values().cloned().collect()
    }

    pub fn is_trading(&self, symbol: &str) -> bool {
        let sets = self.sets.read().unwrap_or_else(PoisonError::into_inner);
        sets.trading.contains_key(symbol)
    }

    /// Refresh every `period` until `shutdown` fires; failures are logged
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: Shutdown) {
        // Construction already fetched once
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(error = %e, "Symbol refresh failed");
                    }
                }
            }
        }
        tracing::debug!("Symbol refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::csv_feed::CsvFeed;
    use crate::exchange::{CandleStream, Exchange};
    use crate::models::Candle;
    use crate::{shutdown, Error};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    fn info(symbol: &str, quote: &str, status: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            status: status.to_string(),
            base_asset: symbol.trim_end_matches(quote).to_string(),
            quote_asset: quote.to_string(),
        }
    }

    /// Each `symbols` call returns the next listing
    struct Listings(Mutex<VecDeque<Result<Vec<SymbolInfo>>>>);

    #[async_trait]
    impl Exchange for Listings {
        async fn symbols(&self) -> Result<Vec<SymbolInfo>> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Transport("no listing".to_string())))
        }

        async fn candles_by_limit(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn candles_by_period(
            &self,
            _: &str,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn candles_subscription(&self, _: &str, _: &str) -> Result<CandleStream> {
            Err(Error::Transport("not streaming".to_string()))
        }
    }

    fn listings(items: Vec<Result<Vec<SymbolInfo>>>) -> Arc<dyn Exchange> {
        Arc::new(Listings(Mutex::new(items.into())))
    }

    #[tokio::test]
    async fn test_initial_fetch_filters_quote_and_status() {
        let exchange = listings(vec![Ok(vec![
            info("ETHUSDT", "USDT", "TRADING"),
            info("BTCUSDT", "USDT", "TRADING"),
            info("ETHBTC", "BTC", "TRADING"),
            info("LUNAUSDT", "USDT", "BREAK"),
        ])]);

        let controller = assert_ok!(SymbolsController::new(exchange, "USDT").await);
        let symbols: Vec<_> = controller
            .trading_symbols()
            .into_iter()
            .map(|s| s.symbol)
            .collect();

        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert!(controller.deprecated_symbols().is_empty());
        assert!(!controller.is_trading("LUNAUSDT"));
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_is_fatal() {
        let exchange = listings(vec![Err(Error::Transport("down".to_string()))]);
        assert_err!(SymbolsController::new(exchange, "USDT").await);
    }

    #[tokio::test]
    async fn test_refresh_tracks_deprecated_symbols() {
        let exchange = listings(vec![
            Ok(vec![
                info("BTCUSDT", "USDT", "TRADING"),
                info("LUNAUSDT", "USDT", "TRADING"),
            ]),
            Ok(vec![
                info("BTCUSDT", "USDT", "TRADING"),
                info("LUNAUSDT", "USDT", "BREAK"),
            ]),
            Err(Error::Transport("down".to_string())),
        ]);
        let controller = SymbolsController::new(exchange, "USDT").await.unwrap();

        assert_ok!(controller.refresh().await);
        assert!(controller.is_trading("BTCUSDT"));
        assert!(!controller.is_trading("LUNAUSDT"));
        let deprecated = controller.deprecated_symbols();
        assert_eq!(deprecated.len(), 1);
        assert_eq!(deprecated[0].symbol, "LUNAUSDT");

        // A failed refresh keeps the last known lists
        assert_err!(controller.refresh().await);
        assert!(controller.is_trading("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let feed = CsvFeed::from_memory(vec![(info("BTCUSDT", "USDT", "TRADING"), "1h".to_string(), Vec::new())]);
        let controller = Arc::new(SymbolsController::new(Arc::new(feed), "USDT").await.unwrap());

        let (trigger, shutdown) = shutdown::channel();
        let running = tokio::spawn(controller.clone().run(Duration::from_millis(5), shutdown));
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(controller.is_trading("BTCUSDT"));
    }
}
