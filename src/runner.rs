use crate::config::AppConfig;
use crate::controller::{CandleController, SymbolsController};
use crate::exchange::Exchange;
use crate::models::{Candle, SeriesKey};
use crate::notification::{spawn_alert_worker, Notifier};
use crate::shutdown::Shutdown;
use crate::strategy::{MaCrossStrategy, Strategy, StrategyController};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// How long to wait for queued alerts once every feed has ended
const ALERT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// History pulls in flight at once during preload
const PRELOAD_CONCURRENCY: usize = 8;

/// Rate limiter timeouts tolerated per history pull
const PRELOAD_RATE_LIMIT_RETRIES: u32 = 10;

/// Pick the watched symbols
///
/// Configured symbols win over the exchange listing; exclusions apply to
/// both.
pub fn select_symbols(config: &AppConfig, symbols: &SymbolsController) -> Vec<String> {
    let candidates: Vec<String> = if config.symbols.is_empty() {
        symbols
            .trading_symbols()
            .into_iter()
            .map(|info| info.symbol)
            .collect()
    } else {
        config.symbols.clone()
    };

    let mut selected: Vec<String> = Vec::with_capacity(candidates.len());
    for symbol in candidates {
        if config.excluded_symbols.contains(&symbol) || selected.contains(&symbol) {
            continue;
        }
        selected.push(symbol);
    }
    selected
}

/// Wires the exchange, the candle distribution layer, the strategy
/// controllers and the alert worker together
pub struct AlertBot {
    config: AppConfig,
    exchange: Arc<dyn Exchange>,
    notifier: Arc<dyn Notifier>,
}

impl AlertBot {
    pub fn new(config: AppConfig, exchange: Arc<dyn Exchange>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            exchange,
            notifier,
        }
    }

    /// Run until every feed ends or `shutdown` fires
    ///
    /// Setup errors (symbol listing, preload) abort the run. Queued alerts
    /// are delivered before returning.
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let symbols = Arc::new(
            SymbolsController::new(self.exchange.clone(), self.config.quote_asset.clone()).await?,
        );
        let selected = select_symbols(&self.config, &symbols);
        if selected.is_empty() {
            return Err(Error::Config("no symbols to watch".to_string()));
        }
        tracing::info!(
            symbols = selected.len(),
            timeframes = ?self.config.timeframes,
            quote = %self.config.quote_asset,
            "Selected symbols"
        );

        let (alerts, worker) = spawn_alert_worker(self.notifier.clone(), self.config.alert_queue_capacity);
        let strategy = Arc::new(MaCrossStrategy::new(self.config.strategy.clone(), alerts.clone()));
        let candles = Arc::new(CandleController::new(
            self.exchange.clone(),
            self.config.stream.clone(),
        ));

        let mut controllers = Vec::with_capacity(self.config.timeframes.len());
        for timeframe in &self.config.timeframes {
            let pairs: Vec<SeriesKey> = selected
                .iter()
                .map(|symbol| SeriesKey::new(symbol, timeframe))
                .collect();
            let controller = Arc::new(StrategyController::new(pairs.clone(), strategy.clone()));

            for key in &pairs {
                let consumer = controller.clone();
                candles.subscribe(&key.symbol, &key.timeframe, move |c| consumer.on_candle(c), false);
            }

            self.preload(&candles, &pairs, strategy.warmup_period()).await?;
            controller.start();
            controllers.push(controller);
        }

        alerts.send(startup_message(&selected, &self.config));

        let refresher = tokio::spawn(symbols.clone().run(
            Duration::from_secs(self.config.symbol_refresh_secs),
            shutdown.clone(),
        ));

        candles.start(shutdown).await;
        refresher.abort();

        // The worker stops once the last alert sender is gone
        drop(candles);
        drop(controllers);
        drop(strategy);
        drop(alerts);
        match tokio::time::timeout(ALERT_DRAIN_TIMEOUT, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Alert worker failed"),
            Err(_) => tracing::warn!("Timed out delivering queued alerts"),
        }

        tracing::info!("Alert bot stopped");
        Ok(())
    }

    /// Pull `warmup` bars for every pair and replay them
    ///
    /// At most `PRELOAD_CONCURRENCY` pulls run at once. The first failure
    /// aborts the remaining pulls.
    async fn preload(&self, candles: &CandleController, pairs: &[SeriesKey], warmup: usize) -> Result<()> {
        let permits = Arc::new(Semaphore::new(PRELOAD_CONCURRENCY));
        let mut pulls = JoinSet::new();
        for key in pairs.iter().cloned() {
            let exchange = self.exchange.clone();
            let permits = permits.clone();
            pulls.spawn(async move {
                let history = match permits.acquire_owned().await {
                    Ok(_permit) => pull_history(exchange.as_ref(), &key, warmup).await,
                    Err(e) => Err(Error::Transport(format!("preload permits closed: {e}"))),
                };
                (key, history)
            });
        }

        while let Some(joined) = pulls.join_next().await {
            let (key, history) = joined.map_err(|e| Error::Transport(format!("preload task failed: {e}")))?;
            let history = history.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Preload failed");
                e
            })?;
            candles.preload(&key.symbol, &key.timeframe, &history);
        }
        Ok(())
    }
}

/// Fetch warmup history, waiting out rate limiter timeouts
///
/// A zero wait means the request can never fit the bucket and is not retried.
async fn pull_history(exchange: &dyn Exchange, key: &SeriesKey, warmup: usize) -> Result<Vec<Candle>> {
    let mut attempt = 0;
    loop {
        match exchange.candles_by_limit(&key.symbol, &key.timeframe, warmup).await {
            Err(Error::RateLimitExceeded(waited)) if !waited.is_zero() && attempt < PRELOAD_RATE_LIMIT_RETRIES => {
                attempt += 1;
                tracing::debug!(key = %key, attempt, waited = ?waited, "Preload waiting for rate limit");
            }
            result => return result,
        }
    }
}

fn startup_message(symbols: &[String], config: &AppConfig) -> String {
    format!(
        "MA{} cross alerts started | {} symbols | Timeframes {}",
        config.strategy.ma_period,
        symbols.len(),
        config.timeframes.join(", ")
    )
}
