use crate::exchange::{CandleStream, Exchange};
use crate::models::{Candle, SeriesKey};
use crate::shutdown::Shutdown;
use crate::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Callback receiving every candle of a subscribed pair
pub type CandleConsumer = Arc<dyn Fn(&Candle) + Send + Sync>;

/// Reconnect policy for failed candle subscriptions
///
/// Delay doubles from `initial_backoff_ms` up to `max_backoff_ms`. The
/// failure count resets whenever a candle arrives. `max_attempts = None`
/// retries forever.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect number `failures` (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32);
        let backoff = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(backoff)
    }

    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures <= max)
    }
}

#[derive(Clone)]
struct Subscription {
    closed_only: bool,
    consumer: CandleConsumer,
}

impl Subscription {
    fn accepts(&self, candle: &Candle) -> bool {
        !self.closed_only || candle.complete
    }
}

#[derive(Default)]
struct Registry {
    feeds: Vec<SeriesKey>,
    subscriptions: HashMap<SeriesKey, Vec<Subscription>>,
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(Error),
}

/// Fans out one exchange candle stream per (symbol, timeframe) to its
/// subscribers
pub struct CandleController {
    exchange: Arc<dyn Exchange>,
    retry: RetryPolicy,
    registry: Mutex<Registry>,
}

impl CandleController {
    pub fn new(exchange: Arc<dyn Exchange>, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            retry,
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer; the pair becomes an active feed
    ///
    /// With `closed_only`, the consumer only sees complete candles.
    pub fn subscribe<F>(&self, symbol: &str, timeframe: &str, consumer: F, closed_only: bool)
    where
        F: Fn(&Candle) + Send + Sync + 'static,
    {
        let key = SeriesKey::new(symbol, timeframe);
        let mut registry = self.registry();

        if !registry.feeds.contains(&key) {
            registry.feeds.push(key.clone());
        }
        registry
            .subscriptions
            .entry(key)
            .or_default()
            .push(Subscription {
                closed_only,
                consumer: Arc::new(consumer),
            });
    }

    /// Active feeds in registration order
    pub fn feeds(&self) -> Vec<SeriesKey> {
        self.registry().feeds.clone()
    }

    pub fn subscriber_count(&self, symbol: &str, timeframe: &str) -> usize {
        self.registry()
            .subscriptions
            .get(&SeriesKey::new(symbol, timeframe))
            .map_or(0, Vec::len)
    }

    // Snapshot so consumers run without the registry lock held
    fn subscribers(&self, key: &SeriesKey) -> Vec<Subscription> {
        self.registry()
            .subscriptions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn deliver(subscribers: &[Subscription], candle: &Candle) {
        for subscription in subscribers.iter().filter(|s| s.accepts(candle)) {
            (subscription.consumer)(candle);
        }
    }

    /// Replay historical candles, in order, through the pair's subscribers
    ///
    /// Call before `start` so the live stream picks up after the preloaded
    /// window.
    pub fn preload(&self, symbol: &str, timeframe: &str, candles: &[Candle]) {
        let key = SeriesKey::new(symbol, timeframe);
        let subscribers = self.subscribers(&key);

        for candle in candles {
            Self::deliver(&subscribers, candle);
        }
        tracing::debug!(key = %key, candles = candles.len(), "Preloaded candles");
    }

    /// Consume every registered feed until all streams end or `shutdown`
    /// fires
    pub async fn start(self: &Arc<Self>, shutdown: Shutdown) {
        let feeds = self.feeds();
        let mut tasks = JoinSet::new();

        for key in feeds {
            let span = tracing::info_span!("feed", key = %key);
            tasks.spawn(
                self.clone()
                    .consume_feed(key, shutdown.clone())
                    .instrument(span),
            );
        }
        tracing::info!(feeds = tasks.len(), "Start candle controller");

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Candle feed task failed");
            }
        }
        tracing::info!("Candle controller finished");
    }

    async fn consume_feed(self: Arc<Self>, key: SeriesKey, mut shutdown: Shutdown) {
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let opened = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                opened = self.exchange.candles_subscription(&key.symbol, &key.timeframe) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    match self.pump(&key, &mut stream, &mut shutdown, &mut failures).await {
                        // Dropping the stream closes the channel
                        StreamEnd::Cancelled => return,
                        StreamEnd::Closed => {
                            tracing::debug!("No more candles");
                            return;
                        }
                        StreamEnd::Failed(e) => {
                            tracing::warn!(error = %e, "Candle subscription error");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to open candle subscription"),
            }

            failures += 1;
            if !self.retry.allows(failures) {
                tracing::error!(failures, "Giving up on candle subscription");
                return;
            }

            let delay = self.retry.delay(failures);
            tracing::debug!(failures, delay_ms = delay.as_millis() as u64, "Reopening candle subscription");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn pump(
        &self,
        key: &SeriesKey,
        stream: &mut CandleStream,
        shutdown: &mut Shutdown,
        failures: &mut u32,
    ) -> StreamEnd {
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return StreamEnd::Cancelled,
                item = stream.recv() => item,
            };

            match item {
                Some(Ok(candle)) => {
                    if shutdown.is_cancelled() {
                        return StreamEnd::Cancelled;
                    }
                    *failures = 0;
                    Self::deliver(&self.subscribers(key), &candle);
                }
                Some(Err(e)) => return StreamEnd::Failed(e),
                None => return StreamEnd::Closed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymbolInfo;
    use crate::shutdown;
    use crate::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn candle(minute: i64, close: f64, complete: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            time: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            trades: 1,
            complete,
        }
    }

    /// Each subscription call replays the next script; once scripts run
    /// out the stream stays open and silent
    #[derive(Default)]
    struct ScriptedExchange {
        scripts: Mutex<VecDeque<Result<Vec<Result<Candle>>>>>,
        opened: AtomicUsize,
        idle: Mutex<Vec<mpsc::Sender<Result<Candle>>>>,
    }

    impl ScriptedExchange {
        fn with_scripts(scripts: Vec<Result<Vec<Result<Candle>>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Exchange for ScriptedExchange {
        async fn symbols(&self) -> Result<Vec<SymbolInfo>> {
            Ok(Vec::new())
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
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            match self.scripts.lock().unwrap().pop_front() {
                Some(Ok(items)) => {
                    for item in items {
                        tx.try_send(item).unwrap();
                    }
                }
                Some(Err(e)) => return Err(e),
                None => self.idle.lock().unwrap().push(tx),
            }
            Ok(rx)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            max_attempts: None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, impl Fn(&Candle) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |c: &Candle| sink.lock().unwrap().push(c.close))
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: Some(3),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1_000));
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
        assert!(RetryPolicy::default().allows(u32::MAX));
    }

    #[test]
    fn test_subscribe_registers_feed_once() {
        let controller = CandleController::new(Arc::new(ScriptedExchange::default()), fast_retry());
        controller.subscribe("BTCUSDT", "1m", |_| {}, false);
        controller.subscribe("BTCUSDT", "1m", |_| {}, true);
        controller.subscribe("ETHUSDT", "1m", |_| {}, false);

        assert_eq!(
            controller.feeds(),
            vec![SeriesKey::new("BTCUSDT", "1m"), SeriesKey::new("ETHUSDT", "1m")]
        );
        assert_eq!(controller.subscriber_count("BTCUSDT", "1m"), 2);
        assert_eq!(controller.subscriber_count("BTCUSDT", "4h"), 0);
    }

    #[test]
    fn test_preload_in_order_with_filter() {
        let controller = CandleController::new(Arc::new(ScriptedExchange::default()), fast_retry());
        let (all, all_sink) = recorder();
        let (closed, closed_sink) = recorder();
        let (other, other_sink) = recorder();
        controller.subscribe("BTCUSDT", "1m", all_sink, false);
        controller.subscribe("BTCUSDT", "1m", closed_sink, true);
        controller.subscribe("BTCUSDT", "4h", other_sink, false);

        controller.preload(
            "BTCUSDT",
            "1m",
            &[candle(0, 1.0, true), candle(1, 2.0, true), candle(2, 3.0, false)],
        );

        assert_eq!(*all.lock().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(*closed.lock().unwrap(), vec![1.0, 2.0]);
        assert!(other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_and_closed_only_filter() {
        let exchange = Arc::new(ScriptedExchange::with_scripts(vec![Ok(vec![
            Ok(candle(0, 1.0, false)),
            Ok(candle(0, 1.5, true)),
            Ok(candle(1, 2.0, false)),
        ])]));
        let controller = Arc::new(CandleController::new(exchange, fast_retry()));
        let (all, all_sink) = recorder();
        let (closed, closed_sink) = recorder();
        controller.subscribe("BTCUSDT", "1m", all_sink, false);
        controller.subscribe("BTCUSDT", "1m", closed_sink, true);

        let (_trigger, shutdown) = shutdown::channel();
        controller.start(shutdown).await;

        assert_eq!(*all.lock().unwrap(), vec![1.0, 1.5, 2.0]);
        assert_eq!(*closed.lock().unwrap(), vec![1.5]);
    }

    #[tokio::test]
    async fn test_reopens_after_stream_error() {
        let exchange = Arc::new(ScriptedExchange::with_scripts(vec![
            Ok(vec![
                Ok(candle(0, 1.0, true)),
                Err(Error::Transport("socket reset".to_string())),
            ]),
            Err(Error::Transport("connect refused".to_string())),
            Ok(vec![Ok(candle(1, 2.0, true))]),
        ]));
        let controller = Arc::new(CandleController::new(exchange.clone(), fast_retry()));
        let (seen, sink) = recorder();
        controller.subscribe("BTCUSDT", "1m", sink, false);

        let (_trigger, shutdown) = shutdown::channel();
        controller.start(shutdown).await;

        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0]);
        assert_eq!(exchange.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let exchange = Arc::new(ScriptedExchange::with_scripts(vec![
            Err(Error::Transport("down".to_string())),
            Err(Error::Transport("down".to_string())),
            Err(Error::Transport("down".to_string())),
        ]));
        let policy = RetryPolicy {
            max_attempts: Some(2),
            ..fast_retry()
        };
        let controller = Arc::new(CandleController::new(exchange.clone(), policy));
        controller.subscribe("BTCUSDT", "1m", |_| {}, false);

        let (_trigger, shutdown) = shutdown::channel();
        tokio::time::timeout(Duration::from_secs(1), controller.start(shutdown))
            .await
            .unwrap();
        assert_eq!(exchange.opened.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_feeds() {
        let exchange = Arc::new(ScriptedExchange::default());
        let controller = Arc::new(CandleController::new(exchange.clone(), fast_retry()));
        let (seen, sink) = recorder();
        controller.subscribe("BTCUSDT", "1m", sink, false);
        controller.subscribe("ETHUSDT", "1m", |_| {}, false);

        let (trigger, shutdown) = shutdown::channel();
        let running = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start(shutdown).await })
        };

        // Wait for both feeds to open their (idle) streams
        while exchange.idle.lock().unwrap().len() < 2 {
            tokio::task::yield_now().await;
        }

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        let senders: Vec<_> = exchange.idle.lock().unwrap().drain(..).collect();
        for tx in senders {
            assert!(tx.is_closed());
            assert!(tx.try_send(Ok(candle(5, 9.0, true))).is_err());
        }
        assert!(seen.lock().unwrap().is_empty());
    }
}
