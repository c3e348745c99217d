use super::Strategy;
use crate::data::{Dataframe, FrameUpdate};
use crate::models::{Candle, SeriesKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns one dataframe per tracked pair and drives a strategy with them
///
/// Before `start`, candles only build history (preload). Afterwards the
/// open bar is updated in place and the strategy runs on every candle
/// once the dataframe is warm.
pub struct StrategyController {
    dataframes: HashMap<SeriesKey, Dataframe>,
    strategy: Arc<dyn Strategy>,
    started: AtomicBool,
}

impl StrategyController {
    pub fn new(pairs: impl IntoIterator<Item = SeriesKey>, strategy: Arc<dyn Strategy>) -> Self {
        let dataframes = pairs
            .into_iter()
            .map(|key| (key.clone(), Dataframe::new(key)))
            .collect();

        Self {
            dataframes,
            strategy,
            started: AtomicBool::new(false),
        }
    }

    pub fn dataframe(&self, key: &SeriesKey) -> Option<&Dataframe> {
        self.dataframes.get(key)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &SeriesKey> {
        self.dataframes.keys()
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(
            strategy = self.strategy.name(),
            pairs = self.dataframes.len(),
            "Strategy controller started"
        );
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn on_candle(&self, candle: &Candle) {
        let key = candle.key();
        let Some(dataframe) = self.dataframes.get(&key) else {
            tracing::warn!(key = %key, "Candle for untracked pair");
            return;
        };

        let started = self.is_started();
        match dataframe.apply(candle, started) {
            FrameUpdate::Stale => {
                tracing::warn!(
                    key = %key,
                    time = %candle.time,
                    last = ?dataframe.last_time(),
                    "Dropping out-of-order candle"
                );
                return;
            }
            FrameUpdate::Duplicate => {
                tracing::debug!(key = %key, time = %candle.time, "Ignoring duplicate candle");
            }
            FrameUpdate::Appended | FrameUpdate::Updated => {}
        }

        if started && dataframe.len() >= self.strategy.warmup_period() {
            if let Err(e) = self.strategy.on_candle(dataframe) {
                tracing::warn!(key = %key, error = %e, "Strategy evaluation failed");
            }
        }
    }
}
