use super::cross_state::{transition, MaState, MaTrend, Signal, Transition};
use super::Strategy;
use crate::data::Dataframe;
use crate::indicators::{calculate_mean, sma_with_previous};
use crate::models::SeriesKey;
use crate::notification::{AlertSender, EMOJI_ARROW_DOWN, EMOJI_ARROW_UP};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaCrossConfig {
    pub ma_period: usize,
    /// Bars averaged for the volume comparison, excluding the latest
    pub volume_period: usize,
}

impl Default for MaCrossConfig {
    fn default() -> Self {
        Self {
            ma_period: 200,
            volume_period: 20,
        }
    }
}

/// Figures derived from the latest bar of a dataframe
#[derive(Debug, Clone, PartialEq)]
pub struct CrossInput {
    pub time: DateTime<Utc>,
    pub close: f64,
    /// Average ending one bar before the latest
    pub previous_ma: f64,
    pub current_ma: f64,
    pub volume: f64,
    pub average_volume: f64,
}

impl CrossInput {
    pub fn from_dataframe(dataframe: &Dataframe, config: &MaCrossConfig) -> Result<Self> {
        let window = dataframe.window(config.ma_period + 1, config.volume_period + 1)?;
        let (previous_ma, current_ma) = sma_with_previous(&window.close, config.ma_period)
            .ok_or_else(|| {
                Error::insufficient(dataframe.key().to_string(), config.ma_period + 1, window.close.len())
            })?;
        let (close, volume, history) = match (window.close.last(), window.volume.split_last()) {
            (Some(close), Some((volume, history))) => (*close, *volume, history),
            _ => return Err(Error::insufficient(dataframe.key().to_string(), 1, 0)),
        };

        Ok(Self {
            time: window.time,
            close,
            previous_ma,
            current_ma,
            volume,
            average_volume: calculate_mean(history).unwrap_or(0.0),
        })
    }
}

/// A fired crossover, ready to be formatted into an alert
#[derive(Debug, Clone, PartialEq)]
pub struct CrossEvent {
    pub key: SeriesKey,
    pub signal: Signal,
    pub time: DateTime<Utc>,
    pub close: f64,
    pub ma: f64,
    pub ma_period: usize,
    pub trend: MaTrend,
    pub volume: f64,
    pub average_volume: f64,
}

impl CrossEvent {
    /// Latest volume over the average; `None` without volume history
    pub fn volume_ratio(&self) -> Option<f64> {
        (self.average_volume > 0.0).then(|| self.volume / self.average_volume)
    }

    /// Telegram HTML alert text
    pub fn message(&self) -> String {
        let emoji = if self.signal.is_up() {
            EMOJI_ARROW_UP
        } else {
            EMOJI_ARROW_DOWN
        };
        let symbol = &self.key.symbol;
        let ratio = self
            .volume_ratio()
            .map_or_else(|| "n/a".to_string(), |r| format!("x{:.2}", r));

        format!(
            "{emoji} MA Cross | <a href=\"https://www.binance.com/en/trade/{symbol}\">Symbol {symbol}</a> | Timeframe {timeframe}\n\
             Last price: <b>{close}</b>\n\
             Last MA{period}: <b>{ma:.8}</b>\n\
             MA Trend: <b>{trend}</b>\n\
             Volume: <b>{volume}</b> (avg {average:.2}, {ratio})\n\
             Last Update <b>{time}</b>",
            timeframe = self.key.timeframe,
            close = self.close,
            period = self.ma_period,
            ma = self.ma,
            trend = self.trend,
            volume = self.volume,
            average = self.average_volume,
            time = self.time.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

#[derive(Debug, Clone)]
struct CrossState {
    state: MaState,
    initialized_at: DateTime<Utc>,
    last_transition: Option<DateTime<Utc>>,
}

/// Alerts when the close crosses its long moving average
///
/// The first evaluation of a pair only records where the close sits. From
/// then on a cross up (close >= MA) or down (close <= MA) moves the state
/// and queues one alert, at most once per bar.
pub struct MaCrossStrategy {
    config: MaCrossConfig,
    states: Mutex<HashMap<SeriesKey, CrossState>>,
    alerts: AlertSender,
}

impl MaCrossStrategy {
    pub fn new(config: MaCrossConfig, alerts: AlertSender) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            alerts,
        }
    }

    pub fn config(&self) -> &MaCrossConfig {
        &self.config
    }

    pub fn state(&self, key: &SeriesKey) -> Option<MaState> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(key).map(|s| s.state)
    }

    /// Time of the bar that first set the pair's state
    pub fn initialized_at(&self, key: &SeriesKey) -> Option<DateTime<Utc>> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.get(key).map(|s| s.initialized_at)
    }

    /// Advance the pair's state machine; returns the event when it crossed
    pub fn evaluate(&self, key: &SeriesKey, input: &CrossInput) -> Option<CrossEvent> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = states.get_mut(key) else {
            let state = MaState::classify(input.close, input.current_ma);
            tracing::info!(
                key = %key,
                state = %state,
                close = input.close,
                previous_ma = input.previous_ma,
                ma = input.current_ma,
                "Init cross state"
            );
            states.insert(
                key.clone(),
                CrossState {
                    state,
                    initialized_at: input.time,
                    last_transition: None,
                },
            );
            return None;
        };

        let signal = match entry.state {
            MaState::Below | MaState::Equal if input.close >= input.current_ma => Signal::CrossUp,
            MaState::Above | MaState::Equal if input.close <= input.current_ma => Signal::CrossDown,
            _ => return None,
        };

        if entry.last_transition == Some(input.time) {
            tracing::debug!(key = %key, signal = %signal, time = %input.time, "Already crossed on this bar");
            return None;
        }

        match transition(entry.state, signal) {
            Transition::Moved(next) => {
                entry.state = next;
                entry.last_transition = Some(input.time);
            }
            Transition::Rejected { from, signal } => {
                tracing::error!(key = %key, from = %from, signal = %signal, "Rejected cross transition");
                return None;
            }
        }

        let event = CrossEvent {
            key: key.clone(),
            signal,
            time: input.time,
            close: input.close,
            ma: input.current_ma,
            ma_period: self.config.ma_period,
            trend: MaTrend::between(input.previous_ma, input.current_ma),
            volume: input.volume,
            average_volume: input.average_volume,
        };
        tracing::info!(
            key = %key,
            signal = %signal,
            close = event.close,
            ma = event.ma,
            trend = %event.trend,
            "MA cross"
        );
        Some(event)
    }
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> &str {
        "MaCrossStrategy"
    }

    fn warmup_period(&self) -> usize {
        self.config.ma_period.max(self.config.volume_period) + 1
    }

    fn on_candle(&self, dataframe: &Dataframe) -> Result<()> {
        let input = CrossInput::from_dataframe(dataframe, &self.config)?;
        if let Some(event) = self.evaluate(dataframe.key(), &input) {
            self.alerts.send(event.message());
        }
        Ok(())
    }
}
