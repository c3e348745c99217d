use super::series::Series;
use crate::models::{Candle, SeriesKey};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleAttribute {
    Open,
    High,
    Low,
    Close,
    Volume,
}

/// What `Dataframe::apply` did with a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUpdate {
    /// New bar slot appended
    Appended,
    /// Last bar revised in place
    Updated,
    /// Same open time as the last bar while in-place updates are disallowed
    Duplicate,
    /// Open time older than the last bar
    Stale,
}

/// Point-in-time copy of a dataframe's columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSnapshot {
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub time: Vec<DateTime<Utc>>,
}

/// Trailing close and volume windows plus the newest bar time, read together
#[derive(Debug, Clone, PartialEq)]
pub struct FrameWindow {
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Columns {
    open: Series,
    high: Series,
    low: Series,
    close: Series,
    volume: Series,
    time: Vec<DateTime<Utc>>,
}

impl Columns {
    fn series(&self, attribute: CandleAttribute) -> &Series {
        match attribute {
            CandleAttribute::Open => &self.open,
            CandleAttribute::High => &self.high,
            CandleAttribute::Low => &self.low,
            CandleAttribute::Close => &self.close,
            CandleAttribute::Volume => &self.volume,
        }
    }

    fn push(&mut self, candle: &Candle) {
        self.open.push(candle.open);
        self.high.push(candle.high);
        self.low.push(candle.low);
        self.close.push(candle.close);
        self.volume.push(candle.volume);
        self.time.push(candle.time);
    }

    fn update_last(&mut self, candle: &Candle) -> bool {
        let Some(last_time) = self.time.last_mut() else {
            return false;
        };
        *last_time = candle.time;
        self.open.update_last(candle.open);
        self.high.update_last(candle.high);
        self.low.update_last(candle.low);
        self.close.update_last(candle.close);
        self.volume.update_last(candle.volume);
        true
    }
}

/// Rolling OHLCV columns for one (symbol, timeframe) pair
///
/// All columns always have the same length; index `i` is the same bar in
/// every column. A single `RwLock` serializes mutation against reads.
#[derive(Debug)]
pub struct Dataframe {
    key: SeriesKey,
    columns: RwLock<Columns>,
}

impl Dataframe {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            columns: RwLock::new(Columns::default()),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn symbol(&self) -> &str {
        &self.key.symbol
    }

    pub fn timeframe(&self) -> &str {
        &self.key.timeframe
    }

    // Column writes never panic midway, poison carries no torn state.
    fn read(&self) -> RwLockReadGuard<'_, Columns> {
        self.columns.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Columns> {
        self.columns.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open time of the newest bar
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.read().time.last().copied()
    }

    /// True if the candle revises the newest bar
    pub fn is_last_candle(&self, candle: &Candle) -> bool {
        self.last_time() == Some(candle.time)
    }

    /// Append a new bar
    pub fn add_candle(&self, candle: &Candle) {
        self.write().push(candle);
    }

    /// Overwrite the newest bar. Returns false on an empty dataframe.
    pub fn update_last(&self, candle: &Candle) -> bool {
        self.write().update_last(candle)
    }

    /// Append or revise under a single write lock
    ///
    /// A candle with the newest bar's open time revises it when
    /// `allow_update` is set and is reported as `Duplicate` otherwise.
    /// Candles older than the newest bar are rejected as `Stale`.
    pub fn apply(&self, candle: &Candle, allow_update: bool) -> FrameUpdate {
        let mut columns = self.write();

        match columns.time.last() {
            Some(last) if candle.time < *last => FrameUpdate::Stale,
            Some(last) if candle.time == *last => {
                if allow_update {
                    columns.update_last(candle);
                    FrameUpdate::Updated
                } else {
                    FrameUpdate::Duplicate
                }
            }
            _ => {
                columns.push(candle);
                FrameUpdate::Appended
            }
        }
    }

    /// The `n` most recent values of an attribute, oldest first
    pub fn last_values(&self, attribute: CandleAttribute, n: usize) -> Result<Vec<f64>> {
        let columns = self.read();
        columns
            .series(attribute)
            .last_values(n)
            .map(<[f64]>::to_vec)
            .map_err(|_| Error::insufficient(self.key.to_string(), n, columns.time.len()))
    }

    /// Value `offset` bars back from the newest
    pub fn last(&self, attribute: CandleAttribute, offset: usize) -> Option<f64> {
        self.read().series(attribute).last(offset)
    }

    /// The last `close_len` closes, the last `volume_len` volumes and the
    /// newest bar time, all from the same revision of the frame
    pub fn window(&self, close_len: usize, volume_len: usize) -> Result<FrameWindow> {
        let columns = self.read();
        let needed = close_len.max(volume_len).max(1);
        let insufficient = || Error::insufficient(self.key.to_string(), needed, columns.time.len());

        let time = columns.time.last().copied().ok_or_else(insufficient)?;
        let close = columns.close.last_values(close_len).map_err(|_| insufficient())?;
        let volume = columns.volume.last_values(volume_len).map_err(|_| insufficient())?;

        Ok(FrameWindow {
            close: close.to_vec(),
            volume: volume.to_vec(),
            time,
        })
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        let columns = self.read();
        FrameSnapshot {
            open: columns.open.as_slice().to_vec(),
            high: columns.high.as_slice().to_vec(),
            low: columns.low.as_slice().to_vec(),
            close: columns.close.as_slice().to_vec(),
            volume: columns.volume.as_slice().to_vec(),
            time: columns.time.clone(),
        }
    }
}
