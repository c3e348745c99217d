// Alert strategies and the controller feeding them
pub mod controller;
pub mod cross_state;
pub mod ma_cross;

pub use controller::StrategyController;
pub use cross_state::{transition, MaState, MaTrend, Signal, Transition};
pub use ma_cross::{CrossEvent, CrossInput, MaCrossConfig, MaCrossStrategy};

use crate::data::Dataframe;
use crate::Result;

/// Base trait for candle-driven strategies
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Bars a dataframe must hold before `on_candle` is called
    fn warmup_period(&self) -> usize;

    /// Evaluate the latest bar of `dataframe`
    ///
    /// Called synchronously from the candle feed, once per accepted candle.
    fn on_candle(&self, dataframe: &Dataframe) -> Result<()>;
}
