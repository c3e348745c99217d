pub mod candle;
pub mod symbols;

pub use candle::{CandleConsumer, CandleController, RetryPolicy};
pub use symbols::SymbolsController;
