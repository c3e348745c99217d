// Rolling per-pair candle storage
pub mod dataframe;
pub mod series;

pub use dataframe::{CandleAttribute, Dataframe, FrameSnapshot, FrameUpdate, FrameWindow};
pub use series::Series;
