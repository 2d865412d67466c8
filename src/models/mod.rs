pub mod candle;
pub mod direction;
pub mod entities;
pub mod timeframe;

pub use candle::{Candle, CandleSeries};
pub use direction::*;
pub use entities::{ConfluenceState, Sweep, SwingLevel, SwingStop, Trade};
pub use timeframe::Timeframe;
