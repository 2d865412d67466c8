pub mod candles;
pub mod confluence;
pub mod database;
pub mod flags;
pub mod sweeps;
pub mod swings;
pub mod trades;

pub use candles::{CandleRepository, InsertOutcome};
pub use confluence::ConfluenceRepository;
pub use database::Database;
pub use flags::FlagsRepository;
pub use sweeps::{EmittedSweep, SweepRepository};
pub use swings::SwingRepository;
pub use trades::{NewTrade, TradeRepository};
