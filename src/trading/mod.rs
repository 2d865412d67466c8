pub mod executor;
pub mod monitor;

pub use executor::TradeExecutor;
pub use monitor::{MonitorEvent, TradeMonitor};
