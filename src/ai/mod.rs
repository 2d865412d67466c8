pub mod adapter;
pub mod client;

pub use adapter::{AdvisorVerdict, MarketConditions, RawDecision, SetupSnapshot, TradeAdvisor};
pub use client::LlmClient;
