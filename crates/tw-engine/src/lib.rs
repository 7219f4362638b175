// Tradewind backtesting engine: run orchestration, per-bar dispatch,
// result persistence.

pub mod dispatch;
pub mod host;
pub mod orchestrator;
pub mod persist;
pub mod stats;
pub mod stores;

pub use host::HostApi;
pub use orchestrator::{expand_pattern, Backtest, LifecycleCallbacks, NamedConfig, NoopCallbacks};
pub use persist::{write_stats, RunWriters};
pub use stats::{compute_stats, StrategyIdent, TradeResult, TradeStats};
pub use stores::{LogStore, MarkStore};
