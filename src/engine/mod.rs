//! Control loops: take-profit rules, anchor auto-opening, extremes
//! tracking, and the process-wide configuration they share.

mod auto_opener;
mod config;
mod extremes_tracker;
mod take_profit;

pub use auto_opener::{AutoOpener, OpenEvent};
pub use config::KeeperConfig;
pub use extremes_tracker::ExtremesTracker;
pub use take_profit::{TakeProfitEngine, TakeProfitEvent, TakeProfitRule};
