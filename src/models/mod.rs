//! Data models for positions, maintenance records, anchors, and extremes.

mod anchor;
mod extremes;
mod maintenance;
mod position;

pub use anchor::{AnchorPosition, AnchorStatus};
pub use extremes::{ExtremeUpdate, ProfitExtremes};
pub use maintenance::MaintenanceRecord;
pub use position::{PosSide, Position, PositionKey};
