pub mod indicators;
pub mod position_monitor;

pub use indicators::{IndicatorService, IndicatorSnapshot};
pub use position_monitor::PositionMonitor;
