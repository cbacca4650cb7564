pub mod rules;
pub mod watchdog;

pub use rules::RulesEngine;
pub use watchdog::{Watchdog, WatchdogReport};
