pub mod monitor;
pub mod validator;

pub use monitor::{RiskMonitor, RiskTickOutcome};
pub use validator::{RiskValidator, ValidationOutcome};
