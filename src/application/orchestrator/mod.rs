pub mod runner;
pub mod scanner;
pub mod stages;

pub use runner::CycleRunner;
pub use scanner::UniverseScanner;
pub use stages::{NewsStage, PatternStage, StageEval, TechnicalStage, apply_stage_policy};
