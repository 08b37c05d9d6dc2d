//! Timer-driven refresh of data sources.

mod interval;
mod scheduler;

pub use interval::{FixedInterval, GameIntervals, GameSnapshot, GameState, IntervalPolicy};
pub use scheduler::{RefreshScheduler, RefreshSource, RefreshStatus, SchedulerState};
