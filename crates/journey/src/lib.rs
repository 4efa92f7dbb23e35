//! Journey construction — turns flat, unordered touchpoint events into one
//! time-ordered journey per customer, plus descriptive journey statistics.

pub mod analysis;
pub mod builder;
pub mod table;

pub use analysis::JourneyStats;
pub use builder::{BuildOutput, BuildReport, JourneyBuilder};
pub use table::EventTable;
