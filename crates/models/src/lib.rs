//! Credit allocation for multi-touch attribution — rule-based heuristics,
//! Markov-chain removal effects, and Shapley values, compared side by side.

pub mod comparator;
pub mod engine;
pub mod markov;
pub mod rule_based;
pub mod shapley;
pub mod types;

pub use comparator::{ComparisonRow, ComparisonTable, ModelComparator};
pub use engine::{AttributionEngine, AttributionRun};
pub use markov::{MarkovChainAllocator, TransitionGraph};
pub use rule_based::RuleBasedAllocator;
pub use shapley::{CoalitionValueFunction, ShapleyValueAllocator};
pub use types::{JourneyAttribution, ModelAttribution, ModelDetails, ShapleyMethod};
