//! Shared data model, error taxonomy, and configuration for multi-touch
//! attribution.

pub mod config;
pub mod error;
pub mod types;

pub use config::AttributionConfig;
pub use error::{AttributionError, EngineResult};
pub use types::{AttributionResult, ConversionWeighting, Journey, ModelKind, Touchpoint};
