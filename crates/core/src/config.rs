use std::path::Path;

use serde::Deserialize;

use crate::error::{AttributionError, EngineResult};
use crate::types::{ConversionWeighting, ModelKind};

/// Channel counts above this cannot be represented as coalition bitmasks.
pub const MAX_SHAPLEY_PLAYERS: usize = 63;

/// Root attribution configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `ATTRIBUTION__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_models")]
    pub models: Vec<ModelKind>,
    #[serde(default)]
    pub columns: ColumnMapping,
    #[serde(default)]
    pub conversion_weighting: ConversionWeighting,
    #[serde(default)]
    pub per_journey: bool,
    #[serde(default)]
    pub position_based: PositionBasedConfig,
    #[serde(default)]
    pub time_decay: TimeDecayConfig,
    #[serde(default)]
    pub markov: MarkovConfig,
    #[serde(default)]
    pub shapley: ShapleyConfig,
}

/// Names of the input columns the journey builder reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    #[serde(default = "default_customer_id_col")]
    pub customer_id: String,
    #[serde(default = "default_timestamp_col")]
    pub timestamp: String,
    #[serde(default = "default_channel_col")]
    pub channel: String,
    #[serde(default = "default_conversion_col")]
    pub conversion: String,
    #[serde(default = "default_cost_col")]
    pub cost: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionBasedConfig {
    #[serde(default = "default_edge_weight")]
    pub first_weight: f64,
    #[serde(default = "default_edge_weight")]
    pub last_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeDecayConfig {
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkovConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShapleyConfig {
    /// Largest coalition size enumerated. `None` means exact when the
    /// channel count allows it.
    #[serde(default)]
    pub max_combination_size: Option<usize>,
    /// Without an explicit cap, channel counts above this are approximated
    /// using it as the cap.
    #[serde(default = "default_exact_channel_threshold")]
    pub exact_channel_threshold: usize,
    /// Without an explicit cap, channel counts above this are refused.
    #[serde(default = "default_channel_ceiling")]
    pub channel_ceiling: usize,
}

// Default functions
fn default_models() -> Vec<ModelKind> {
    ModelKind::ALL.to_vec()
}
fn default_customer_id_col() -> String {
    "customer_id".to_string()
}
fn default_timestamp_col() -> String {
    "timestamp".to_string()
}
fn default_channel_col() -> String {
    "channel".to_string()
}
fn default_conversion_col() -> String {
    "is_conversion".to_string()
}
fn default_cost_col() -> Option<String> {
    Some("cost".to_string())
}
fn default_edge_weight() -> f64 {
    0.4
}
fn default_half_life_days() -> f64 {
    7.0
}
fn default_tolerance() -> f64 {
    1e-9
}
fn default_max_iterations() -> usize {
    10_000
}
fn default_exact_channel_threshold() -> usize {
    12
}
fn default_channel_ceiling() -> usize {
    20
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            customer_id: default_customer_id_col(),
            timestamp: default_timestamp_col(),
            channel: default_channel_col(),
            conversion: default_conversion_col(),
            cost: default_cost_col(),
        }
    }
}

impl Default for PositionBasedConfig {
    fn default() -> Self {
        Self {
            first_weight: default_edge_weight(),
            last_weight: default_edge_weight(),
        }
    }
}

impl Default for TimeDecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
        }
    }
}

impl Default for MarkovConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl Default for ShapleyConfig {
    fn default() -> Self {
        Self {
            max_combination_size: None,
            exact_channel_threshold: default_exact_channel_threshold(),
            channel_ceiling: default_channel_ceiling(),
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            columns: ColumnMapping::default(),
            conversion_weighting: ConversionWeighting::default(),
            per_journey: false,
            position_based: PositionBasedConfig::default(),
            time_decay: TimeDecayConfig::default(),
            markov: MarkovConfig::default(),
            shapley: ShapleyConfig::default(),
        }
    }
}

impl PositionBasedConfig {
    pub fn validate(&self) -> EngineResult<()> {
        for (name, weight) in [("first_weight", self.first_weight), ("last_weight", self.last_weight)] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(AttributionError::Config(format!(
                    "position_based.{name} must be within [0, 1], got {weight}"
                )));
            }
        }
        if self.first_weight + self.last_weight > 1.0 + 1e-12 {
            return Err(AttributionError::Config(format!(
                "position_based weights sum to {} which exceeds 1",
                self.first_weight + self.last_weight
            )));
        }
        Ok(())
    }
}

impl TimeDecayConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.half_life_days.is_finite() && self.half_life_days > 0.0) {
            return Err(AttributionError::Config(format!(
                "time_decay.half_life_days must be positive, got {}",
                self.half_life_days
            )));
        }
        Ok(())
    }
}

impl MarkovConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(AttributionError::Config(format!(
                "markov.tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(AttributionError::Config(
                "markov.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ShapleyConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_combination_size == Some(0) {
            return Err(AttributionError::Config(
                "shapley.max_combination_size must be at least 1".to_string(),
            ));
        }
        if self.exact_channel_threshold == 0 {
            return Err(AttributionError::Config(
                "shapley.exact_channel_threshold must be at least 1".to_string(),
            ));
        }
        if self.channel_ceiling < self.exact_channel_threshold {
            return Err(AttributionError::Config(format!(
                "shapley.channel_ceiling ({}) is below exact_channel_threshold ({})",
                self.channel_ceiling, self.exact_channel_threshold
            )));
        }
        if self.channel_ceiling > MAX_SHAPLEY_PLAYERS {
            return Err(AttributionError::Config(format!(
                "shapley.channel_ceiling cannot exceed {MAX_SHAPLEY_PLAYERS}"
            )));
        }
        Ok(())
    }
}

impl AttributionConfig {
    /// Load configuration from an optional TOML file overlaid with
    /// environment variables, then validate it.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ATTRIBUTION")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("models"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject option combinations no model can run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.models.is_empty() {
            return Err(AttributionError::Config(
                "at least one model must be selected".to_string(),
            ));
        }
        for (name, column) in [
            ("customer_id", &self.columns.customer_id),
            ("timestamp", &self.columns.timestamp),
            ("channel", &self.columns.channel),
            ("conversion", &self.columns.conversion),
        ] {
            if column.trim().is_empty() {
                return Err(AttributionError::Config(format!(
                    "columns.{name} must name a column"
                )));
            }
        }
        self.position_based.validate()?;
        self.time_decay.validate()?;
        self.markov.validate()?;
        self.shapley.validate()?;
        Ok(())
    }
}
