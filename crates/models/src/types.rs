use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use attribution_core::{AttributionResult, ModelKind};

/// Credit one rule-based model gave a single journey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JourneyAttribution {
    pub customer_id: String,
    pub converted: bool,
    pub credits: AttributionResult,
}

/// How a Shapley result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ShapleyMethod {
    /// Every coalition enumerated; efficiency and symmetry hold exactly.
    Exact,
    /// Only coalitions up to `max_subset_size` other channels were
    /// enumerated and the size weights renormalized. Not axiom-exact.
    TruncatedApproximation { max_subset_size: usize },
}

impl ShapleyMethod {
    pub fn is_approximate(&self) -> bool {
        matches!(self, ShapleyMethod::TruncatedApproximation { .. })
    }
}

/// Model-specific diagnostics kept alongside the credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ModelDetails {
    RuleBased,
    Markov {
        /// Probability of reaching conversion from the start state.
        conversion_probability: f64,
        removal_effects: BTreeMap<String, f64>,
        transition_probabilities: BTreeMap<String, BTreeMap<String, f64>>,
        iterations: usize,
    },
    Shapley {
        method: ShapleyMethod,
        /// Raw Shapley values before scaling to conversions.
        values: BTreeMap<String, f64>,
        /// v(all channels) - v(no channels).
        grand_coalition_value: f64,
        coalitions_evaluated: usize,
    },
}

/// The output of one model over all journeys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAttribution {
    pub model: ModelKind,
    pub aggregate: AttributionResult,
    /// Conversion weight the aggregate distributes.
    pub total_conversions: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_journey: Option<Vec<JourneyAttribution>>,
    pub details: ModelDetails,
}
