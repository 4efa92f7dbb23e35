use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use attribution_core::{AttributionConfig, AttributionResult, EngineResult, Journey, ModelKind};

use crate::comparator::{ComparisonTable, ModelComparator};
use crate::markov::MarkovChainAllocator;
use crate::rule_based::RuleBasedAllocator;
use crate::shapley::ShapleyValueAllocator;
use crate::types::ModelAttribution;

/// Outcome of running a set of models over the same journeys. A model that
/// failed is listed under `failures` and never hides its siblings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionRun {
    pub run_id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub journeys: usize,
    pub results: BTreeMap<ModelKind, ModelAttribution>,
    pub failures: BTreeMap<ModelKind, String>,
}

impl AttributionRun {
    pub fn aggregates(&self) -> BTreeMap<ModelKind, AttributionResult> {
        self.results
            .iter()
            .map(|(model, result)| (*model, result.aggregate.clone()))
            .collect()
    }

    /// Comparison table over the models that succeeded.
    pub fn comparison(&self) -> EngineResult<ComparisonTable> {
        ModelComparator::compare(&self.aggregates())
    }
}

/// Runs the configured models against immutable journeys. Holds only
/// validated configuration; every call is independent.
#[derive(Debug, Clone)]
pub struct AttributionEngine {
    config: AttributionConfig,
    rule_based: RuleBasedAllocator,
    markov: MarkovChainAllocator,
    shapley: ShapleyValueAllocator,
}

impl AttributionEngine {
    pub fn new(config: AttributionConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            rule_based: RuleBasedAllocator::from_config(&config)?,
            markov: MarkovChainAllocator::from_config(&config)?,
            shapley: ShapleyValueAllocator::from_config(&config)?,
            config,
        })
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }

    pub fn run_model(&self, model: ModelKind, journeys: &[Journey]) -> EngineResult<ModelAttribution> {
        match model {
            ModelKind::MarkovChain => self.markov.run(journeys),
            ModelKind::Shapley => self.shapley.run(journeys),
            rule => self.rule_based.run(rule, journeys, self.config.per_journey),
        }
    }

    /// Runs every configured model, each isolated from the others' errors.
    pub fn run(&self, journeys: &[Journey]) -> AttributionRun {
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            journeys = journeys.len(),
            models = self.config.models.len(),
            "Starting attribution run"
        );

        let mut results = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for model in &self.config.models {
            match self.run_model(*model, journeys) {
                Ok(result) => {
                    results.insert(*model, result);
                }
                Err(e) => {
                    error!(run_id = %run_id, model = %model, error = %e, "Attribution model failed");
                    failures.insert(*model, e.to_string());
                }
            }
        }

        AttributionRun {
            run_id,
            computed_at: Utc::now(),
            journeys: journeys.len(),
            results,
            failures,
        }
    }
}
