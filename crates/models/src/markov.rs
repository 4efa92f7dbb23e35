//! Markov-chain attribution — a first-order transition graph over channels
//! with Start, Conversion, and Null states, scored by removal effect.

use std::collections::BTreeMap;
use std::time::Instant;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use attribution_core::config::{AttributionConfig, MarkovConfig};
use attribution_core::{
    AttributionError, AttributionResult, ConversionWeighting, EngineResult, Journey, ModelKind,
};

use crate::types::{ModelAttribution, ModelDetails};

pub const START_STATE: &str = "(start)";
pub const CONVERSION_STATE: &str = "(conversion)";
pub const NULL_STATE: &str = "(null)";

/// Row-stochastic transition matrix estimated from observed journeys.
///
/// State layout: `0` is Start, `1..=n` are the channels in sorted order,
/// `n + 1` is Conversion and `n + 2` is Null. Conversion and Null are
/// absorbing and have no outgoing edges.
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    channels: Vec<String>,
    counts: Array2<f64>,
    probabilities: Array2<f64>,
}

impl TransitionGraph {
    /// Counts every consecutive transition, including the implicit
    /// Start -> first touch and last touch -> Conversion/Null edges.
    /// Converting journeys stop at their conversion.
    pub fn from_journeys(journeys: &[Journey]) -> Self {
        let mut channels: Vec<String> = journeys
            .iter()
            .flat_map(|j| j.touchpoints_until_conversion())
            .map(|t| t.channel.clone())
            .collect();
        channels.sort();
        channels.dedup();

        let states = channels.len() + 3;
        let conversion = channels.len() + 1;
        let null = channels.len() + 2;
        let mut counts = Array2::<f64>::zeros((states, states));

        for journey in journeys {
            let mut prev = 0;
            for touch in journey.touchpoints_until_conversion() {
                // Present by construction of `channels`.
                let idx = channels.binary_search(&touch.channel).map_or(0, |i| i + 1);
                counts[[prev, idx]] += 1.0;
                prev = idx;
            }
            let end = if journey.converted() { conversion } else { null };
            counts[[prev, end]] += 1.0;
        }

        let mut probabilities = Array2::<f64>::zeros((states, states));
        for (i, row) in counts.outer_iter().enumerate() {
            let total = row.sum();
            if total > 0.0 {
                for (j, count) in row.iter().enumerate() {
                    probabilities[[i, j]] = count / total;
                }
            }
        }

        Self {
            channels,
            counts,
            probabilities,
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn state_count(&self) -> usize {
        self.channels.len() + 3
    }

    pub fn conversion_index(&self) -> usize {
        self.channels.len() + 1
    }

    pub fn null_index(&self) -> usize {
        self.channels.len() + 2
    }

    pub fn state_name(&self, idx: usize) -> &str {
        match idx {
            0 => START_STATE,
            i if i == self.conversion_index() => CONVERSION_STATE,
            i if i == self.null_index() => NULL_STATE,
            i => &self.channels[i - 1],
        }
    }

    pub fn probability(&self, from: usize, to: usize) -> f64 {
        self.probabilities[[from, to]]
    }

    /// Observed transitions into a state.
    pub fn incoming(&self, idx: usize) -> f64 {
        self.counts.column(idx).sum()
    }

    /// Non-zero transition probabilities keyed by state name.
    pub fn probability_table(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        let mut table = BTreeMap::new();
        for (i, row) in self.probabilities.outer_iter().enumerate() {
            let edges: BTreeMap<String, f64> = row
                .iter()
                .enumerate()
                .filter(|(_, p)| **p > 0.0)
                .map(|(j, p)| (self.state_name(j).to_string(), *p))
                .collect();
            if !edges.is_empty() {
                table.insert(self.state_name(i).to_string(), edges);
            }
        }
        table
    }

    /// Transition matrix with absorbing self-loops and, when `removed` is
    /// given, that channel excised: mass headed into it goes to Null.
    fn absorbing_matrix(&self, removed: Option<usize>) -> Array2<f64> {
        let mut matrix = self.probabilities.clone();
        let conversion = self.conversion_index();
        let null = self.null_index();

        if let Some(c) = removed {
            for i in 0..self.state_count() {
                let redirected = matrix[[i, c]];
                if redirected > 0.0 {
                    matrix[[i, c]] = 0.0;
                    matrix[[i, null]] += redirected;
                }
            }
            matrix.row_mut(c).fill(0.0);
            matrix[[c, null]] = 1.0;
        }

        matrix[[conversion, conversion]] = 1.0;
        matrix[[null, null]] = 1.0;
        matrix
    }

    /// Probability of absorbing into Conversion from Start, by iterating
    /// the state distribution until the mass left in transient states
    /// drops below the tolerance.
    pub fn conversion_probability(&self, removed: Option<usize>, config: &MarkovConfig) -> Absorption {
        let matrix = self.absorbing_matrix(removed);
        let conversion = self.conversion_index();
        let mut dist = Array1::<f64>::zeros(self.state_count());
        dist[0] = 1.0;

        let mut iterations = 0;
        let mut residual = 1.0;
        while iterations < config.max_iterations {
            dist = dist.dot(&matrix);
            iterations += 1;
            residual = dist.iter().take(conversion).sum();
            if residual < config.tolerance {
                break;
            }
        }

        if residual >= config.tolerance {
            warn!(
                iterations,
                residual, "Markov absorption did not converge within the iteration bound"
            );
        }

        Absorption {
            probability: dist[conversion],
            iterations,
            residual,
        }
    }
}

/// Result of propagating the chain to absorption.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Absorption {
    pub probability: f64,
    pub iterations: usize,
    /// Mass still in transient states when iteration stopped.
    pub residual: f64,
}

/// Attributes conversions to channels by how much the overall conversion
/// probability drops when each channel is removed from the graph.
#[derive(Debug, Clone, Default)]
pub struct MarkovChainAllocator {
    config: MarkovConfig,
    weighting: ConversionWeighting,
}

impl MarkovChainAllocator {
    pub fn new(config: MarkovConfig, weighting: ConversionWeighting) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config, weighting })
    }

    pub fn from_config(config: &AttributionConfig) -> EngineResult<Self> {
        Self::new(config.markov.clone(), config.conversion_weighting)
    }

    /// Aggregate attribution over all journeys. Fails with
    /// `DegenerateModel` when nothing ever converts.
    pub fn run(&self, journeys: &[Journey]) -> EngineResult<ModelAttribution> {
        let started = Instant::now();
        let graph = TransitionGraph::from_journeys(journeys);
        let baseline = graph.conversion_probability(None, &self.config);
        debug!(
            states = graph.state_count(),
            iterations = baseline.iterations,
            residual = baseline.residual,
            "Solved baseline conversion probability"
        );

        if baseline.probability <= 0.0 {
            return Err(AttributionError::DegenerateModel(
                "no journey reaches conversion, so removal effects are undefined".to_string(),
            ));
        }

        // Removals are independent; collecting keeps channel order.
        let effects: Vec<f64> = (1..=graph.channels().len())
            .into_par_iter()
            .map(|idx| {
                if graph.incoming(idx) == 0.0 {
                    return 0.0;
                }
                let without = graph.conversion_probability(Some(idx), &self.config);
                ((baseline.probability - without.probability) / baseline.probability).max(0.0)
            })
            .collect();

        let total_conversions: f64 = journeys
            .iter()
            .map(|j| j.conversion_weight(self.weighting))
            .sum();
        let effect_sum: f64 = effects.iter().sum();

        let mut aggregate = AttributionResult::new();
        let mut removal_effects = BTreeMap::new();
        for (channel, effect) in graph.channels().iter().zip(&effects) {
            let credit = if effect_sum > 0.0 {
                effect / effect_sum * total_conversions
            } else {
                0.0
            };
            aggregate.add(channel, credit);
            removal_effects.insert(channel.clone(), *effect);
        }

        info!(
            model = %ModelKind::MarkovChain,
            channels = graph.channels().len(),
            conversion_probability = baseline.probability,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Markov attribution complete"
        );

        Ok(ModelAttribution {
            model: ModelKind::MarkovChain,
            aggregate,
            total_conversions,
            per_journey: None,
            details: ModelDetails::Markov {
                conversion_probability: baseline.probability,
                removal_effects,
                transition_probabilities: graph.probability_table(),
                iterations: baseline.iterations,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attribution_core::Touchpoint;
    use chrono::{Duration, TimeZone, Utc};

    fn journey(id: &str, channels: &[&str], converts: bool) -> Journey {
        let start = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let last = channels.len() - 1;
        let touches = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                let touch = Touchpoint::new(id, *ch, start + Duration::hours(i as i64));
                if converts && i == last {
                    touch.converting()
                } else {
                    touch
                }
            })
            .collect();
        Journey::new(id, touches).unwrap()
    }

    fn sample() -> Vec<Journey> {
        vec![
            journey("1", &["search", "email"], true),
            journey("2", &["search", "display"], false),
            journey("3", &["display", "email"], true),
            journey("4", &["email"], false),
            journey("5", &["search", "search", "email"], true),
        ]
    }

    #[test]
    fn test_graph_rows_are_stochastic() {
        let graph = TransitionGraph::from_journeys(&sample());
        assert_eq!(graph.channels(), ["display", "email", "search"]);
        for i in 0..graph.conversion_index() {
            let row: f64 = (0..graph.state_count()).map(|j| graph.probability(i, j)).sum();
            assert!((row - 1.0).abs() < 1e-12, "row {} sums to {}", graph.state_name(i), row);
        }
        for absorbing in [graph.conversion_index(), graph.null_index()] {
            let row: f64 = (0..graph.state_count()).map(|j| graph.probability(absorbing, j)).sum();
            assert_eq!(row, 0.0);
        }
    }

    #[test]
    fn test_self_loops_counted() {
        let graph = TransitionGraph::from_journeys(&sample());
        let search = 3;
        assert_eq!(graph.state_name(search), "search");
        // search -> search once, search -> email twice, search -> display once
        assert!((graph.probability(search, search) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_baseline_matches_observed_conversion_rate_for_linear_paths() {
        let journeys = vec![
            journey("1", &["a"], true),
            journey("2", &["a"], false),
            journey("3", &["a"], true),
            journey("4", &["a"], true),
        ];
        let graph = TransitionGraph::from_journeys(&journeys);
        let absorption = graph.conversion_probability(None, &MarkovConfig::default());
        assert!((absorption.probability - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_credit_sums_to_conversions_and_effects_non_negative() {
        let result = MarkovChainAllocator::default().run(&sample()).unwrap();
        assert!((result.aggregate.total() - 3.0).abs() < 1e-6);
        assert_eq!(result.total_conversions, 3.0);

        let ModelDetails::Markov { removal_effects, .. } = &result.details else {
            panic!("expected markov details");
        };
        assert!(removal_effects.values().all(|r| *r >= 0.0));
        // email sits on every converting path.
        assert!((removal_effects["email"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_channel_gets_everything() {
        let journeys = vec![journey("1", &["a", "a"], true), journey("2", &["a"], false)];
        let result = MarkovChainAllocator::default().run(&journeys).unwrap();
        assert!((result.aggregate.credit("a") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_conversions_is_degenerate() {
        let journeys = vec![journey("1", &["a", "b"], false)];
        assert!(matches!(
            MarkovChainAllocator::default().run(&journeys),
            Err(AttributionError::DegenerateModel(_))
        ));
        assert!(matches!(
            MarkovChainAllocator::default().run(&[]),
            Err(AttributionError::DegenerateModel(_))
        ));
    }

    #[test]
    fn test_runs_are_bit_identical() {
        let first = MarkovChainAllocator::default().run(&sample()).unwrap();
        let second = MarkovChainAllocator::default().run(&sample()).unwrap();
        assert_eq!(first.aggregate, second.aggregate);
    }
}
