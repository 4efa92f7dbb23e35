//! Shapley-value attribution — channels are players in a cooperative game
//! whose coalition value is the share of journeys converting using only
//! channels inside the coalition.
//!
//! Exact enumeration is exponential in the channel count. Past the
//! configured cap the allocator enumerates only small coalitions and
//! reports the result as [`ShapleyMethod::TruncatedApproximation`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use dashmap::DashMap;
use rayon::prelude::*;
use tracing::{info, warn};

use attribution_core::config::{AttributionConfig, ShapleyConfig, MAX_SHAPLEY_PLAYERS};
use attribution_core::{
    AttributionError, AttributionResult, ConversionWeighting, EngineResult, Journey, ModelKind,
};

use crate::types::{ModelAttribution, ModelDetails, ShapleyMethod};

/// Coalitions are bitmasks over the sorted player list.
pub type Coalition = u64;

/// v(S) = (conversion weight of converting journeys whose channel set is a
/// subset of S) / (number of journeys).
///
/// Monotone by construction, so every marginal contribution is
/// non-negative. Values are memoized per coalition and safe to share
/// across worker threads.
#[derive(Debug)]
pub struct CoalitionValueFunction {
    /// Distinct channel sets of converting journeys with their summed
    /// weight, ordered by mask.
    converting_sets: Vec<(Coalition, f64)>,
    journeys: usize,
    memo: DashMap<Coalition, f64>,
}

impl CoalitionValueFunction {
    pub fn new(players: &[String], journeys: &[Journey], weighting: ConversionWeighting) -> Self {
        let mut sets: BTreeMap<Coalition, f64> = BTreeMap::new();
        for journey in journeys.iter().filter(|j| j.converted()) {
            let mask = journey
                .touchpoints_until_conversion()
                .iter()
                .filter_map(|t| players.binary_search(&t.channel).ok())
                .fold(0, |mask: Coalition, idx| mask | (1 << idx));
            *sets.entry(mask).or_insert(0.0) += journey.conversion_weight(weighting);
        }

        Self {
            converting_sets: sets.into_iter().collect(),
            journeys: journeys.len(),
            memo: DashMap::new(),
        }
    }

    pub fn value(&self, coalition: Coalition) -> f64 {
        if let Some(v) = self.memo.get(&coalition) {
            return *v;
        }
        let v = if self.journeys == 0 {
            0.0
        } else {
            let covered: f64 = self
                .converting_sets
                .iter()
                .filter(|(set, _)| set & !coalition == 0)
                .map(|(_, weight)| weight)
                .sum();
            covered / self.journeys as f64
        };
        self.memo.insert(coalition, v);
        v
    }

    /// Coalitions evaluated so far.
    pub fn evaluated(&self) -> usize {
        self.memo.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShapleyValueAllocator {
    config: ShapleyConfig,
    weighting: ConversionWeighting,
}

impl ShapleyValueAllocator {
    pub fn new(config: ShapleyConfig, weighting: ConversionWeighting) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self { config, weighting })
    }

    pub fn from_config(config: &AttributionConfig) -> EngineResult<Self> {
        Self::new(config.shapley.clone(), config.conversion_weighting)
    }

    /// Decides between exact enumeration and the truncated approximation
    /// for `players` channels.
    pub fn method_for(&self, players: usize) -> EngineResult<ShapleyMethod> {
        if players > MAX_SHAPLEY_PLAYERS {
            return Err(AttributionError::IntractableModel {
                channels: players,
                ceiling: MAX_SHAPLEY_PLAYERS,
            });
        }
        let others = players.saturating_sub(1);
        let cap = match self.config.max_combination_size {
            Some(cap) => cap,
            None if players <= self.config.channel_ceiling => self.config.exact_channel_threshold,
            None => {
                return Err(AttributionError::IntractableModel {
                    channels: players,
                    ceiling: self.config.channel_ceiling,
                })
            }
        };
        // A cap covering every other player enumerates all coalitions.
        if cap >= others {
            Ok(ShapleyMethod::Exact)
        } else {
            Ok(ShapleyMethod::TruncatedApproximation {
                max_subset_size: cap,
            })
        }
    }

    pub fn run(&self, journeys: &[Journey]) -> EngineResult<ModelAttribution> {
        let started = Instant::now();
        let players: Vec<String> = journeys
            .iter()
            .flat_map(|j| j.touchpoints())
            .map(|t| t.channel.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let n = players.len();
        let method = self.method_for(n)?;
        if let ShapleyMethod::TruncatedApproximation { max_subset_size } = method {
            warn!(
                channels = n,
                max_subset_size, "Shapley values approximated over truncated coalitions"
            );
        }

        let game = CoalitionValueFunction::new(&players, journeys, self.weighting);
        let max_subset_size = match method {
            ShapleyMethod::Exact => n.saturating_sub(1),
            ShapleyMethod::TruncatedApproximation { max_subset_size } => max_subset_size,
        };
        let weights = size_weights(n, max_subset_size);

        // One player per task; each sums its coalitions in a fixed order.
        let values: Vec<f64> = (0..n)
            .into_par_iter()
            .map(|player| player_value(&game, n, player, &weights))
            .collect();

        let grand = if n == 0 { 0 } else { full_coalition(n) };
        let grand_coalition_value = game.value(grand) - game.value(0);
        let total_conversions: f64 = journeys
            .iter()
            .map(|j| j.conversion_weight(self.weighting))
            .sum();
        let value_sum: f64 = values.iter().sum();

        let mut aggregate = AttributionResult::new();
        let mut raw = BTreeMap::new();
        for (channel, value) in players.iter().zip(&values) {
            let credit = if value_sum > 0.0 {
                value / value_sum * total_conversions
            } else {
                0.0
            };
            aggregate.add(channel, credit);
            raw.insert(channel.clone(), *value);
        }

        info!(
            model = %ModelKind::Shapley,
            channels = n,
            approximate = method.is_approximate(),
            coalitions = game.evaluated(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Shapley attribution complete"
        );

        Ok(ModelAttribution {
            model: ModelKind::Shapley,
            aggregate,
            total_conversions,
            per_journey: None,
            details: ModelDetails::Shapley {
                method,
                values: raw,
                grand_coalition_value,
                coalitions_evaluated: game.evaluated(),
            },
        })
    }
}

fn full_coalition(n: usize) -> Coalition {
    if n >= 64 {
        Coalition::MAX
    } else {
        (1 << n) - 1
    }
}

/// Weight of one coalition of each size `s` in `0..=max_size`.
///
/// Exactly `s! (n-s-1)! / n!` = `1 / (n * C(n-1, s))` when every size is
/// enumerated. Truncation spreads the whole weight over the kept sizes:
/// `1 / ((max_size + 1) * C(n-1, s))`.
fn size_weights(n: usize, max_size: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let others = n - 1;
    let kept = max_size.min(others);
    let mut binomial = 1.0_f64;
    (0..=kept)
        .map(|s| {
            if s > 0 {
                binomial = binomial * (others - s + 1) as f64 / s as f64;
            }
            1.0 / ((kept + 1) as f64 * binomial)
        })
        .collect()
}

/// Weighted marginal contributions of `player` over every coalition of the
/// other players with at most `weights.len() - 1` members.
fn player_value(game: &CoalitionValueFunction, n: usize, player: usize, weights: &[f64]) -> f64 {
    let others = n - 1;
    let bit: Coalition = 1 << player;
    let low: Coalition = bit - 1;
    let mut total = 0.0;

    for (size, weight) in weights.iter().enumerate() {
        for compact in subsets_of_size(others, size) {
            // Re-open a gap at `player` so the coalition never includes it.
            let coalition = (compact & low) | ((compact & !low) << 1);
            total += weight * (game.value(coalition | bit) - game.value(coalition));
        }
    }
    total
}

/// All `k`-element subsets of `0..n` as bitmasks, in increasing order.
fn subsets_of_size(n: usize, k: usize) -> impl Iterator<Item = Coalition> {
    let limit: Coalition = if n >= 64 { Coalition::MAX } else { 1 << n };
    let first: Option<Coalition> = if k > n {
        None
    } else if k == 0 {
        Some(0)
    } else {
        Some(full_coalition(k))
    };

    std::iter::successors(first, move |&x| {
        if x == 0 {
            return None;
        }
        // Gosper's hack: next integer with the same number of set bits.
        let c = x & x.wrapping_neg();
        let r = x.checked_add(c)?;
        let next = (((r ^ x) >> 2) / c) | r;
        (next < limit).then_some(next)
    })
}
