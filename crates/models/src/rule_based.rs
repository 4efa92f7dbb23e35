//! Rule-based attribution — first-touch, last-touch, linear,
//! position-based, and time-decay credit computed journey by journey.

use std::time::Instant;

use rayon::prelude::*;
use tracing::info;

use attribution_core::config::{AttributionConfig, PositionBasedConfig, TimeDecayConfig};
use attribution_core::{
    AttributionError, AttributionResult, ConversionWeighting, EngineResult, Journey, ModelKind,
    Touchpoint,
};

use crate::types::{JourneyAttribution, ModelAttribution, ModelDetails};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Applies the heuristic models. Each rule is a pure function of one
/// journey: converting journeys hand out exactly their conversion weight,
/// all others hand out nothing.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedAllocator {
    position: PositionBasedConfig,
    time_decay: TimeDecayConfig,
    weighting: ConversionWeighting,
}

impl RuleBasedAllocator {
    pub fn new(
        position: PositionBasedConfig,
        time_decay: TimeDecayConfig,
        weighting: ConversionWeighting,
    ) -> EngineResult<Self> {
        position.validate()?;
        time_decay.validate()?;
        Ok(Self {
            position,
            time_decay,
            weighting,
        })
    }

    pub fn from_config(config: &AttributionConfig) -> EngineResult<Self> {
        Self::new(
            config.position_based.clone(),
            config.time_decay.clone(),
            config.conversion_weighting,
        )
    }

    /// Credit for one journey under `model`.
    pub fn allocate(&self, model: ModelKind, journey: &Journey) -> EngineResult<AttributionResult> {
        match model {
            ModelKind::FirstTouch => Ok(self.first_touch(journey)),
            ModelKind::LastTouch => Ok(self.last_touch(journey)),
            ModelKind::Linear => Ok(self.linear(journey)),
            ModelKind::PositionBased => Ok(self.position_based(journey)),
            ModelKind::TimeDecay => Ok(self.time_decay(journey)),
            ModelKind::MarkovChain | ModelKind::Shapley => Err(AttributionError::Config(format!(
                "{model} does not attribute individual journeys"
            ))),
        }
    }

    pub fn first_touch(&self, journey: &Journey) -> AttributionResult {
        let mut credits = zeroed(journey);
        let weight = journey.conversion_weight(self.weighting);
        if weight > 0.0 {
            credits.add(&journey.touchpoints()[0].channel, weight);
        }
        credits
    }

    /// Full credit to the last touch at or before the conversion. A
    /// conversion row that carries a channel is its own last touch.
    pub fn last_touch(&self, journey: &Journey) -> AttributionResult {
        let mut credits = zeroed(journey);
        let weight = journey.conversion_weight(self.weighting);
        if weight > 0.0 {
            if let Some(last) = journey.touchpoints_until_conversion().last() {
                credits.add(&last.channel, weight);
            }
        }
        credits
    }

    pub fn linear(&self, journey: &Journey) -> AttributionResult {
        let mut credits = zeroed(journey);
        let weight = journey.conversion_weight(self.weighting);
        if weight > 0.0 {
            let share = weight / journey.length() as f64;
            for touch in journey.touchpoints() {
                credits.add(&touch.channel, share);
            }
        }
        credits
    }

    pub fn position_based(&self, journey: &Journey) -> AttributionResult {
        let mut credits = zeroed(journey);
        let weight = journey.conversion_weight(self.weighting);
        if weight <= 0.0 {
            return credits;
        }

        let touches = journey.touchpoints();
        let first = self.position.first_weight;
        let last = self.position.last_weight;
        match touches.len() {
            1 => credits.add(&touches[0].channel, weight),
            2 => {
                let (first_share, last_share) = if first + last > 0.0 {
                    (first / (first + last), last / (first + last))
                } else {
                    (0.5, 0.5)
                };
                credits.add(&touches[0].channel, weight * first_share);
                credits.add(&touches[1].channel, weight * last_share);
            }
            len => {
                let interior = (1.0 - first - last) / (len - 2) as f64;
                credits.add(&touches[0].channel, weight * first);
                for touch in &touches[1..len - 1] {
                    credits.add(&touch.channel, weight * interior);
                }
                credits.add(&touches[len - 1].channel, weight * last);
            }
        }
        credits
    }

    /// Weight halves for every `half_life_days` between a touch and the
    /// conversion. Touches after the conversion get nothing. Distances are
    /// taken relative to the closest touch so the weights cannot all
    /// underflow to zero.
    pub fn time_decay(&self, journey: &Journey) -> AttributionResult {
        let mut credits = zeroed(journey);
        let weight = journey.conversion_weight(self.weighting);
        let Some(converted_at) = journey.conversion_at() else {
            return credits;
        };
        if weight <= 0.0 {
            return credits;
        }

        let distances: Vec<(&Touchpoint, f64)> = journey
            .touchpoints_until_conversion()
            .iter()
            .map(|touch| {
                let days = (converted_at - touch.timestamp).num_milliseconds() as f64 / MILLIS_PER_DAY;
                (touch, days)
            })
            .collect();
        let closest = distances
            .iter()
            .map(|(_, days)| *days)
            .fold(f64::INFINITY, f64::min);
        let decayed: Vec<(&Touchpoint, f64)> = distances
            .into_iter()
            .map(|(touch, days)| {
                (touch, (-(days - closest) / self.time_decay.half_life_days).exp2())
            })
            .collect();

        let norm: f64 = decayed.iter().map(|(_, w)| w).sum();
        if norm > 0.0 {
            for (touch, w) in decayed {
                credits.add(&touch.channel, weight * w / norm);
            }
        }
        credits
    }

    /// Attributes every journey and sums the credit per channel.
    ///
    /// Journeys are mapped in parallel; the reduction runs in journey order
    /// so the aggregate does not depend on scheduling.
    pub fn run(
        &self,
        model: ModelKind,
        journeys: &[Journey],
        keep_per_journey: bool,
    ) -> EngineResult<ModelAttribution> {
        let started = Instant::now();
        let per_journey: Vec<AttributionResult> = journeys
            .par_iter()
            .map(|journey| self.allocate(model, journey))
            .collect::<EngineResult<_>>()?;

        let mut aggregate = AttributionResult::new();
        for credits in &per_journey {
            aggregate.merge(credits);
        }
        let total_conversions: f64 = journeys
            .iter()
            .map(|j| j.conversion_weight(self.weighting))
            .sum();

        info!(
            model = %model,
            journeys = journeys.len(),
            channels = aggregate.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rule-based attribution complete"
        );

        let per_journey = keep_per_journey.then(|| {
            journeys
                .iter()
                .zip(per_journey)
                .map(|(journey, credits)| JourneyAttribution {
                    customer_id: journey.customer_id().to_string(),
                    converted: journey.converted(),
                    credits,
                })
                .collect()
        });

        Ok(ModelAttribution {
            model,
            aggregate,
            total_conversions,
            per_journey,
            details: ModelDetails::RuleBased,
        })
    }
}

/// Every channel of the journey at zero credit.
fn zeroed(journey: &Journey) -> AttributionResult {
    let mut credits = AttributionResult::new();
    for channel in journey.channels() {
        credits.ensure_channel(channel);
    }
    credits
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const EPS: f64 = 1e-9;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    /// Touches one day apart; the last one converts when `converts`.
    fn journey(channels: &[&str], converts: bool) -> Journey {
        let last = channels.len() - 1;
        let touches = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                let touch = Touchpoint::new("c1", *ch, day(i as i64));
                if converts && i == last {
                    touch.converting()
                } else {
                    touch
                }
            })
            .collect();
        Journey::new("c1", touches).unwrap()
    }

    fn allocator() -> RuleBasedAllocator {
        RuleBasedAllocator::default()
    }

    const RULES: [ModelKind; 5] = [
        ModelKind::FirstTouch,
        ModelKind::LastTouch,
        ModelKind::Linear,
        ModelKind::PositionBased,
        ModelKind::TimeDecay,
    ];

    #[test]
    fn test_first_touch() {
        let credits = allocator().first_touch(&journey(&["A", "B", "C"], true));
        assert_eq!(credits.credit("A"), 1.0);
        assert_eq!(credits.credit("B"), 0.0);
        assert_eq!(credits.credit("C"), 0.0);
        assert_eq!(credits.len(), 3);
    }

    #[test]
    fn test_last_touch_ignores_touches_after_conversion() {
        let touches = vec![
            Touchpoint::new("c1", "A", day(0)),
            Touchpoint::new("c1", "B", day(1)).converting(),
            Touchpoint::new("c1", "C", day(2)),
        ];
        let credits = allocator().last_touch(&Journey::new("c1", touches).unwrap());
        assert_eq!(credits.credit("B"), 1.0);
        assert_eq!(credits.credit("C"), 0.0);
    }

    #[test]
    fn test_linear_accumulates_repeated_channels() {
        let credits = allocator().linear(&journey(&["A", "B", "A"], true));
        assert!((credits.credit("A") - 2.0 / 3.0).abs() < EPS);
        assert!((credits.credit("B") - 1.0 / 3.0).abs() < EPS);
    }

    #[test]
    fn test_position_based_defaults() {
        let credits = allocator().position_based(&journey(&["A", "B", "C", "D"], true));
        assert!((credits.credit("A") - 0.4).abs() < EPS);
        assert!((credits.credit("B") - 0.1).abs() < EPS);
        assert!((credits.credit("C") - 0.1).abs() < EPS);
        assert!((credits.credit("D") - 0.4).abs() < EPS);
    }

    #[test]
    fn test_position_based_short_journeys() {
        let single = allocator().position_based(&journey(&["A"], true));
        assert_eq!(single.credit("A"), 1.0);

        let skewed = RuleBasedAllocator::new(
            PositionBasedConfig {
                first_weight: 0.6,
                last_weight: 0.2,
            },
            TimeDecayConfig::default(),
            ConversionWeighting::Unit,
        )
        .unwrap();
        let pair = skewed.position_based(&journey(&["A", "B"], true));
        assert!((pair.credit("A") - 0.75).abs() < EPS);
        assert!((pair.credit("B") - 0.25).abs() < EPS);
    }

    #[test]
    fn test_time_decay_half_life_ratio() {
        let touches = vec![
            Touchpoint::new("c1", "A", day(0)),
            Touchpoint::new("c1", "B", day(7)).converting(),
        ];
        let credits = allocator().time_decay(&Journey::new("c1", touches).unwrap());
        assert!((credits.credit("B") / credits.credit("A") - 2.0).abs() < EPS);
        assert!((credits.total() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_time_decay_uses_channelless_conversion_time() {
        let touches = vec![
            Touchpoint::new("c1", "A", day(0)),
            Touchpoint::new("c1", "B", day(7)),
        ];
        let journey = Journey::new("c1", touches).unwrap().with_conversion(day(14), None);
        let credits = allocator().time_decay(&journey);
        assert!((credits.credit("B") / credits.credit("A") - 2.0).abs() < EPS);
    }

    #[test]
    fn test_time_decay_short_half_life_far_from_conversion() {
        let allocator = RuleBasedAllocator::new(
            PositionBasedConfig::default(),
            TimeDecayConfig {
                half_life_days: 0.001,
            },
            ConversionWeighting::Unit,
        )
        .unwrap();
        let touches = vec![
            Touchpoint::new("c1", "A", day(0)),
            Touchpoint::new("c1", "B", day(0) + Duration::hours(1)),
        ];
        let journey = Journey::new("c1", touches).unwrap().with_conversion(day(2), None);

        let credits = allocator.time_decay(&journey);
        assert!((credits.total() - 1.0).abs() < EPS);
        assert!((credits.credit("B") - 1.0).abs() < EPS);
    }

    #[test]
    fn test_conversion_before_first_touch_still_credited() {
        let journey = journey(&["A", "B"], false).with_conversion(day(-1), None);
        let allocator = allocator();
        for model in RULES {
            let credits = allocator.allocate(model, &journey).unwrap();
            assert!(
                (credits.total() - 1.0).abs() < EPS,
                "{model} summed to {}",
                credits.total()
            );
        }
        assert_eq!(allocator.last_touch(&journey).credit("B"), 1.0);
    }

    #[test]
    fn test_converting_journeys_sum_to_one() {
        let allocator = allocator();
        let samples = [
            journey(&["A"], true),
            journey(&["A", "B"], true),
            journey(&["A", "B", "A", "C", "D"], true),
            journey(&["C", "C", "C"], true),
        ];
        for model in RULES {
            for j in &samples {
                let credits = allocator.allocate(model, j).unwrap();
                assert!(
                    (credits.total() - 1.0).abs() < EPS,
                    "{model} summed to {}",
                    credits.total()
                );
            }
        }
    }

    #[test]
    fn test_non_converting_journey_gets_no_credit() {
        let allocator = allocator();
        let j = journey(&["A", "B", "C"], false);
        for model in RULES {
            let credits = allocator.allocate(model, &j).unwrap();
            assert_eq!(credits.total(), 0.0);
            assert_eq!(credits.len(), 3);
        }
    }

    #[test]
    fn test_conversion_value_weighting() {
        let allocator = RuleBasedAllocator::new(
            PositionBasedConfig::default(),
            TimeDecayConfig::default(),
            ConversionWeighting::ConversionValue,
        )
        .unwrap();
        let touches = vec![
            Touchpoint::new("c1", "A", day(0)),
            Touchpoint::new("c1", "B", day(1)).converting().with_cost(50.0),
        ];
        let credits = allocator.linear(&Journey::new("c1", touches).unwrap());
        assert!((credits.credit("A") - 25.0).abs() < EPS);
        assert!((credits.total() - 50.0).abs() < EPS);
    }

    #[test]
    fn test_run_aggregates_and_keeps_per_journey() {
        let journeys = vec![
            journey(&["A", "B"], true),
            journey(&["B", "C"], true),
            journey(&["A"], false),
        ];
        let result = allocator().run(ModelKind::FirstTouch, &journeys, true).unwrap();
        assert_eq!(result.aggregate.credit("A"), 1.0);
        assert_eq!(result.aggregate.credit("B"), 1.0);
        assert_eq!(result.aggregate.credit("C"), 0.0);
        assert_eq!(result.total_conversions, 2.0);
        assert_eq!(result.per_journey.as_ref().map(Vec::len), Some(3));
    }

    #[test]
    fn test_aggregate_models_rejected_per_journey() {
        let j = journey(&["A"], true);
        assert!(allocator().allocate(ModelKind::MarkovChain, &j).is_err());
    }
}
