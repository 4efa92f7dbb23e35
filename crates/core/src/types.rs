use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AttributionError, EngineResult};

/// One customer interaction with a marketing channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touchpoint {
    pub customer_id: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub is_conversion: bool,
    #[serde(default)]
    pub cost: Option<f64>,
}

impl Touchpoint {
    pub fn new(customer_id: impl Into<String>, channel: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            customer_id: customer_id.into(),
            channel: channel.into(),
            timestamp,
            is_conversion: false,
            cost: None,
        }
    }

    pub fn converting(mut self) -> Self {
        self.is_conversion = true;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// How much a converting journey is worth when credit is handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionWeighting {
    /// Every conversion is worth 1.0.
    #[default]
    Unit,
    /// A conversion is worth the summed `cost` of its conversion rows,
    /// falling back to 1.0 when none carries one.
    ConversionValue,
}

/// The ordered touchpoints of a single customer.
///
/// Invariants: never empty, a single customer id, timestamps non-decreasing.
/// Built once and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Journey {
    customer_id: String,
    touchpoints: Vec<Touchpoint>,
    /// Milliseconds since the previous touchpoint; the first entry is 0.
    gap_millis: Vec<i64>,
    conversion_at: Option<DateTime<Utc>>,
    conversion_value: Option<f64>,
}

impl Journey {
    /// Orders `touchpoints` by timestamp (stable, so ties keep ingestion
    /// order) and derives conversion state and inter-touch gaps.
    pub fn new(customer_id: impl Into<String>, mut touchpoints: Vec<Touchpoint>) -> EngineResult<Self> {
        let customer_id = customer_id.into();
        if touchpoints.is_empty() {
            return Err(AttributionError::EmptyInput(format!(
                "journey for customer {customer_id} has no touchpoints"
            )));
        }
        if let Some(stray) = touchpoints.iter().find(|t| t.customer_id != customer_id) {
            return Err(AttributionError::Schema(format!(
                "touchpoint for customer {} placed in journey of {customer_id}",
                stray.customer_id
            )));
        }

        touchpoints.sort_by_key(|t| t.timestamp);

        let gap_millis = std::iter::once(0)
            .chain(
                touchpoints
                    .windows(2)
                    .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds()),
            )
            .collect();

        let conversion_at = touchpoints
            .iter()
            .find(|t| t.is_conversion)
            .map(|t| t.timestamp);
        let conversion_value = touchpoints
            .iter()
            .filter(|t| t.is_conversion)
            .filter_map(|t| t.cost)
            .fold(None, |acc: Option<f64>, cost| Some(acc.unwrap_or(0.0) + cost));

        Ok(Self {
            customer_id,
            touchpoints,
            gap_millis,
            conversion_at,
            conversion_value,
        })
    }

    /// Records a conversion that arrived without a channel. The earliest
    /// conversion time wins; values accumulate.
    pub fn with_conversion(mut self, at: DateTime<Utc>, value: Option<f64>) -> Self {
        self.conversion_at = Some(match self.conversion_at {
            Some(existing) if existing <= at => existing,
            _ => at,
        });
        if let Some(value) = value {
            self.conversion_value = Some(self.conversion_value.unwrap_or(0.0) + value);
        }
        self
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn touchpoints(&self) -> &[Touchpoint] {
        &self.touchpoints
    }

    pub fn converted(&self) -> bool {
        self.conversion_at.is_some()
    }

    pub fn conversion_at(&self) -> Option<DateTime<Utc>> {
        self.conversion_at
    }

    pub fn conversion_value(&self) -> Option<f64> {
        self.conversion_value
    }

    pub fn length(&self) -> usize {
        self.touchpoints.len()
    }

    pub fn first_timestamp(&self) -> DateTime<Utc> {
        self.touchpoints[0].timestamp
    }

    pub fn last_timestamp(&self) -> DateTime<Utc> {
        self.touchpoints[self.touchpoints.len() - 1].timestamp
    }

    /// Last timestamp minus first timestamp.
    pub fn duration(&self) -> Duration {
        self.last_timestamp() - self.first_timestamp()
    }

    pub fn gaps(&self) -> impl Iterator<Item = Duration> + '_ {
        self.gap_millis.iter().map(|ms| Duration::milliseconds(*ms))
    }

    pub fn channels(&self) -> BTreeSet<&str> {
        self.touchpoints.iter().map(|t| t.channel.as_str()).collect()
    }

    pub fn path(&self) -> Vec<&str> {
        self.touchpoints.iter().map(|t| t.channel.as_str()).collect()
    }

    /// Touchpoints at or before the conversion. The whole journey when it
    /// never converted, or when the conversion predates every touch.
    pub fn touchpoints_until_conversion(&self) -> &[Touchpoint] {
        match self.conversion_at {
            Some(at) => match self.touchpoints.partition_point(|t| t.timestamp <= at) {
                0 => &self.touchpoints,
                end => &self.touchpoints[..end],
            },
            None => &self.touchpoints,
        }
    }

    /// Credit this journey hands out; 0.0 when it did not convert.
    pub fn conversion_weight(&self, weighting: ConversionWeighting) -> f64 {
        if !self.converted() {
            return 0.0;
        }
        match weighting {
            ConversionWeighting::Unit => 1.0,
            ConversionWeighting::ConversionValue => self.conversion_value.unwrap_or(1.0),
        }
    }
}

/// The attribution models the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    FirstTouch,
    LastTouch,
    Linear,
    PositionBased,
    TimeDecay,
    MarkovChain,
    Shapley,
}

impl ModelKind {
    pub const ALL: [ModelKind; 7] = [
        ModelKind::FirstTouch,
        ModelKind::LastTouch,
        ModelKind::Linear,
        ModelKind::PositionBased,
        ModelKind::TimeDecay,
        ModelKind::MarkovChain,
        ModelKind::Shapley,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::FirstTouch => "first_touch",
            ModelKind::LastTouch => "last_touch",
            ModelKind::Linear => "linear",
            ModelKind::PositionBased => "position_based",
            ModelKind::TimeDecay => "time_decay",
            ModelKind::MarkovChain => "markov_chain",
            ModelKind::Shapley => "shapley",
        }
    }

    /// Rule-based models attribute each journey on its own.
    pub fn is_rule_based(&self) -> bool {
        !matches!(self, ModelKind::MarkovChain | ModelKind::Shapley)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = AttributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|m| m.as_str() == s.trim())
            .ok_or_else(|| AttributionError::Config(format!("unknown attribution model '{s}'")))
    }
}

/// Channel label to credit. Ordered by channel so output is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributionResult {
    credits: BTreeMap<String, f64>,
}

impl AttributionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_credits(credits: BTreeMap<String, f64>) -> Self {
        Self { credits }
    }

    pub fn add(&mut self, channel: &str, credit: f64) {
        *self.credits.entry(channel.to_string()).or_insert(0.0) += credit;
    }

    /// Makes `channel` visible with zero credit if it has none yet.
    pub fn ensure_channel(&mut self, channel: &str) {
        self.credits.entry(channel.to_string()).or_insert(0.0);
    }

    pub fn merge(&mut self, other: &AttributionResult) {
        for (channel, credit) in &other.credits {
            self.add(channel, *credit);
        }
    }

    pub fn credit(&self, channel: &str) -> f64 {
        self.credits.get(channel).copied().unwrap_or(0.0)
    }

    pub fn credits(&self) -> &BTreeMap<String, f64> {
        &self.credits
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.credits.keys().map(String::as_str)
    }

    pub fn total(&self) -> f64 {
        self.credits.values().sum()
    }

    /// Share of the total per channel, in percent. All zeros when nothing
    /// was credited.
    pub fn percentages(&self) -> BTreeMap<String, f64> {
        let total = self.total();
        self.credits
            .iter()
            .map(|(channel, credit)| {
                let pct = if total > 0.0 { credit / total * 100.0 } else { 0.0 };
                (channel.clone(), pct)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.credits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }
}
