//! Side-by-side comparison of channel credit across attribution models.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use attribution_core::{AttributionError, AttributionResult, EngineResult, ModelKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub model: ModelKind,
    pub channel: String,
    pub credit: f64,
    /// Share of the model's total credit, in percent.
    pub percentage: f64,
}

/// Model x channel credit table over the union of all channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonTable {
    pub models: Vec<ModelKind>,
    pub channels: Vec<String>,
    pub totals: BTreeMap<ModelKind, f64>,
    /// Sorted by model, then channel.
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonTable {
    fn row(&self, model: ModelKind, channel: &str) -> Option<&ComparisonRow> {
        self.rows
            .iter()
            .find(|r| r.model == model && r.channel == channel)
    }

    pub fn credit(&self, model: ModelKind, channel: &str) -> Option<f64> {
        self.row(model, channel).map(|r| r.credit)
    }

    pub fn percentage(&self, model: ModelKind, channel: &str) -> Option<f64> {
        self.row(model, channel).map(|r| r.percentage)
    }

    /// Channel with the most credit under `model`; the first by name on ties.
    pub fn top_channel(&self, model: ModelKind) -> Option<&str> {
        self.rows
            .iter()
            .filter(|r| r.model == model && r.credit > 0.0)
            .fold(None, |best: Option<&ComparisonRow>, row| match best {
                Some(b) if b.credit >= row.credit => Some(b),
                _ => Some(row),
            })
            .map(|r| r.channel.as_str())
    }
}

pub struct ModelComparator;

impl ModelComparator {
    /// Normalizes each model's credit to percentages and lines the models
    /// up over a shared channel list. Fails with `EmptyInput` when no
    /// model result is given.
    pub fn compare(results: &BTreeMap<ModelKind, AttributionResult>) -> EngineResult<ComparisonTable> {
        if results.is_empty() {
            return Err(AttributionError::EmptyInput(
                "no model results to compare".to_string(),
            ));
        }

        let channels: Vec<String> = results
            .values()
            .flat_map(|r| r.channels())
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut totals = BTreeMap::new();
        let mut rows = Vec::with_capacity(results.len() * channels.len());
        for (model, result) in results {
            let total = result.total();
            totals.insert(*model, total);
            for channel in &channels {
                let credit = result.credit(channel);
                rows.push(ComparisonRow {
                    model: *model,
                    channel: channel.clone(),
                    credit,
                    percentage: if total > 0.0 { credit / total * 100.0 } else { 0.0 },
                });
            }
        }

        Ok(ComparisonTable {
            models: results.keys().copied().collect(),
            channels,
            totals,
            rows,
        })
    }
}
