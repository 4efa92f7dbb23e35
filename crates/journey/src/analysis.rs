//! Descriptive statistics over built journeys — conversion rates, path
//! lengths, timing, and the most common channel paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use attribution_core::Journey;

const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JourneyStats {
    pub journeys: usize,
    pub converted: usize,
    pub conversion_rate: f64,
    pub mean_length: f64,
    pub mean_duration_hours: f64,
    /// Mean time between consecutive touches, over journeys with at least two.
    pub mean_gap_hours: f64,
    pub channels: BTreeMap<String, ChannelStats>,
    pub top_paths: Vec<PathStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub touches: usize,
    /// Journeys touching the channel at least once.
    pub journeys: usize,
    pub converting_journeys: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    pub path: String,
    pub occurrences: usize,
    pub conversions: usize,
    pub conversion_rate: f64,
}

impl JourneyStats {
    /// Summarizes `journeys`, keeping the `top_n` most frequent paths
    /// (ties broken by path text).
    pub fn compute(journeys: &[Journey], top_n: usize) -> Self {
        let total = journeys.len();
        let converted = journeys.iter().filter(|j| j.converted()).count();

        let mut channels: BTreeMap<String, ChannelStats> = BTreeMap::new();
        let mut paths: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        let mut length_sum = 0usize;
        let mut duration_hours_sum = 0.0;
        let mut gap_hours_sum = 0.0;
        let mut gap_count = 0usize;

        for journey in journeys {
            length_sum += journey.length();
            duration_hours_sum += hours(journey.duration().num_milliseconds());
            for gap in journey.gaps().skip(1) {
                gap_hours_sum += hours(gap.num_milliseconds());
                gap_count += 1;
            }

            for touch in journey.touchpoints() {
                channels.entry(touch.channel.clone()).or_default().touches += 1;
            }
            for channel in journey.channels() {
                let stats = channels.entry(channel.to_string()).or_default();
                stats.journeys += 1;
                if journey.converted() {
                    stats.converting_journeys += 1;
                }
            }

            let entry = paths.entry(journey.path().join(PATH_SEPARATOR)).or_insert((0, 0));
            entry.0 += 1;
            if journey.converted() {
                entry.1 += 1;
            }
        }

        let mut top_paths: Vec<PathStats> = paths
            .into_iter()
            .map(|(path, (occurrences, conversions))| PathStats {
                path,
                occurrences,
                conversions,
                conversion_rate: ratio(conversions as f64, occurrences as f64),
            })
            .collect();
        // Stable sort keeps the BTreeMap's path order among ties.
        top_paths.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
        top_paths.truncate(top_n);

        Self {
            journeys: total,
            converted,
            conversion_rate: ratio(converted as f64, total as f64),
            mean_length: ratio(length_sum as f64, total as f64),
            mean_duration_hours: ratio(duration_hours_sum, total as f64),
            mean_gap_hours: ratio(gap_hours_sum, gap_count as f64),
            channels,
            top_paths,
        }
    }
}

fn hours(millis: i64) -> f64 {
    millis as f64 / 3_600_000.0
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attribution_core::Touchpoint;
    use chrono::{Duration, TimeZone, Utc};

    fn journey(id: &str, channels: &[&str], converts: bool) -> Journey {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let last = channels.len() - 1;
        let touches = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| {
                let touch = Touchpoint::new(id, *ch, start + Duration::hours(2 * i as i64));
                if converts && i == last {
                    touch.converting()
                } else {
                    touch
                }
            })
            .collect();
        Journey::new(id, touches).unwrap()
    }

    #[test]
    fn test_stats_over_mixed_journeys() {
        let journeys = vec![
            journey("a", &["search", "email"], true),
            journey("b", &["search", "email"], false),
            journey("c", &["display"], true),
            journey("d", &["search", "search", "email"], false),
        ];

        let stats = JourneyStats::compute(&journeys, 2);
        assert_eq!(stats.journeys, 4);
        assert_eq!(stats.converted, 2);
        assert!((stats.conversion_rate - 0.5).abs() < 1e-12);
        assert!((stats.mean_length - 2.0).abs() < 1e-12);
        // durations: 2h, 2h, 0h, 4h
        assert!((stats.mean_duration_hours - 2.0).abs() < 1e-12);
        assert!((stats.mean_gap_hours - 2.0).abs() < 1e-12);

        let search = &stats.channels["search"];
        assert_eq!(search.touches, 4);
        assert_eq!(search.journeys, 3);
        assert_eq!(search.converting_journeys, 1);

        assert_eq!(stats.top_paths.len(), 2);
        assert_eq!(stats.top_paths[0].path, "search > email");
        assert_eq!(stats.top_paths[0].occurrences, 2);
        assert!((stats.top_paths[0].conversion_rate - 0.5).abs() < 1e-12);
        assert_eq!(stats.top_paths[1].path, "display");
    }

    #[test]
    fn test_stats_on_no_journeys() {
        let stats = JourneyStats::compute(&[], 5);
        assert_eq!(stats.journeys, 0);
        assert_eq!(stats.conversion_rate, 0.0);
        assert!(stats.top_paths.is_empty());
    }
}
