//! Journey construction — groups flat touchpoint events by customer and
//! orders them in time.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use attribution_core::config::ColumnMapping;
use attribution_core::{AttributionError, EngineResult, Journey, Touchpoint};

use crate::table::EventTable;

/// Accepted in place of a missing channel column.
const CHANNEL_COLUMN_ALIAS: &str = "data_source";

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Row-level outcome counts of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub rows_total: usize,
    pub rows_accepted: usize,
    pub rejected_customer_id: usize,
    pub rejected_timestamp: usize,
    pub rejected_channel: usize,
    pub rejected_conversion_flag: usize,
    pub rejected_cost: usize,
    /// Customers whose accepted rows carried no channel at all.
    pub customers_dropped: usize,
    pub journeys: usize,
}

impl BuildReport {
    pub fn rows_rejected(&self) -> usize {
        self.rows_total - self.rows_accepted
    }
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub journeys: Vec<Journey>,
    pub report: BuildReport,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedColumns {
    customer_id: usize,
    timestamp: usize,
    channel: usize,
    conversion: usize,
    cost: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    CustomerId,
    Timestamp,
    Channel,
    ConversionFlag,
    Cost,
}

enum ParsedRow {
    Touch(Touchpoint),
    /// A conversion that names no channel.
    Conversion {
        customer_id: String,
        at: DateTime<Utc>,
        value: Option<f64>,
    },
}

#[derive(Default)]
struct CustomerRows {
    touchpoints: Vec<Touchpoint>,
    conversions: Vec<(DateTime<Utc>, Option<f64>)>,
}

/// Turns an event table into one ordered journey per customer.
#[derive(Debug, Clone, Default)]
pub struct JourneyBuilder {
    columns: ColumnMapping,
}

impl JourneyBuilder {
    pub fn new(columns: ColumnMapping) -> Self {
        Self { columns }
    }

    /// Builds journeys ordered by customer id.
    ///
    /// Missing required columns fail with `Schema`. Rows that cannot be
    /// parsed are dropped and counted; only a table whose every row fails
    /// is an error (`Type`). An empty table yields no journeys.
    pub fn build(&self, table: &EventTable) -> EngineResult<BuildOutput> {
        let columns = self.resolve_columns(table)?;
        let mut report = BuildReport {
            rows_total: table.rows.len(),
            ..Default::default()
        };

        let mut customers: BTreeMap<String, CustomerRows> = BTreeMap::new();
        for row in &table.rows {
            match parse_row(row, &columns) {
                Ok(ParsedRow::Touch(touch)) => {
                    report.rows_accepted += 1;
                    customers
                        .entry(touch.customer_id.clone())
                        .or_default()
                        .touchpoints
                        .push(touch);
                }
                Ok(ParsedRow::Conversion { customer_id, at, value }) => {
                    report.rows_accepted += 1;
                    customers
                        .entry(customer_id)
                        .or_default()
                        .conversions
                        .push((at, value));
                }
                Err(reason) => match reason {
                    Rejection::CustomerId => report.rejected_customer_id += 1,
                    Rejection::Timestamp => report.rejected_timestamp += 1,
                    Rejection::Channel => report.rejected_channel += 1,
                    Rejection::ConversionFlag => report.rejected_conversion_flag += 1,
                    Rejection::Cost => report.rejected_cost += 1,
                },
            }
        }

        if report.rows_total > 0 && report.rows_accepted == 0 {
            return Err(AttributionError::Type(format!(
                "none of the {} rows could be parsed ({} bad timestamps)",
                report.rows_total, report.rejected_timestamp
            )));
        }
        if report.rows_rejected() > 0 {
            warn!(
                rejected = report.rows_rejected(),
                timestamp = report.rejected_timestamp,
                customer_id = report.rejected_customer_id,
                channel = report.rejected_channel,
                conversion_flag = report.rejected_conversion_flag,
                cost = report.rejected_cost,
                "Dropped unparseable event rows"
            );
        }

        let mut journeys = Vec::with_capacity(customers.len());
        for (customer_id, rows) in customers {
            if rows.touchpoints.is_empty() {
                report.customers_dropped += 1;
                continue;
            }
            let journey = rows
                .conversions
                .into_iter()
                .fold(Journey::new(customer_id, rows.touchpoints)?, |journey, (at, value)| {
                    journey.with_conversion(at, value)
                });
            journeys.push(journey);
        }
        report.journeys = journeys.len();

        info!(
            rows = report.rows_total,
            accepted = report.rows_accepted,
            journeys = report.journeys,
            converted = journeys.iter().filter(|j| j.converted()).count(),
            "Built customer journeys"
        );

        Ok(BuildOutput { journeys, report })
    }

    fn resolve_columns(&self, table: &EventTable) -> EngineResult<ResolvedColumns> {
        let mut missing = Vec::new();
        let mut require = |name: &str| {
            let idx = table.column_index(name);
            if idx.is_none() {
                missing.push(name.to_string());
            }
            idx.unwrap_or(0)
        };

        let customer_id = require(&self.columns.customer_id);
        let timestamp = require(&self.columns.timestamp);
        let conversion = require(&self.columns.conversion);
        let channel = match table
            .column_index(&self.columns.channel)
            .or_else(|| table.column_index(CHANNEL_COLUMN_ALIAS))
        {
            Some(idx) => idx,
            None => require(&self.columns.channel),
        };

        if !missing.is_empty() {
            return Err(AttributionError::Schema(format!(
                "missing required column(s): {}",
                missing.join(", ")
            )));
        }

        let cost = self
            .columns
            .cost
            .as_deref()
            .and_then(|name| table.column_index(name));

        Ok(ResolvedColumns {
            customer_id,
            timestamp,
            channel,
            conversion,
            cost,
        })
    }
}

fn parse_row(row: &[Value], columns: &ResolvedColumns) -> Result<ParsedRow, Rejection> {
    let cell = |idx: usize| row.get(idx).unwrap_or(&Value::Null);

    let customer_id = parse_customer_id(cell(columns.customer_id)).ok_or(Rejection::CustomerId)?;
    let timestamp = parse_timestamp(cell(columns.timestamp)).ok_or(Rejection::Timestamp)?;
    let is_conversion = parse_flag(cell(columns.conversion)).ok_or(Rejection::ConversionFlag)?;
    let cost = match columns.cost {
        Some(idx) => parse_cost(cell(idx)).ok_or(Rejection::Cost)?,
        None => None,
    };

    match parse_channel(cell(columns.channel)) {
        Some(channel) => Ok(ParsedRow::Touch(Touchpoint {
            customer_id,
            channel,
            timestamp,
            is_conversion,
            cost,
        })),
        None if is_conversion => Ok(ParsedRow::Conversion {
            customer_id,
            at: timestamp,
            value: cost,
        }),
        None => Err(Rejection::Channel),
    }
}

fn parse_customer_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_channel(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339, naive `Y-m-d H:M:S` (taken as UTC), bare dates, and
/// unix seconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            for format in NAIVE_TIMESTAMP_FORMATS {
                if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(ts.and_utc());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|ts| ts.and_utc())
        }
        Value::Number(n) => match n.as_i64() {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            None => n
                .as_f64()
                .filter(|secs| secs.is_finite())
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)),
        },
        _ => None,
    }
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Null => Some(false),
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Some(true),
            "false" | "0" | "no" | "n" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `Some(None)` for an absent cost, `None` for an unparseable one.
fn parse_cost(value: &Value) -> Option<Option<f64>> {
    match value {
        Value::Null => Some(None),
        Value::Number(n) => n.as_f64().map(Some),
        Value::String(s) if s.trim().is_empty() => Some(None),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).map(Some),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(rows: Vec<Vec<Value>>) -> EventTable {
        EventTable {
            columns: vec![
                "customer_id".into(),
                "timestamp".into(),
                "channel".into(),
                "is_conversion".into(),
                "cost".into(),
            ],
            rows,
        }
    }

    #[test]
    fn test_unordered_rows_are_sorted() {
        let events = table(vec![
            vec![json!("c1"), json!("2024-01-03T00:00:00Z"), json!("email"), json!(true), json!(null)],
            vec![json!("c1"), json!("2024-01-01T00:00:00Z"), json!("search"), json!(false), json!(1.5)],
            vec![json!("c1"), json!("2024-01-02 12:00:00"), json!("display"), json!(false), json!(null)],
        ]);

        let output = JourneyBuilder::default().build(&events).unwrap();
        assert_eq!(output.journeys.len(), 1);
        let journey = &output.journeys[0];
        assert_eq!(journey.path(), vec!["search", "display", "email"]);
        assert!(journey.converted());
        let timestamps: Vec<_> = journey.touchpoints().iter().map(|t| t.timestamp).collect();
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(journey.touchpoints()[0].cost, Some(1.5));
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let events = EventTable {
            columns: vec!["customer_id".into(), "timestamp".into(), "channel".into()],
            rows: vec![],
        };
        match JourneyBuilder::default().build(&events) {
            Err(AttributionError::Schema(msg)) => assert!(msg.contains("is_conversion")),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_data_source_column_stands_in_for_channel() {
        let events = EventTable {
            columns: vec![
                "customer_id".into(),
                "timestamp".into(),
                "data_source".into(),
                "is_conversion".into(),
            ],
            rows: vec![vec![json!("c1"), json!(1_700_000_000), json!("crm"), json!(1)]],
        };
        let output = JourneyBuilder::default().build(&events).unwrap();
        assert_eq!(output.journeys[0].path(), vec!["crm"]);
        assert!(output.journeys[0].converted());
    }

    #[test]
    fn test_bad_timestamps_are_dropped_and_counted() {
        let events = table(vec![
            vec![json!("c1"), json!("not a date"), json!("email"), json!(false), json!(null)],
            vec![json!("c2"), json!("yesterday"), json!("email"), json!(false), json!(null)],
            vec![json!("c2"), json!("2024-01-01"), json!("search"), json!(false), json!(null)],
        ]);

        let output = JourneyBuilder::default().build(&events).unwrap();
        assert_eq!(output.report.rejected_timestamp, 2);
        assert_eq!(output.report.rows_accepted, 1);
        // c1 had no valid rows left and is absent.
        assert_eq!(output.journeys.len(), 1);
        assert_eq!(output.journeys[0].customer_id(), "c2");
    }

    #[test]
    fn test_all_rows_invalid_is_type_error() {
        let events = table(vec![vec![
            json!("c1"),
            json!("garbage"),
            json!("email"),
            json!(false),
            json!(null),
        ]]);
        assert!(matches!(
            JourneyBuilder::default().build(&events),
            Err(AttributionError::Type(_))
        ));
    }

    #[test]
    fn test_empty_table_yields_no_journeys() {
        let output = JourneyBuilder::default().build(&table(vec![])).unwrap();
        assert!(output.journeys.is_empty());
        assert_eq!(output.report.rows_total, 0);
    }

    #[test]
    fn test_channelless_conversion_marks_journey() {
        let events = table(vec![
            vec![json!("c1"), json!("2024-01-01T00:00:00Z"), json!("search"), json!(false), json!(null)],
            vec![json!("c1"), json!("2024-01-02T00:00:00Z"), json!(null), json!("yes"), json!("99.5")],
            vec![json!("c2"), json!("2024-01-02T00:00:00Z"), json!(""), json!(true), json!(null)],
        ]);

        let output = JourneyBuilder::default().build(&events).unwrap();
        assert_eq!(output.journeys.len(), 1);
        let journey = &output.journeys[0];
        assert_eq!(journey.length(), 1);
        assert!(journey.converted());
        assert_eq!(journey.conversion_value(), Some(99.5));
        assert_eq!(output.report.customers_dropped, 1);
    }

    #[test]
    fn test_journeys_ordered_by_customer() {
        let events = table(vec![
            vec![json!("zed"), json!("2024-01-01T00:00:00Z"), json!("email"), json!(false), json!(null)],
            vec![json!(42), json!("2024-01-01T00:00:00Z"), json!("email"), json!(false), json!(null)],
            vec![json!("amy"), json!("2024-01-01T00:00:00Z"), json!("email"), json!(false), json!(null)],
        ]);
        let output = JourneyBuilder::default().build(&events).unwrap();
        let ids: Vec<_> = output.journeys.iter().map(|j| j.customer_id()).collect();
        assert_eq!(ids, vec!["42", "amy", "zed"]);
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp(&json!("2024-05-01T10:00:00+02:00")).is_some());
        assert!(parse_timestamp(&json!("2024-05-01T10:00:00.250")).is_some());
        assert!(parse_timestamp(&json!(1_700_000_000.5)).is_some());
        assert!(parse_timestamp(&json!(true)).is_none());
        assert_eq!(
            parse_timestamp(&json!("2024-05-01")),
            parse_timestamp(&json!("2024-05-01T00:00:00Z"))
        );
    }
}
