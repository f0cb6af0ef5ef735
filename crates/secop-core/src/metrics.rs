//! Daily aggregation, time windows and categorical filters over [`Record`] slices.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::Record;

/// Column order of the daily metric table as exported.
pub const DAILY_METRIC_COLUMNS: [&str; 5] = [
    "fecha",
    "n_contratos",
    "suma_millones",
    "promedio_millones",
    "fuente",
];

/// Category label for rows whose category field is absent.
pub const MISSING_CATEGORY: &str = "Sin información";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricRow {
    #[serde(rename = "fecha")]
    pub date: NaiveDate,
    #[serde(rename = "n_contratos")]
    pub contracts: usize,
    #[serde(rename = "suma_millones")]
    pub sum_millions: f64,
    #[serde(rename = "promedio_millones")]
    pub avg_millions: f64,
    #[serde(rename = "fuente")]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetricRow {
    #[serde(rename = "fecha")]
    pub date: NaiveDate,
    #[serde(rename = "categoria")]
    pub category: String,
    #[serde(rename = "n_contratos")]
    pub contracts: usize,
    #[serde(rename = "suma_millones")]
    pub sum_millions: f64,
    #[serde(rename = "promedio_millones")]
    pub avg_millions: f64,
    #[serde(rename = "fuente")]
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MetricTotals {
    pub contracts: usize,
    pub sum_millions: f64,
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    sum: f64,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

fn qualifying_rows<'a>(
    records: &'a [Record],
    date_field: &'a str,
    value_field: &'a str,
) -> impl Iterator<Item = (&'a Record, NaiveDate, f64)> + 'a {
    records.iter().filter_map(move |r| {
        let date = r.date(date_field)?;
        let value = r.number(value_field)?;
        Some((r, date, value))
    })
}

/// Groups records by calendar date and computes count, sum and average of `value_field`.
///
/// Rows whose date or value cannot be coerced are skipped. Output is ascending by date
/// and holds no row for dates without qualifying records.
pub fn aggregate_daily(
    records: &[Record],
    date_field: &str,
    value_field: &str,
    source_label: &str,
) -> Vec<DailyMetricRow> {
    let mut groups: BTreeMap<NaiveDate, Accumulator> = BTreeMap::new();
    for (_, date, value) in qualifying_rows(records, date_field, value_field) {
        groups.entry(date).or_default().push(value);
    }

    groups
        .into_iter()
        .map(|(date, acc)| DailyMetricRow {
            date,
            contracts: acc.count,
            sum_millions: acc.sum,
            avg_millions: acc.average(),
            source: source_label.to_string(),
        })
        .collect()
}

/// Same as [`aggregate_daily`] but keyed by (date, category). Ordered by date, then category.
pub fn aggregate_daily_by_category(
    records: &[Record],
    date_field: &str,
    value_field: &str,
    category_field: &str,
    source_label: &str,
) -> Vec<CategoryMetricRow> {
    let mut groups: BTreeMap<(NaiveDate, String), Accumulator> = BTreeMap::new();
    for (record, date, value) in qualifying_rows(records, date_field, value_field) {
        let category = record
            .text(category_field)
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| MISSING_CATEGORY.to_string());
        groups.entry((date, category)).or_default().push(value);
    }

    groups
        .into_iter()
        .map(|((date, category), acc)| CategoryMetricRow {
            date,
            category,
            contracts: acc.count,
            sum_millions: acc.sum,
            avg_millions: acc.average(),
            source: source_label.to_string(),
        })
        .collect()
}

pub fn summarize(rows: &[DailyMetricRow]) -> MetricTotals {
    rows.iter().fold(MetricTotals::default(), |acc, row| MetricTotals {
        contracts: acc.contracts + row.contracts,
        sum_millions: acc.sum_millions + row.sum_millions,
    })
}

/// Lower-bounded time window; records dated on or after `start` qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveDate,
}

impl TimeWindow {
    pub fn last_n_days(today: NaiveDate, days: u32) -> Self {
        Self {
            start: today
                .checked_sub_days(Days::new(u64::from(days)))
                .unwrap_or(NaiveDate::MIN),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start
    }
}

pub fn filter_window(records: &[Record], date_field: &str, window: TimeWindow) -> Vec<Record> {
    records
        .iter()
        .filter(|r| r.date(date_field).is_some_and(|d| window.contains(d)))
        .cloned()
        .collect()
}

/// Equality filter on one categorical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFilter {
    pub field: String,
    pub value: String,
}

pub fn apply_category_filters(records: &[Record], filters: &[CategoryFilter]) -> Vec<Record> {
    records
        .iter()
        .filter(|r| {
            filters
                .iter()
                .all(|f| r.text(&f.field).is_some_and(|v| v == f.value))
        })
        .cloned()
        .collect()
}

/// Sorted distinct non-empty values of `field`.
pub fn distinct_values(records: &[Record], field: &str) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.text(field))
        .filter(|v| !v.trim().is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
