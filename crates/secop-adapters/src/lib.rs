//! Source adapter contracts + SODA adapters for the SECOP I and SECOP II datasets.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use secop_core::{
    coerce_number, parse_date, FieldKind, FieldValue, Record, Reference, SourceId, SourceSchema,
};
use secop_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "secop-adapters";

pub const DEFAULT_API_BASE: &str = "https://www.datos.gov.co";

const MONEY_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub api_base: String,
    /// Rows requested per page.
    pub page_size: usize,
    /// Raw rows read per fetch before the result is reported as truncated. A fetch whose
    /// rows all share one date keeps paging until that date is complete.
    pub max_records: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            page_size: 50_000,
            max_records: 300_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed {source_id} payload: {message}")]
    MalformedPayload {
        source_id: &'static str,
        message: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One decoded response page.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub records: Vec<Record>,
    pub raw_rows: usize,
}

/// Everything a `fetch_since` call produced, including whether the row cap was hit.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub source: SourceId,
    pub start_date: NaiveDate,
    pub records: Vec<Record>,
    pub raw_rows: usize,
    pub dropped_rows: usize,
    pub pages: usize,
    pub truncated: bool,
}

impl FetchOutcome {
    pub fn empty(source: SourceId, start_date: NaiveDate) -> Self {
        Self {
            source,
            start_date,
            records: Vec::new(),
            raw_rows: 0,
            dropped_rows: 0,
            pages: 0,
            truncated: false,
        }
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        let date_field = self.source.schema().date_field;
        self.records.iter().filter_map(|r| r.date(date_field)).max()
    }

    /// The only date in the batch, if every record shares one.
    pub fn single_day(&self) -> Option<NaiveDate> {
        let date_field = self.source.schema().date_field;
        let mut dates = self.records.iter().filter_map(|r| r.date(date_field));
        let first = dates.next()?;
        dates.all(|d| d == first).then_some(first)
    }

    /// Drops the records dated on the latest day of the batch, which may only be partially
    /// loaded when the fetch was truncated. Returns the number of deferred records; nothing
    /// is dropped if the whole batch sits on a single day.
    pub fn defer_latest_day(&mut self) -> usize {
        let Some(latest) = self.latest_date() else {
            return 0;
        };
        let date_field = self.source.schema().date_field;
        let keep = self
            .records
            .iter()
            .filter(|r| r.date(date_field) != Some(latest))
            .count();
        if keep == 0 {
            return 0;
        }
        let before = self.records.len();
        self.records.retain(|r| r.date(date_field) != Some(latest));
        before - self.records.len()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceId;

    fn schema(&self) -> &'static SourceSchema {
        self.source().schema()
    }

    fn endpoint(&self) -> String;

    fn query_params(
        &self,
        start_date: NaiveDate,
        limit: usize,
        offset: usize,
    ) -> Vec<(&'static str, String)>;

    fn parse_rows(&self, payload: &JsonValue) -> Result<ParsedPage, AdapterError>;

    /// Records whose date field is on or after `start_date`. An empty result is not an error.
    async fn fetch_since(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        start_date: NaiveDate,
    ) -> Result<FetchOutcome, AdapterError>;
}

#[derive(Debug, Clone)]
struct SodaDatasetAdapter {
    schema: &'static SourceSchema,
    config: AdapterConfig,
}

#[async_trait]
impl SourceAdapter for SodaDatasetAdapter {
    fn source(&self) -> SourceId {
        self.schema.source
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/resource/{}.json",
            self.config.api_base.trim_end_matches('/'),
            self.schema.dataset_id
        )
    }

    fn query_params(
        &self,
        start_date: NaiveDate,
        limit: usize,
        offset: usize,
    ) -> Vec<(&'static str, String)> {
        let date_field = self.schema.date_field;
        vec![
            (
                "$where",
                format!("{date_field} >= '{}'", start_date.format("%Y-%m-%d")),
            ),
            ("$order", format!("{date_field} ASC, :id")),
            ("$limit", limit.to_string()),
            ("$offset", offset.to_string()),
        ]
    }

    fn parse_rows(&self, payload: &JsonValue) -> Result<ParsedPage, AdapterError> {
        let rows = payload
            .as_array()
            .ok_or_else(|| AdapterError::MalformedPayload {
                source_id: self.schema.source.slug(),
                message: format!("expected a JSON array, got {}", json_kind(payload)),
            })?;
        let records = rows
            .iter()
            .filter_map(|row| normalize_row(self.schema, row))
            .collect();
        Ok(ParsedPage {
            records,
            raw_rows: rows.len(),
        })
    }

    async fn fetch_since(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        start_date: NaiveDate,
    ) -> Result<FetchOutcome, AdapterError> {
        let source = self.source();
        let endpoint = self.endpoint();
        let page_size = self.config.page_size.max(1);
        let max_records = self.config.max_records.max(1);
        let mut outcome = FetchOutcome::empty(source, start_date);
        // Past the cap, paging continues only to finish the single day fetched so far.
        let mut finishing_day = false;

        loop {
            let limit = if finishing_day {
                page_size
            } else {
                page_size.min(max_records - outcome.raw_rows)
            };
            let params = self.query_params(start_date, limit, outcome.raw_rows);
            let payload = http
                .fetch_json(ctx.run_id, source.slug(), &endpoint, &params)
                .await?;
            let page = self.parse_rows(&payload)?;

            outcome.pages += 1;
            outcome.raw_rows += page.raw_rows;
            outcome.dropped_rows += page.raw_rows - page.records.len();
            outcome.records.extend(page.records);

            if page.raw_rows < limit {
                break;
            }
            if outcome.raw_rows >= max_records {
                if let Some(day) = outcome.single_day() {
                    if !finishing_day {
                        debug!(
                            source_id = source.slug(),
                            max_records,
                            %day,
                            "result cap reached inside one day; paging to its end"
                        );
                    }
                    finishing_day = true;
                    continue;
                }
                outcome.truncated = true;
                warn!(
                    source_id = source.slug(),
                    max_records,
                    %start_date,
                    "result cap reached; later records were not fetched"
                );
                break;
            }
        }

        info!(
            source_id = source.slug(),
            run_id = %ctx.run_id,
            %start_date,
            pages = outcome.pages,
            raw_rows = outcome.raw_rows,
            kept = outcome.records.len(),
            dropped = outcome.dropped_rows,
            "fetched source window"
        );
        Ok(outcome)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn json_number(raw: &JsonValue) -> Option<f64> {
    match raw {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => coerce_number(s),
        _ => None,
    }
}

fn coerce_field(kind: FieldKind, raw: &JsonValue) -> Option<FieldValue> {
    match kind {
        FieldKind::Text => match raw {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(FieldValue::text(s.as_str())),
            other => Some(FieldValue::Text(other.to_string())),
        },
        FieldKind::Money => json_number(raw).map(|v| FieldValue::Number(v / MONEY_SCALE)),
        FieldKind::Number => json_number(raw).map(FieldValue::Number),
        FieldKind::Date => raw.as_str().and_then(parse_date).map(FieldValue::Date),
        FieldKind::Reference => Reference::from_json(raw).map(|r| FieldValue::Text(r.into_url())),
    }
}

fn project_object(schema: &SourceSchema, row: &Map<String, JsonValue>) -> Record {
    let mut record = Record::new();
    for spec in schema.fields {
        if let Some(value) = row.get(spec.name).and_then(|raw| coerce_field(spec.kind, raw)) {
            record.insert(spec.name, value);
        }
    }
    record
}

/// Projects one raw row onto the schema's field set. Rows that are not objects, or that
/// lack a usable date or value after coercion, yield `None`.
pub fn normalize_row(schema: &SourceSchema, row: &JsonValue) -> Option<Record> {
    let record = project_object(schema, row.as_object()?);
    if record.contains(schema.date_field) && record.contains(schema.value_field) {
        Some(record)
    } else {
        None
    }
}

pub fn secop1_adapter(config: AdapterConfig) -> impl SourceAdapter {
    SodaDatasetAdapter {
        schema: SourceId::Secop1.schema(),
        config,
    }
}

pub fn secop2_adapter(config: AdapterConfig) -> impl SourceAdapter {
    SodaDatasetAdapter {
        schema: SourceId::Secop2.schema(),
        config,
    }
}

pub fn adapter_for_source(source: SourceId, config: AdapterConfig) -> Box<dyn SourceAdapter> {
    match source {
        SourceId::Secop1 => Box::new(secop1_adapter(config)),
        SourceId::Secop2 => Box::new(secop2_adapter(config)),
    }
}

/// Reads a captured API response from disk.
pub fn load_fixture_payload(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
