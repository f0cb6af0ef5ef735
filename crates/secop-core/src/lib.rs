//! Core record model, source schemas and daily aggregation for the SECOP monitor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod metrics;

pub use metrics::{
    aggregate_daily, aggregate_daily_by_category, apply_category_filters, distinct_values,
    filter_window, summarize, CategoryFilter, CategoryMetricRow, DailyMetricRow, MetricTotals,
    TimeWindow, DAILY_METRIC_COLUMNS, MISSING_CATEGORY,
};

pub const CRATE_NAME: &str = "secop-core";

/// Upstream procurement datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Secop1,
    Secop2,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [SourceId::Secop1, SourceId::Secop2];

    pub fn slug(&self) -> &'static str {
        match self {
            SourceId::Secop1 => "secop1",
            SourceId::Secop2 => "secop2",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.slug().eq_ignore_ascii_case(slug.trim()))
    }

    pub fn label(&self) -> &'static str {
        self.schema().label
    }

    pub fn schema(&self) -> &'static SourceSchema {
        match self {
            SourceId::Secop1 => &SECOP1_SCHEMA,
            SourceId::Secop2 => &SECOP2_SCHEMA,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// How a raw upstream value is coerced and how it is laid out in the columnar store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    /// Native currency units upstream, millions once ingested.
    Money,
    Number,
    Date,
    /// Either a scalar URL or a `{ "url": ... }` object upstream; always a plain string once ingested.
    Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// Fixed field set, identity and presentation hints for one source.
#[derive(Debug)]
pub struct SourceSchema {
    pub source: SourceId,
    pub label: &'static str,
    pub dataset_id: &'static str,
    pub store_file: &'static str,
    pub fields: &'static [FieldSpec],
    pub date_field: &'static str,
    pub value_field: &'static str,
    pub dedup_key: &'static [&'static str],
    pub category_fields: &'static [&'static str],
}

impl SourceSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.name)
    }

    /// Dedup key as owned field names, `None` when the source only supports full-row identity.
    pub fn dedup_key(&self) -> Option<Vec<String>> {
        if self.dedup_key.is_empty() {
            None
        } else {
            Some(self.dedup_key.iter().map(|s| s.to_string()).collect())
        }
    }

    pub fn is_category_field(&self, name: &str) -> bool {
        self.category_fields.contains(&name)
    }
}

pub static SECOP1_SCHEMA: SourceSchema = SourceSchema {
    source: SourceId::Secop1,
    label: "SECOP 1",
    dataset_id: "f789-7hwg",
    store_file: "secop1.parquet",
    fields: &[
        field("uid", FieldKind::Text),
        field("nombre_entidad", FieldKind::Text),
        field("detalle_del_objeto_a_contratar", FieldKind::Text),
        field("estado_del_proceso", FieldKind::Text),
        field("tipo_de_contrato", FieldKind::Text),
        field("cuantia_contrato", FieldKind::Money),
        field("plazo_de_ejec_del_contrato", FieldKind::Text),
        field("rango_de_ejec_del_contrato", FieldKind::Text),
        field("fecha_de_cargue_en_el_secop", FieldKind::Date),
        field("ruta_proceso_en_secop_i", FieldKind::Reference),
    ],
    date_field: "fecha_de_cargue_en_el_secop",
    value_field: "cuantia_contrato",
    dedup_key: &["uid"],
    category_fields: &["estado_del_proceso", "tipo_de_contrato"],
};

pub static SECOP2_SCHEMA: SourceSchema = SourceSchema {
    source: SourceId::Secop2,
    label: "SECOP 2",
    dataset_id: "jbjy-vk9h",
    store_file: "secop2.parquet",
    fields: &[
        field("id_contrato", FieldKind::Text),
        field("nombre_entidad", FieldKind::Text),
        field("descripcion_del_proceso", FieldKind::Text),
        field("tipo_de_contrato", FieldKind::Text),
        field("valor_del_contrato", FieldKind::Money),
        field("duraci_n_del_contrato", FieldKind::Text),
        field("fecha_de_firma", FieldKind::Date),
        field("urlproceso", FieldKind::Reference),
        field("estado_contrato", FieldKind::Text),
        field("modalidad_de_contratacion", FieldKind::Text),
        field("sector", FieldKind::Text),
        field("departamento", FieldKind::Text),
    ],
    date_field: "fecha_de_firma",
    value_field: "valor_del_contrato",
    dedup_key: &["id_contrato"],
    category_fields: &[
        "estado_contrato",
        "modalidad_de_contratacion",
        "sector",
        "departamento",
    ],
};

/// A single scalar cell of a [`Record`]. Missing values are represented by absence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Numeric view of the value; text is parsed, anything non-numeric is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) if n.is_finite() => Some(*n),
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => coerce_number(s),
            FieldValue::Date(_) => None,
        }
    }

    /// Calendar-date view of the value; timestamps are truncated to their day.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(d) => Some(*d),
            FieldValue::Text(s) => parse_date(s),
            FieldValue::Number(_) => None,
        }
    }

    pub fn identity(&self) -> ValueIdentity {
        match self {
            FieldValue::Number(n) => {
                let bits = if *n == 0.0 { 0 } else { n.to_bits() };
                ValueIdentity::Number(bits)
            }
            FieldValue::Date(d) => ValueIdentity::Date(*d),
            FieldValue::Text(s) => ValueIdentity::Text(s.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) => write!(f, "{n}"),
            FieldValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

/// Hashable identity of a [`FieldValue`], used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueIdentity {
    Number(u64),
    Date(NaiveDate),
    Text(String),
}

/// One contract row: named fields mapped to scalar values.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        self.get(name).and_then(FieldValue::as_date)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(ToString::to_string)
    }

    /// Identity over every present field, in field-name order.
    pub fn row_identity(&self) -> Vec<(String, ValueIdentity)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.identity()))
            .collect()
    }

    /// Identity over the given key fields; `None` if any key field is absent.
    pub fn key_identity(&self, key: &[String]) -> Option<Vec<ValueIdentity>> {
        key.iter()
            .map(|name| self.get(name).map(FieldValue::identity))
            .collect()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// URL-like upstream field: a bare scalar or an object carrying a `url` member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference {
    StructuredReference { url: String },
    Scalar(String),
}

impl Reference {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => None,
            JsonValue::String(s) => Some(Reference::Scalar(s.clone())),
            JsonValue::Object(map) => match map.get("url") {
                Some(JsonValue::String(url)) => Some(Reference::StructuredReference { url: url.clone() }),
                Some(JsonValue::Null) => None,
                Some(other) => Some(Reference::StructuredReference {
                    url: other.to_string(),
                }),
                None => Some(Reference::Scalar(value.to_string())),
            },
            other => Some(Reference::Scalar(other.to_string())),
        }
    }

    pub fn into_url(self) -> String {
        match self {
            Reference::StructuredReference { url } => url,
            Reference::Scalar(s) => s,
        }
    }
}

/// Lenient numeric coercion; non-numeric or non-finite input maps to `None`.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parses the date shapes the upstream APIs emit, discarding any time of day.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(d);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.date());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    NaiveDate::parse_from_str(trimmed, "%m/%d/%Y").ok()
}
