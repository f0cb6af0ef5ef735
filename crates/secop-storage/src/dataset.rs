//! Append-only parquet dataset per source: watermark lookup and deduplicating merge.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use arrow_array::{
    Array, ArrayRef, Date32Array, Float64Array, Int64Array, LargeStringArray, RecordBatch,
    StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Datelike, Days, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use secop_core::{FieldKind, FieldValue, Record, SourceId, SourceSchema, ValueIdentity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Days from 0001-01-01 to 1970-01-01, the Date32 epoch.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
    schema: &'static SourceSchema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub previous_rows: usize,
    pub incoming_rows: usize,
    pub stored_rows: usize,
    /// Incoming records that survived deduplication against the store.
    pub appended_rows: usize,
    pub written: bool,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>, schema: &'static SourceSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn for_source(data_dir: impl AsRef<Path>, source: SourceId) -> Self {
        let schema = source.schema();
        Self::new(data_dir.as_ref().join(schema.store_file), schema)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &'static SourceSchema {
        self.schema
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn row_count(&self) -> Result<usize> {
        if !self.exists() {
            return Ok(0);
        }
        let builder = ParquetRecordBatchReaderBuilder::try_new(self.open()?)
            .with_context(|| format!("reading parquet metadata {}", self.path.display()))?;
        Ok(builder.metadata().file_metadata().num_rows().max(0) as usize)
    }

    /// Every stored record; empty when the store does not exist yet.
    pub fn load(&self) -> Result<Vec<Record>> {
        self.read_records(None)
    }

    /// Stored records restricted to the named columns.
    pub fn load_fields(&self, fields: &[&str]) -> Result<Vec<Record>> {
        self.read_records(Some(fields))
    }

    /// Latest calendar date in `date_field`, or `today - default_lookback_days` for a
    /// missing or empty store.
    pub fn last_date(
        &self,
        date_field: &str,
        default_lookback_days: u32,
        today: NaiveDate,
    ) -> Result<NaiveDate> {
        let fallback = today
            .checked_sub_days(Days::new(u64::from(default_lookback_days)))
            .unwrap_or(NaiveDate::MIN);
        if !self.exists() {
            return Ok(fallback);
        }
        let records = self.load_fields(&[date_field])?;
        Ok(records
            .iter()
            .filter_map(|r| r.date(date_field))
            .max()
            .unwrap_or(fallback))
    }

    /// Appends `new_records` after the stored rows, deduplicates and swaps the file in.
    ///
    /// With a `dedup_key` the first record per key wins; records missing a key field,
    /// or stores without a key, fall back to full-row equality.
    pub fn merge(
        &self,
        new_records: Vec<Record>,
        dedup_key: Option<&[String]>,
    ) -> Result<MergeOutcome> {
        let incoming_rows = new_records.len();
        if new_records.is_empty() {
            let rows = self.row_count()?;
            return Ok(MergeOutcome {
                previous_rows: rows,
                incoming_rows,
                stored_rows: rows,
                appended_rows: 0,
                written: false,
            });
        }

        let existed = self.exists();
        let mut combined = self.load()?;
        let previous_rows = combined.len();
        combined.extend(new_records);

        let keep = first_occurrences(&combined, dedup_key);
        let kept_existing = keep[..previous_rows].iter().filter(|k| **k).count();
        let appended_rows = keep[previous_rows..].iter().filter(|k| **k).count();

        // Unchanged only when every stored row survives and no incoming row does.
        if existed && appended_rows == 0 && kept_existing == previous_rows {
            debug!(store = %self.path.display(), incoming_rows, "batch already present; store unchanged");
            return Ok(MergeOutcome {
                previous_rows,
                incoming_rows,
                stored_rows: previous_rows,
                appended_rows,
                written: false,
            });
        }

        let merged = combined
            .into_iter()
            .zip(keep)
            .filter_map(|(record, kept)| kept.then_some(record))
            .collect::<Vec<_>>();
        self.write_atomic(&merged)?;
        info!(
            store = %self.path.display(),
            previous_rows,
            incoming_rows,
            appended_rows,
            collapsed_rows = previous_rows - kept_existing,
            stored_rows = merged.len(),
            "merged batch into store"
        );
        Ok(MergeOutcome {
            previous_rows,
            incoming_rows,
            stored_rows: merged.len(),
            appended_rows,
            written: true,
        })
    }

    fn open(&self) -> Result<File> {
        File::open(&self.path).with_context(|| format!("opening store {}", self.path.display()))
    }

    fn read_records(&self, projection: Option<&[&str]>) -> Result<Vec<Record>> {
        if !self.exists() {
            return Ok(Vec::new());
        }

        let mut builder = ParquetRecordBatchReaderBuilder::try_new(self.open()?)
            .with_context(|| format!("reading parquet metadata {}", self.path.display()))?;

        if let Some(fields) = projection {
            let arrow_schema = Arc::clone(builder.schema());
            let indices = fields
                .iter()
                .map(|name| {
                    arrow_schema.index_of(name).with_context(|| {
                        format!("store {} has no column {name}", self.path.display())
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
            builder = builder.with_projection(mask);
        }

        let reader = builder
            .build()
            .with_context(|| format!("building parquet reader {}", self.path.display()))?;

        let mut records = Vec::new();
        for batch in reader {
            let batch =
                batch.with_context(|| format!("reading record batch {}", self.path.display()))?;
            append_batch_records(&batch, &mut records)?;
        }
        Ok(records)
    }

    /// Writes to a sibling temp file and renames it over the store, so readers only ever
    /// observe the old or the new file.
    fn write_atomic(&self, records: &[Record]) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("creating store directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("store");
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let batch = records_to_batch(self.schema, records)?;
        let result = write_parquet(&temp_path, &batch).and_then(|()| {
            fs::rename(&temp_path, &self.path).with_context(|| {
                format!(
                    "atomically renaming temp store {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            })
        });
        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum DedupIdentity {
    Key(Vec<ValueIdentity>),
    Row(Vec<(String, ValueIdentity)>),
}

/// Marks the first occurrence of each record identity.
fn first_occurrences(records: &[Record], dedup_key: Option<&[String]>) -> Vec<bool> {
    let key = dedup_key.filter(|k| !k.is_empty());
    let mut seen = HashSet::with_capacity(records.len());
    records
        .iter()
        .map(|record| {
            let identity = key
                .and_then(|k| record.key_identity(k))
                .map(DedupIdentity::Key)
                .unwrap_or_else(|| DedupIdentity::Row(record.row_identity()));
            seen.insert(identity)
        })
        .collect()
}

/// Keeps the first occurrence of each record identity, preserving order.
pub fn dedup_records(records: Vec<Record>, dedup_key: Option<&[String]>) -> Vec<Record> {
    let keep = first_occurrences(&records, dedup_key);
    records
        .into_iter()
        .zip(keep)
        .filter_map(|(record, kept)| kept.then_some(record))
        .collect()
}

fn arrow_type(kind: FieldKind) -> DataType {
    match kind {
        FieldKind::Text | FieldKind::Reference => DataType::Utf8,
        FieldKind::Money | FieldKind::Number => DataType::Float64,
        FieldKind::Date => DataType::Date32,
    }
}

fn arrow_schema(schema: &SourceSchema) -> Arc<Schema> {
    Arc::new(Schema::new(
        schema
            .fields
            .iter()
            .map(|f| ArrowField::new(f.name, arrow_type(f.kind), true))
            .collect::<Vec<_>>(),
    ))
}

fn days_from_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
}

fn date_from_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(EPOCH_DAYS_FROM_CE)?)
}

fn records_to_batch(schema: &SourceSchema, records: &[Record]) -> Result<RecordBatch> {
    let columns = schema
        .fields
        .iter()
        .map(|f| -> ArrayRef {
            match f.kind {
                FieldKind::Text | FieldKind::Reference => Arc::new(StringArray::from(
                    records.iter().map(|r| r.text(f.name)).collect::<Vec<_>>(),
                )),
                FieldKind::Money | FieldKind::Number => Arc::new(Float64Array::from(
                    records.iter().map(|r| r.number(f.name)).collect::<Vec<_>>(),
                )),
                FieldKind::Date => Arc::new(Date32Array::from(
                    records
                        .iter()
                        .map(|r| r.date(f.name).map(days_from_date))
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();

    RecordBatch::try_new(arrow_schema(schema), columns)
        .with_context(|| format!("building {} record batch", schema.label))
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    let file = writer
        .into_inner()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

fn downcast<'a, T: 'static>(column: &'a ArrayRef, name: &str) -> Result<&'a T> {
    column
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("column '{name}' is not {}", std::any::type_name::<T>()))
}

fn column_values(column: &ArrayRef, name: &str) -> Result<Vec<Option<FieldValue>>> {
    let values = match column.data_type() {
        DataType::Utf8 => downcast::<StringArray>(column, name)?
            .iter()
            .map(|v| v.map(FieldValue::text))
            .collect(),
        DataType::LargeUtf8 => downcast::<LargeStringArray>(column, name)?
            .iter()
            .map(|v| v.map(FieldValue::text))
            .collect(),
        DataType::Float64 => downcast::<Float64Array>(column, name)?
            .iter()
            .map(|v| v.map(FieldValue::Number))
            .collect(),
        DataType::Int64 => downcast::<Int64Array>(column, name)?
            .iter()
            .map(|v| v.map(|n| FieldValue::Number(n as f64)))
            .collect(),
        DataType::Date32 => downcast::<Date32Array>(column, name)?
            .iter()
            .map(|v| v.and_then(date_from_days).map(FieldValue::Date))
            .collect(),
        other => bail!("column '{name}' has unsupported type {other}"),
    };
    Ok(values)
}

fn append_batch_records(batch: &RecordBatch, out: &mut Vec<Record>) -> Result<()> {
    let start = out.len();
    out.resize_with(start + batch.num_rows(), Record::new);
    let schema = batch.schema();
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let values = column_values(column, field.name())?;
        for (record, value) in out[start..].iter_mut().zip(values) {
            if let Some(value) = value {
                record.insert(field.name().as_str(), value);
            }
        }
    }
    Ok(())
}
