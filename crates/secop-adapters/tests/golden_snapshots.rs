use std::path::{Path, PathBuf};

use secop_adapters::{adapter_for_source, load_fixture_payload, AdapterConfig, SourceAdapter};
use secop_core::{FieldKind, Record, SourceId, SourceSchema};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct GoldenRecord {
    key: Option<String>,
    date: String,
    value_millions: f64,
    entity: Option<String>,
    reference: Option<String>,
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture_path(source: SourceId, file: &str) -> PathBuf {
    workspace_root()
        .join("fixtures")
        .join(source.slug())
        .join("sample")
        .join(file)
}

fn to_golden(schema: &SourceSchema, record: &Record) -> GoldenRecord {
    let reference_field = schema
        .fields
        .iter()
        .find(|f| f.kind == FieldKind::Reference)
        .map(|f| f.name)
        .expect("schema has a reference field");
    GoldenRecord {
        key: schema.dedup_key.first().and_then(|k| record.text(k)),
        date: record
            .date(schema.date_field)
            .expect("date survives validation")
            .format("%Y-%m-%d")
            .to_string(),
        value_millions: record
            .number(schema.value_field)
            .expect("value survives validation"),
        entity: record.text("nombre_entidad"),
        reference: record.text(reference_field),
    }
}

fn assert_matches_snapshot(source: SourceId) {
    let adapter = adapter_for_source(source, AdapterConfig::default());
    let payload = load_fixture_payload(fixture_path(source, "payload.json")).unwrap();
    let page = adapter.parse_rows(&payload).unwrap();
    let actual = page
        .records
        .iter()
        .map(|r| to_golden(adapter.schema(), r))
        .collect::<Vec<_>>();

    let text = std::fs::read_to_string(fixture_path(source, "snapshot.json")).unwrap();
    let expected: Vec<GoldenRecord> = serde_json::from_str(&text).unwrap();
    assert_eq!(actual, expected);
    assert_eq!(page.raw_rows, expected.len() + 2);
}

#[test]
fn golden_json_snapshot_test_secop1() {
    assert_matches_snapshot(SourceId::Secop1);
}

#[test]
fn golden_json_snapshot_test_secop2() {
    assert_matches_snapshot(SourceId::Secop2);
}
