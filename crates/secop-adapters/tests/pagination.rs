use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use secop_adapters::{secop1_adapter, AdapterConfig, AdapterError, FetchContext, SourceAdapter};
use secop_storage::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

#[derive(Clone)]
struct FakeSoda {
    rows: Arc<Vec<JsonValue>>,
    seen: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn resource(
    State(state): State<FakeSoda>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<JsonValue> {
    let offset = query.get("$offset").and_then(|v| v.parse().ok()).unwrap_or(0usize);
    let limit = query.get("$limit").and_then(|v| v.parse().ok()).unwrap_or(1000usize);
    state.seen.lock().unwrap().push(query);
    Json(JsonValue::Array(
        state.rows.iter().skip(offset).take(limit).cloned().collect(),
    ))
}

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn row(i: usize, day: usize) -> JsonValue {
    json!({
        "uid": format!("24-12-{i}"),
        "cuantia_contrato": "1000000",
        "fecha_de_cargue_en_el_secop": format!("2024-05-{day:02}T00:00:00.000"),
    })
}

fn rows(n: usize) -> Vec<JsonValue> {
    (1..=n).map(|i| row(i, i)).collect()
}

async fn fake_soda(n: usize) -> (String, FakeSoda) {
    fake_soda_with(rows(n)).await
}

async fn fake_soda_with(rows: Vec<JsonValue>) -> (String, FakeSoda) {
    let state = FakeSoda {
        rows: Arc::new(rows),
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let router = Router::new()
        .route("/resource/f789-7hwg.json", get(resource))
        .with_state(state.clone());
    (spawn(router).await, state)
}

fn ctx() -> FetchContext {
    FetchContext {
        run_id: Uuid::new_v4(),
    }
}

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

#[tokio::test]
async fn pages_until_a_short_page() {
    let (base, state) = fake_soda(5).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        page_size: 2,
        max_records: 100,
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.raw_rows, 5);
    assert_eq!(outcome.records.len(), 5);
    assert!(!outcome.truncated);

    let seen = state.seen.lock().unwrap();
    let offsets = seen
        .iter()
        .map(|q| q["$offset"].clone())
        .collect::<Vec<_>>();
    assert_eq!(offsets, vec!["0", "2", "4"]);
    assert_eq!(seen[0]["$where"], "fecha_de_cargue_en_el_secop >= '2024-05-01'");
}

#[tokio::test]
async fn hitting_the_cap_is_reported_as_truncated() {
    let (base, state) = fake_soda(5).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        page_size: 3,
        max_records: 4,
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert!(outcome.truncated);
    assert_eq!(outcome.raw_rows, 4);
    assert_eq!(outcome.pages, 2);
    assert_eq!(limits(&state), vec!["3", "1"]);
}

fn limits(state: &FakeSoda) -> Vec<String> {
    state
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|q| q["$limit"].clone())
        .collect()
}

#[tokio::test]
async fn cap_inside_one_day_pages_to_the_end_of_that_day() {
    let (base, state) = fake_soda_with((1..=5).map(|i| row(i, 10)).collect()).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        page_size: 3,
        max_records: 4,
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert!(!outcome.truncated);
    assert_eq!(outcome.raw_rows, 5);
    assert_eq!(outcome.records.len(), 5);
    assert_eq!(limits(&state), vec!["3", "1", "3"]);
}

#[tokio::test]
async fn cap_inside_one_day_stops_once_the_next_day_appears() {
    let mut day_rows = (1..=5).map(|i| row(i, 10)).collect::<Vec<_>>();
    day_rows.extend((6..=9).map(|i| row(i, 11)));
    let (base, state) = fake_soda_with(day_rows).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        page_size: 2,
        max_records: 4,
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let mut outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert!(outcome.truncated);
    assert_eq!(outcome.raw_rows, 6);
    assert_eq!(limits(&state), vec!["2", "2", "2"]);

    assert_eq!(outcome.defer_latest_day(), 1);
    assert_eq!(outcome.records.len(), 5);
    assert_eq!(
        outcome.latest_date(),
        NaiveDate::from_ymd_opt(2024, 5, 10)
    );
}

#[tokio::test]
async fn no_matching_records_is_an_empty_outcome() {
    let (base, _state) = fake_soda(0).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        ..Default::default()
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.pages, 1);
    assert!(!outcome.truncated);
}

#[tokio::test]
async fn upstream_failure_propagates_without_retry() {
    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    let router = Router::new().route(
        "/resource/f789-7hwg.json",
        get(move || {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                (StatusCode::SERVICE_UNAVAILABLE, "down for maintenance")
            }
        }),
    );
    let base = spawn(router).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        ..Default::default()
    });
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();

    let err = adapter.fetch_since(&http, &ctx(), start()).await.unwrap_err();
    assert!(matches!(
        err,
        AdapterError::Fetch(FetchError::HttpStatus { status: 503, .. })
    ));
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[tokio::test]
async fn opted_in_retries_recover_from_a_transient_failure() {
    let hits = Arc::new(Mutex::new(0usize));
    let counter = hits.clone();
    let router = Router::new().route(
        "/resource/f789-7hwg.json",
        get(move || {
            let counter = counter.clone();
            async move {
                let mut hits = counter.lock().unwrap();
                *hits += 1;
                if *hits == 1 {
                    Err(StatusCode::SERVICE_UNAVAILABLE)
                } else {
                    Ok(Json(JsonValue::Array(rows(2))))
                }
            }
        }),
    );
    let base = spawn(router).await;
    let adapter = secop1_adapter(AdapterConfig {
        api_base: base,
        ..Default::default()
    });
    let http = HttpFetcher::new(HttpClientConfig {
        backoff: BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..Default::default()
    })
    .unwrap();

    let outcome = adapter.fetch_since(&http, &ctx(), start()).await.unwrap();
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(*hits.lock().unwrap(), 2);
}
