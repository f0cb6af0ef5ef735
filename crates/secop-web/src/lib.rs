//! Axum + Askama dashboard over the per-source parquet stores.

mod export;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDate};
use secop_core::{
    aggregate_daily, aggregate_daily_by_category, apply_category_filters, distinct_values,
    filter_window, summarize, CategoryFilter, CategoryMetricRow, DailyMetricRow, MetricTotals,
    Record, SourceId, TimeWindow,
};
use secop_storage::DatasetStore;
use secop_sync::latest_run_summary;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub use export::{daily_metrics_xlsx, export_file_name, export_sheet_name, XLSX_CONTENT_TYPE};

pub const CRATE_NAME: &str = "secop-web";

/// Day-window bounds and data location for the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub min_days: u32,
    pub max_days: u32,
    pub default_days: u32,
    pub day_step: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            port: 8000,
            min_days: 30,
            max_days: 365,
            default_days: 180,
            day_step: 15,
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("SECOP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.data_dir.clone()),
            port: std::env::var("SECOP_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            ..defaults
        }
    }

    pub fn clamp_days(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_days)
            .clamp(self.min_days, self.max_days)
    }

    /// Categorical fields offered as filters for `source`.
    pub fn filter_fields(&self, source: SourceId) -> &'static [&'static str] {
        source.schema().category_fields
    }
}

/// Parsed dashboard query string: `days`, `raw` and `<source>.<field>=<value>` filters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DashboardQuery {
    pub days: u32,
    pub show_raw: bool,
    pub filters: BTreeMap<SourceId, Vec<CategoryFilter>>,
}

impl DashboardQuery {
    pub fn from_params(config: &DashboardConfig, params: &HashMap<String, String>) -> Self {
        let days = config.clamp_days(params.get("days").and_then(|v| v.trim().parse().ok()));
        let show_raw = params
            .get("raw")
            .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "on"));

        let mut filters: BTreeMap<SourceId, Vec<CategoryFilter>> = BTreeMap::new();
        for (key, value) in params {
            let Some((slug, field)) = key.split_once('.') else {
                continue;
            };
            let Some(source) = SourceId::from_slug(slug) else {
                continue;
            };
            if value.trim().is_empty() || !config.filter_fields(source).contains(&field) {
                continue;
            }
            filters.entry(source).or_default().push(CategoryFilter {
                field: field.to_string(),
                value: value.clone(),
            });
        }
        for list in filters.values_mut() {
            list.sort_by(|a, b| a.field.cmp(&b.field));
        }

        Self {
            days,
            show_raw,
            filters,
        }
    }

    pub fn filters_for(&self, source: SourceId) -> &[CategoryFilter] {
        self.filters.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }

    fn selected(&self, source: SourceId, field: &str) -> Option<&str> {
        self.filters_for(source)
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.value.as_str())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub workspace_root: PathBuf,
    pub config: DashboardConfig,
    today: Option<NaiveDate>,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>, config: DashboardConfig) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            config,
            today: None,
        }
    }

    /// Pins the date the day window is measured from.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    fn store(&self, source: SourceId) -> DatasetStore {
        DatasetStore::for_source(&self.config.data_dir, source)
    }

    fn window(&self, days: u32) -> TimeWindow {
        TimeWindow::last_n_days(self.today(), days)
    }
}

/// Windowed raw records and the user-filtered daily series for one source.
struct SourceSeries {
    source: SourceId,
    has_store: bool,
    windowed: Vec<Record>,
    daily: Vec<DailyMetricRow>,
}

impl SourceSeries {
    fn totals(&self) -> MetricTotals {
        summarize(&self.daily)
    }
}

#[derive(Debug, Clone)]
struct KpiCard {
    label: String,
    value: String,
}

#[derive(Debug, Clone)]
struct FilterOption {
    value: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct FilterControl {
    param: String,
    label: String,
    options: Vec<FilterOption>,
}

#[derive(Debug, Clone)]
struct FilterGroup {
    label: String,
    controls: Vec<FilterControl>,
}

#[derive(Debug, Clone)]
struct DailyTableRow {
    date: String,
    contracts: String,
    sum_millions: String,
    avg_millions: String,
}

#[derive(Debug, Clone)]
struct DistributionChart {
    title: String,
    field: String,
}

#[derive(Debug, Clone)]
struct SourcePanel {
    slug: String,
    label: String,
    empty_message: Option<String>,
    distributions: Vec<DistributionChart>,
    table: Vec<DailyTableRow>,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    days: u32,
    min_days: u32,
    max_days: u32,
    day_step: u32,
    window_start: String,
    show_raw: bool,
    notice: Option<String>,
    last_run: Option<String>,
    filter_groups: Vec<FilterGroup>,
    kpis: Vec<KpiCard>,
    panels: Vec<SourcePanel>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/charts/{source}", get(charts_handler))
        .route(
            "/charts/{source}/distribution/{field}",
            get(distribution_handler),
        )
        .route("/api/metrics/{source}", get(metrics_handler))
        .route("/export/{source}", get(export_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppState::new(".", DashboardConfig::from_env())).await
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port = state.config.port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %state.config.data_dir.display(), "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let query = DashboardQuery::from_params(&state.config, &params);
    match build_dashboard(&state, &query) {
        Ok(tpl) => render_html(tpl),
        Err(err) => server_error(err),
    }
}

async fn charts_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(source) = SourceId::from_slug(&slug) else {
        return not_found("Fuente desconocida");
    };
    let query = DashboardQuery::from_params(&state.config, &params);
    match load_series(&state, source, &query) {
        Ok(series) => Json(json!({
            "source": source.slug(),
            "label": source.label(),
            "figures": daily_figures(source, &series.daily),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn distribution_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((slug, field)): AxumPath<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(source) = SourceId::from_slug(&slug) else {
        return not_found("Fuente desconocida");
    };
    if !state.config.filter_fields(source).contains(&field.as_str()) {
        return not_found("Campo de categoría desconocido");
    }
    let query = DashboardQuery::from_params(&state.config, &params);
    let schema = source.schema();
    match load_windowed(&state, source, state.window(query.days)) {
        Ok(records) => {
            let rows = aggregate_daily_by_category(
                &records.unwrap_or_default(),
                schema.date_field,
                schema.value_field,
                &field,
                schema.label,
            );
            Json(distribution_figure(source, &field, &rows)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(source) = SourceId::from_slug(&slug) else {
        return not_found("Fuente desconocida");
    };
    let query = DashboardQuery::from_params(&state.config, &params);
    match load_series(&state, source, &query) {
        Ok(series) => Json(series.daily).into_response(),
        Err(err) => server_error(err),
    }
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(source) = SourceId::from_slug(&slug) else {
        return not_found("Fuente desconocida");
    };
    let query = DashboardQuery::from_params(&state.config, &params);
    let workbook = load_series(&state, source, &query)
        .and_then(|series| daily_metrics_xlsx(source, &series.daily));
    match workbook {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", export_file_name(source)),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Error del servidor: {err}")),
    )
        .into_response()
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

/// `None` when the store has not been created yet.
fn load_windowed(
    state: &AppState,
    source: SourceId,
    window: TimeWindow,
) -> anyhow::Result<Option<Vec<Record>>> {
    let store = state.store(source);
    if !store.exists() {
        return Ok(None);
    }
    let records = store.load()?;
    Ok(Some(filter_window(&records, source.schema().date_field, window)))
}

fn load_series(
    state: &AppState,
    source: SourceId,
    query: &DashboardQuery,
) -> anyhow::Result<SourceSeries> {
    let schema = source.schema();
    let (has_store, windowed) = match load_windowed(state, source, state.window(query.days))? {
        Some(records) => (true, records),
        None => (false, Vec::new()),
    };
    let filtered = apply_category_filters(&windowed, query.filters_for(source));
    let daily = aggregate_daily(&filtered, schema.date_field, schema.value_field, schema.label);
    Ok(SourceSeries {
        source,
        has_store,
        windowed,
        daily,
    })
}

fn build_dashboard(state: &AppState, query: &DashboardQuery) -> anyhow::Result<DashboardTemplate> {
    let series = SourceId::ALL
        .into_iter()
        .map(|source| load_series(state, source, query))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let notice = if series.iter().all(|s| !s.has_store) {
        Some(
            "No se encontraron archivos Parquet (secop1.parquet / secop2.parquet). \
             Ejecuta primero la ingesta diaria."
                .to_string(),
        )
    } else if series.iter().all(|s| s.windowed.is_empty()) {
        Some("No hay datos en la ventana de días seleccionada.".to_string())
    } else {
        None
    };

    let totals = series.iter().map(|s| (s.source, s.totals())).collect::<Vec<_>>();
    let mut kpis = totals
        .iter()
        .map(|(source, t)| KpiCard {
            label: format!("Contratos ({})", source.label()),
            value: format_count(t.contracts),
        })
        .collect::<Vec<_>>();
    kpis.extend(totals.iter().map(|(source, t)| KpiCard {
        label: format!("Total ({}, millones)", source.label()),
        value: format_millions(t.sum_millions),
    }));

    let last_run = match latest_run_summary(&state.config.data_dir) {
        Ok(summary) => summary.map(|run| {
            run.finished_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        }),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "could not read run summaries");
            None
        }
    };

    Ok(DashboardTemplate {
        days: query.days,
        min_days: state.config.min_days,
        max_days: state.config.max_days,
        day_step: state.config.day_step,
        window_start: state.window(query.days).start.format("%Y-%m-%d").to_string(),
        show_raw: query.show_raw,
        notice,
        last_run,
        filter_groups: series
            .iter()
            .map(|s| filter_group(&state.config, s, query))
            .collect(),
        kpis,
        panels: series
            .iter()
            .map(|s| source_panel(&state.config, s, query))
            .collect(),
    })
}

fn filter_group(config: &DashboardConfig, series: &SourceSeries, query: &DashboardQuery) -> FilterGroup {
    let source = series.source;
    let controls = config
        .filter_fields(source)
        .iter()
        .map(|field| {
            let selected = query.selected(source, field);
            let mut values = distinct_values(&series.windowed, field)
                .into_iter()
                .collect::<BTreeSet<_>>();
            if let Some(value) = selected {
                values.insert(value.to_string());
            }
            FilterControl {
                param: format!("{}.{}", source.slug(), field),
                label: field_label(field),
                options: values
                    .into_iter()
                    .map(|value| FilterOption {
                        selected: selected == Some(value.as_str()),
                        value,
                    })
                    .collect(),
            }
        })
        .collect();
    FilterGroup {
        label: source.label().to_string(),
        controls,
    }
}

fn source_panel(config: &DashboardConfig, series: &SourceSeries, query: &DashboardQuery) -> SourcePanel {
    let source = series.source;
    let label = source.label();
    let empty_message = if !series.has_store {
        Some(format!("Aún no hay datos almacenados de {label}."))
    } else if series.daily.is_empty() && !query.filters_for(source).is_empty() {
        Some(format!(
            "No hay datos de {label} para esta ventana con los filtros seleccionados."
        ))
    } else if series.daily.is_empty() {
        Some(format!("No hay datos de {label} para esta ventana."))
    } else {
        None
    };

    let distributions = if series.windowed.is_empty() {
        Vec::new()
    } else {
        config
            .filter_fields(source)
            .iter()
            .map(|field| DistributionChart {
                title: format!("Distribución por {}", field_label(field).to_lowercase()),
                field: field.to_string(),
            })
            .collect()
    };

    let table = if query.show_raw {
        series
            .daily
            .iter()
            .map(|row| DailyTableRow {
                date: row.date.format("%Y-%m-%d").to_string(),
                contracts: format_count(row.contracts),
                sum_millions: format_millions(row.sum_millions),
                avg_millions: format_millions(row.avg_millions),
            })
            .collect()
    } else {
        Vec::new()
    };

    SourcePanel {
        slug: source.slug().to_string(),
        label: label.to_string(),
        empty_message,
        distributions,
        table,
    }
}

fn daily_figures(source: SourceId, rows: &[DailyMetricRow]) -> Vec<JsonValue> {
    let label = source.label();
    vec![
        line_figure(
            rows,
            &format!("Número de contratos diarios ({label})"),
            "Número de contratos",
            |r| r.contracts as f64,
        ),
        line_figure(
            rows,
            &format!("Suma diaria de contratos ({label}, millones)"),
            "Suma de contratos (millones)",
            |r| r.sum_millions,
        ),
        line_figure(
            rows,
            &format!("Valor promedio por contrato ({label}, millones)"),
            "Promedio por contrato (millones)",
            |r| r.avg_millions,
        ),
    ]
}

fn line_figure(
    rows: &[DailyMetricRow],
    title: &str,
    y_title: &str,
    y: impl Fn(&DailyMetricRow) -> f64,
) -> JsonValue {
    let x = rows
        .iter()
        .map(|r| r.date.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>();
    let y = rows.iter().map(y).collect::<Vec<_>>();
    json!({
        "data": [{
            "type": "scatter",
            "mode": "lines+markers",
            "x": x,
            "y": y,
            "line": {"color": "#0ea5e9"}
        }],
        "layout": chart_layout(title, y_title, json!({}))
    })
}

/// Percent-stacked area per category; days where a category is absent count as zero.
fn distribution_figure(source: SourceId, field: &str, rows: &[CategoryMetricRow]) -> JsonValue {
    let dates = rows.iter().map(|r| r.date).collect::<BTreeSet<_>>();
    let mut by_category: BTreeMap<&str, BTreeMap<NaiveDate, usize>> = BTreeMap::new();
    for row in rows {
        by_category
            .entry(row.category.as_str())
            .or_default()
            .insert(row.date, row.contracts);
    }

    let x = dates
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>();
    let traces = by_category
        .into_iter()
        .map(|(category, counts)| {
            let y = dates
                .iter()
                .map(|d| counts.get(d).copied().unwrap_or(0))
                .collect::<Vec<_>>();
            json!({
                "type": "scatter",
                "mode": "lines",
                "name": category,
                "stackgroup": "one",
                "groupnorm": "percent",
                "x": x,
                "y": y
            })
        })
        .collect::<Vec<_>>();

    let title = format!(
        "Distribución por {} ({})",
        field_label(field).to_lowercase(),
        source.label()
    );
    json!({
        "data": traces,
        "layout": chart_layout(&title, "% de contratos", json!({"ticksuffix": "%"}))
    })
}

fn chart_layout(title: &str, y_title: &str, y_extra: JsonValue) -> JsonValue {
    let mut yaxis = json!({"title": {"text": y_title}});
    if let (Some(axis), JsonValue::Object(extra)) = (yaxis.as_object_mut(), y_extra) {
        axis.extend(extra);
    }
    json!({
        "title": {"text": title},
        "height": 350,
        "margin": {"l": 50, "r": 10, "t": 40, "b": 40},
        "xaxis": {"title": {"text": "Fecha"}},
        "yaxis": yaxis,
        "paper_bgcolor": "#ffffff",
        "plot_bgcolor": "#f8fafc"
    })
}

fn field_label(field: &str) -> String {
    let spaced = field.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn group_thousands(digits: &str) -> String {
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn format_count(n: usize) -> String {
    group_thousands(&n.to_string())
}

fn format_millions(value: f64) -> String {
    let formatted = format!("{:.2}", value.abs());
    let (int_part, frac_part) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));
    let sign = if value < 0.0 && formatted != "0.00" { "-" } else { "" };
    format!("{sign}{}.{frac_part}", group_thousands(int_part))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use secop_core::FieldValue;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn secop1(uid: &str, date: NaiveDate, millions: f64, estado: &str) -> Record {
        Record::new()
            .with("uid", uid)
            .with("fecha_de_cargue_en_el_secop", date)
            .with("cuantia_contrato", millions)
            .with("estado_del_proceso", estado)
    }

    fn secop2(id: &str, date: NaiveDate, millions: f64, sector: &str) -> Record {
        Record::new()
            .with("id_contrato", id)
            .with("fecha_de_firma", date)
            .with("valor_del_contrato", FieldValue::Number(millions))
            .with("sector", sector)
    }

    fn seeded_data_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        DatasetStore::for_source(dir.path(), SourceId::Secop1)
            .merge(
                vec![
                    secop1("a", ymd(2024, 5, 2), 125.0, "Celebrado"),
                    secop1("b", ymd(2024, 5, 2), 98.75, "Liquidado"),
                    secop1("c", ymd(2023, 1, 1), 500.0, "Celebrado"),
                ],
                None,
            )
            .unwrap();
        DatasetStore::for_source(dir.path(), SourceId::Secop2)
            .merge(
                vec![
                    secop2("x", ymd(2024, 5, 10), 250.0, "Salud"),
                    secop2("y", ymd(2024, 5, 11), 1.5, "Defensa"),
                    secop2("z", ymd(2024, 5, 11), 10.0, "Salud"),
                ],
                None,
            )
            .unwrap();
        dir
    }

    fn test_app(data_dir: &Path) -> Router {
        let config = DashboardConfig {
            data_dir: data_dir.to_path_buf(),
            ..Default::default()
        };
        app(AppState::new(workspace_root(), config).with_today(ymd(2024, 6, 1)))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, body)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let (status, _, body) = get(app, uri).await;
        (status, String::from_utf8(body).unwrap())
    }

    async fn get_json(app: Router, uri: &str) -> JsonValue {
        let (status, _, body) = get(app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn dashboard_without_stores_shows_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let (status, text) = get_text(test_app(dir.path()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Monitor de contratación"));
        assert!(text.contains("No se encontraron archivos Parquet"));
    }

    #[tokio::test]
    async fn dashboard_with_nothing_in_window_says_so() {
        let dir = tempfile::tempdir().unwrap();
        DatasetStore::for_source(dir.path(), SourceId::Secop1)
            .merge(vec![secop1("old", ymd(2020, 1, 1), 1.0, "Celebrado")], None)
            .unwrap();
        let (status, text) = get_text(test_app(dir.path()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No hay datos en la ventana de días seleccionada."));
    }

    #[tokio::test]
    async fn dashboard_renders_kpis_filters_and_chart_slots() {
        let dir = seeded_data_dir();
        let (status, text) = get_text(test_app(dir.path()), "/?raw=1").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Contratos (SECOP 1)"));
        assert!(text.contains("223.75"));
        assert!(text.contains("261.50"));
        assert!(text.contains("desde el 2023-12-04"));
        assert!(text.contains(r#"name="secop2.sector""#));
        assert!(text.contains(r#"data-chart-url="/charts/secop2/distribution/sector""#));
        assert!(text.contains("Tabla diaria de métricas (SECOP 2)"));
    }

    #[tokio::test]
    async fn days_parameter_is_clamped_to_configured_bounds() {
        let dir = seeded_data_dir();
        let (_, low) = get_text(test_app(dir.path()), "/?days=5").await;
        assert!(low.contains("últimos <strong>30</strong> días"));
        let (_, high) = get_text(test_app(dir.path()), "/?days=5000").await;
        assert!(high.contains("últimos <strong>365</strong> días"));
        let (_, junk) = get_text(test_app(dir.path()), "/?days=abc").await;
        assert!(junk.contains("últimos <strong>180</strong> días"));
    }

    #[tokio::test]
    async fn metrics_api_windows_and_filters_before_aggregating() {
        let dir = seeded_data_dir();
        let rows = get_json(test_app(dir.path()), "/api/metrics/secop1").await;
        assert_eq!(
            rows,
            json!([{
                "fecha": "2024-05-02",
                "n_contratos": 2,
                "suma_millones": 223.75,
                "promedio_millones": 111.875,
                "fuente": "SECOP 1"
            }])
        );

        let all = get_json(test_app(dir.path()), "/api/metrics/secop2").await;
        assert_eq!(all[1]["n_contratos"], 2);

        let salud = get_json(test_app(dir.path()), "/api/metrics/secop2?secop2.sector=Salud").await;
        let counts = salud
            .as_array()
            .unwrap()
            .iter()
            .map(|r| (r["fecha"].as_str().unwrap().to_string(), r["n_contratos"].as_u64().unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(
            counts,
            vec![("2024-05-10".to_string(), 1), ("2024-05-11".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn unknown_sources_and_fields_are_not_found() {
        let dir = seeded_data_dir();
        for uri in [
            "/charts/secop3",
            "/api/metrics/nope",
            "/export/nope",
            "/charts/secop2/distribution/nombre_entidad",
        ] {
            let (status, _, _) = get(test_app(dir.path()), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn line_charts_cover_count_sum_and_average() {
        let dir = seeded_data_dir();
        let payload = get_json(test_app(dir.path()), "/charts/secop1").await;
        let figures = payload["figures"].as_array().unwrap();
        assert_eq!(figures.len(), 3);
        assert_eq!(figures[0]["data"][0]["x"], json!(["2024-05-02"]));
        assert_eq!(figures[0]["data"][0]["y"], json!([2.0]));
        assert_eq!(figures[0]["data"][0]["mode"], "lines+markers");
    }

    #[tokio::test]
    async fn distribution_is_percent_stacked_and_ignores_user_filters() {
        let dir = seeded_data_dir();
        let payload = get_json(
            test_app(dir.path()),
            "/charts/secop2/distribution/sector?secop2.sector=Salud",
        )
        .await;
        let traces = payload["data"].as_array().unwrap();
        let names = traces.iter().map(|t| t["name"].clone()).collect::<Vec<_>>();
        assert_eq!(names, vec![json!("Defensa"), json!("Salud")]);
        assert_eq!(traces[0]["groupnorm"], "percent");
        assert_eq!(traces[0]["x"], json!(["2024-05-10", "2024-05-11"]));
        assert_eq!(traces[0]["y"], json!([0, 1]));
        assert_eq!(traces[1]["y"], json!([1, 1]));
    }

    #[tokio::test]
    async fn export_downloads_a_workbook() {
        let dir = seeded_data_dir();
        let (status, headers, body) = get(test_app(dir.path()), "/export/secop1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], XLSX_CONTENT_TYPE);
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("secop1_metricas_diarias.xlsx"));
        assert!(body.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn stylesheet_is_served_from_workspace_assets() {
        let dir = tempfile::tempdir().unwrap();
        let (status, headers, _) = get(test_app(dir.path()), "/assets/static/app.css").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/css; charset=utf-8");
    }

    #[test]
    fn query_parsing_keeps_only_known_category_filters() {
        let config = DashboardConfig::default();
        let params = HashMap::from([
            ("days".to_string(), "90".to_string()),
            ("raw".to_string(), "on".to_string()),
            ("secop2.sector".to_string(), "Salud".to_string()),
            ("secop2.departamento".to_string(), "".to_string()),
            ("secop2.nombre_entidad".to_string(), "X".to_string()),
            ("secop9.sector".to_string(), "Salud".to_string()),
            ("secop1.estado_del_proceso".to_string(), "Celebrado".to_string()),
        ]);
        let query = DashboardQuery::from_params(&config, &params);
        assert_eq!(query.days, 90);
        assert!(query.show_raw);
        assert_eq!(
            query.filters_for(SourceId::Secop2),
            &[CategoryFilter {
                field: "sector".into(),
                value: "Salud".into(),
            }]
        );
        assert_eq!(query.selected(SourceId::Secop1, "estado_del_proceso"), Some("Celebrado"));
        assert_eq!(DashboardQuery::from_params(&config, &HashMap::new()).days, 180);
    }

    #[test]
    fn numbers_are_grouped_for_display() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(1_234_567), "1,234,567");
        assert_eq!(format_millions(1_234_567.891), "1,234,567.89");
        assert_eq!(format_millions(-1234.5), "-1,234.50");
        assert_eq!(format_millions(0.004), "0.00");
        assert_eq!(field_label("modalidad_de_contratacion"), "Modalidad de contratacion");
    }
}
