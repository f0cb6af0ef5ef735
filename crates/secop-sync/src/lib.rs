//! Ingestion driver: per-source watermark → fetch → merge cycle, run summaries and the
//! optional cron scheduler.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use secop_adapters::{
    adapter_for_source, AdapterConfig, FetchContext, SourceAdapter, DEFAULT_API_BASE,
};
use secop_core::SourceId;
use secop_storage::{BackoffPolicy, DatasetStore, HttpClientConfig, HttpFetcher, MergeOutcome};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "secop-sync";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_dir: PathBuf,
    pub api_base: String,
    pub app_token: Option<String>,
    pub lookback_days: u32,
    pub page_size: usize,
    pub max_records: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let adapter = AdapterConfig::default();
        Self {
            data_dir: PathBuf::from("./data"),
            api_base: DEFAULT_API_BASE.to_string(),
            app_token: None,
            lookback_days: 365,
            page_size: adapter.page_size,
            max_records: adapter.max_records,
            user_agent: "secop-monitor/0.1".to_string(),
            http_timeout_secs: 60,
            http_max_retries: 0,
            scheduler_enabled: false,
            ingest_cron: "0 6 * * *".to_string(),
        }
    }
}

fn parsed_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag(raw: Option<String>) -> bool {
    raw.map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset or unparseable keys keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("SECOP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            api_base: lookup("SECOP_API_BASE").unwrap_or(defaults.api_base),
            app_token: lookup("SECOP_APP_TOKEN").filter(|t| !t.trim().is_empty()),
            lookback_days: parsed_or(lookup("SECOP_LOOKBACK_DAYS"), defaults.lookback_days),
            page_size: parsed_or(lookup("SECOP_PAGE_SIZE"), defaults.page_size),
            max_records: parsed_or(lookup("SECOP_MAX_RECORDS"), defaults.max_records),
            user_agent: lookup("SECOP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed_or(
                lookup("SECOP_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout_secs,
            ),
            http_max_retries: parsed_or(
                lookup("SECOP_HTTP_MAX_RETRIES"),
                defaults.http_max_retries,
            ),
            scheduler_enabled: flag(lookup("SECOP_SCHEDULER_ENABLED")),
            ingest_cron: lookup("SECOP_INGEST_CRON").unwrap_or(defaults.ingest_cron),
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            api_base: self.api_base.clone(),
            page_size: self.page_size,
            max_records: self.max_records,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            app_token: self.app_token.clone(),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }

    pub fn store_for(&self, source: SourceId) -> DatasetStore {
        DatasetStore::for_source(&self.data_dir, source)
    }

    pub fn runs_dir(&self) -> PathBuf {
        runs_dir(&self.data_dir)
    }
}

fn runs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("runs")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIngestReport {
    pub source: SourceId,
    pub label: String,
    pub watermark: NaiveDate,
    pub start_date: NaiveDate,
    pub today: NaiveDate,
    /// Raw rows read from the API, before validation.
    pub raw_rows: usize,
    pub fetched_rows: usize,
    pub dropped_rows: usize,
    /// Rows held back from the last day of a truncated fetch.
    pub deferred_rows: usize,
    pub truncated: bool,
    /// `None` when the store was already up to date and nothing was fetched.
    pub merge: Option<MergeOutcome>,
}

impl SourceIngestReport {
    fn up_to_date(
        source: SourceId,
        watermark: NaiveDate,
        start_date: NaiveDate,
        today: NaiveDate,
    ) -> Self {
        Self {
            source,
            label: source.label().to_string(),
            watermark,
            start_date,
            today,
            raw_rows: 0,
            fetched_rows: 0,
            dropped_rows: 0,
            deferred_rows: 0,
            truncated: false,
            merge: None,
        }
    }

    pub fn appended_rows(&self) -> usize {
        self.merge.map(|m| m.appended_rows).unwrap_or(0)
    }

    /// Operator-facing one-line status.
    pub fn status_line(&self) -> String {
        let Some(merge) = self.merge else {
            return format!("[{}] No hay días nuevos que consultar.", self.label);
        };
        let mut line = format!(
            "[{}] Desde {} hasta {}: {} registros nuevos, {} agregados, {} almacenados.",
            self.label,
            self.start_date,
            self.today,
            self.fetched_rows,
            merge.appended_rows,
            merge.stored_rows
        );
        if self.truncated && self.deferred_rows > 0 {
            line.push_str(&format!(
                " Resultado truncado: {} registros del último día quedan para la próxima corrida.",
                self.deferred_rows
            ));
        } else if self.truncated {
            line.push_str(
                " Resultado truncado: no hubo un día que diferir; pueden faltar registros posteriores al tope.",
            );
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub sources: Vec<SourceIngestReport>,
}

impl IngestRunSummary {
    pub fn status_lines(&self) -> Vec<String> {
        self.sources.iter().map(SourceIngestReport::status_line).collect()
    }
}

pub struct IngestPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    adapters: Vec<Box<dyn SourceAdapter>>,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let adapters = SourceId::ALL
            .into_iter()
            .map(|source| adapter_for_source(source, config.adapter_config()))
            .collect();
        Self::with_adapters(config, adapters)
    }

    pub fn with_adapters(
        config: IngestConfig,
        adapters: Vec<Box<dyn SourceAdapter>>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self {
            config,
            http,
            adapters,
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<IngestRunSummary> {
        self.run_for_date(Local::now().date_naive()).await
    }

    /// One ingest pass with `today` as the upper end of the window. The first source
    /// failure aborts the run.
    pub async fn run_for_date(&self, today: NaiveDate) -> Result<IngestRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = FetchContext { run_id };

        let mut sources = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let span = info_span!("ingest_source", %run_id, source_id = adapter.source().slug());
            let report = self
                .ingest_source(adapter.as_ref(), &ctx, today)
                .instrument(span)
                .await?;
            sources.push(report);
        }

        let summary = IngestRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            today,
            sources,
        };
        self.write_run_summary(&summary).await?;
        Ok(summary)
    }

    async fn ingest_source(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &FetchContext,
        today: NaiveDate,
    ) -> Result<SourceIngestReport> {
        let source = adapter.source();
        let schema = adapter.schema();
        let store = self.config.store_for(source);

        let watermark = store
            .last_date(schema.date_field, self.config.lookback_days, today)
            .with_context(|| format!("reading watermark for {}", schema.label))?;
        let start_date = watermark
            .checked_add_days(Days::new(1))
            .with_context(|| format!("watermark {watermark} has no following day"))?;

        if start_date > today {
            info!(%watermark, %today, "store already up to date");
            return Ok(SourceIngestReport::up_to_date(source, watermark, start_date, today));
        }

        let mut outcome = adapter
            .fetch_since(&self.http, ctx, start_date)
            .await
            .with_context(|| format!("fetching {} since {start_date}", schema.label))?;

        let deferred_rows = if outcome.truncated {
            let latest = outcome.latest_date();
            let deferred = outcome.defer_latest_day();
            if deferred > 0 {
                warn!(
                    deferred,
                    latest = ?latest,
                    "fetch truncated; trailing day left for the next run"
                );
            } else {
                warn!(
                    latest = ?latest,
                    raw_rows = outcome.raw_rows,
                    "fetch truncated with no day to defer; rows past the cap were not fetched"
                );
            }
            deferred
        } else {
            0
        };

        let fetched_rows = outcome.records.len();
        let dedup_key = schema.dedup_key();
        let merge = store
            .merge(outcome.records, dedup_key.as_deref())
            .with_context(|| format!("merging into {}", store.path().display()))?;

        info!(
            %start_date,
            fetched_rows,
            appended = merge.appended_rows,
            stored = merge.stored_rows,
            "source ingested"
        );

        Ok(SourceIngestReport {
            source,
            label: schema.label.to_string(),
            watermark,
            start_date,
            today,
            raw_rows: outcome.raw_rows,
            fetched_rows,
            dropped_rows: outcome.dropped_rows,
            deferred_rows,
            truncated: outcome.truncated,
            merge: Some(merge),
        })
    }

    async fn write_run_summary(&self, summary: &IngestRunSummary) -> Result<PathBuf> {
        let dir = self.config.runs_dir();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join(format!("{}.json", summary.run_id));
        let tmp = dir.join(format!(".{}.json.tmp", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        Ok(path)
    }

    /// Returns a scheduler with the ingest job registered, or `None` when scheduling is
    /// disabled. The caller starts it.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }

    pub async fn build_scheduler(self: &Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.ingest_cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => {
                        for line in summary.status_lines() {
                            info!(run_id = %summary.run_id, "{line}");
                        }
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled ingest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

pub async fn run_ingest_once_from_env() -> Result<IngestRunSummary> {
    let config = IngestConfig::from_env();
    let pipeline = IngestPipeline::new(config)?;
    pipeline.run_once().await
}

/// Most recently finished run recorded under `<data_dir>/runs`, if any.
pub fn latest_run_summary(data_dir: &Path) -> Result<Option<IngestRunSummary>> {
    let dir = runs_dir(data_dir);
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut latest: Option<IngestRunSummary> = None;
    for entry in std::fs::read_dir(&dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let summary: IngestRunSummary = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        if latest
            .as_ref()
            .map_or(true, |current| summary.finished_at > current.finished_at)
        {
            latest = Some(summary);
        }
    }
    Ok(latest)
}
