//! Incremental update pipeline: previous snapshot -> crawl -> normalize ->
//! diff -> enrich -> publish -> report.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use doge_adapters::{crawl, normalize, CrawlRequest, DEFAULT_API_ROOT, DEFAULT_PAGE_SIZE, DEFAULT_USAS_API_ROOT};
use doge_core::{run_stamp, snapshot_filename, Category, RecordTable, SnapshotName};
use doge_storage::bln::DEFAULT_BLN_API_URL;
use doge_storage::{
    read_snapshot_csv, remove_local_files, BlnClient, HttpClientConfig, HttpFetcher, PageFetcher,
    ProjectStorage, RateLimitConfig, RemoteFile, RetryPolicy, Throttle,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod diff;
pub mod enrich;
pub mod notify;
pub mod publish;

pub use diff::{diff, DiffOutcome};
pub use enrich::{enrich_rows, ContractEnricher, EnrichStats, GrantEnricher, RowEnricher, RunLog};
pub use notify::{Notifier, Severity, SlackNotifier};
pub use publish::{NewRowCounts, SnapshotPublisher, UploadOutcome};

pub const CRATE_NAME: &str = "doge-sync";

pub const NO_NEW_FILES_MESSAGE: &str = "No new files found.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting {0} is missing or empty")]
    Missing(String),
    #[error("setting {key} has invalid value {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub bln_api_token: String,
    pub bln_project_id: String,
    pub slack_token: String,
    pub slack_channel_id: String,
    pub bln_api_url: String,
    pub api_root: String,
    pub page_size: u32,
    pub usas_api_root: String,
    pub rate_limit: RateLimitConfig,
    pub iteration_delay: Duration,
    pub contract_throttle: Throttle,
    pub grant_throttle: Throttle,
    pub work_dir: PathBuf,
    pub runlog_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub script_name: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::Missing(key.to_string()));
        let parsed = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match get(key) {
                Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: v,
                }),
                None => Ok(default),
            }
        };
        let flag = |key: &str, default: bool| -> Result<bool, ConfigError> {
            match get(key) {
                Some(v) => match v.as_str() {
                    "1" | "true" | "TRUE" | "True" => Ok(true),
                    "0" | "false" | "FALSE" | "False" => Ok(false),
                    _ => Err(ConfigError::Invalid {
                        key: key.to_string(),
                        value: v,
                    }),
                },
                None => Ok(default),
            }
        };

        Ok(Self {
            bln_api_token: required("BLN_API_TOKEN")?,
            bln_project_id: required("BLN_PROJECT_ID")?,
            slack_token: required("SLACK_ERROR_TOKEN")?,
            slack_channel_id: required("SLACK_ERROR_CHANNEL_ID")?,
            bln_api_url: get("BLN_API_URL").unwrap_or_else(|| DEFAULT_BLN_API_URL.to_string()),
            api_root: get("DOGE_API_ROOT").unwrap_or_else(|| DEFAULT_API_ROOT.to_string()),
            page_size: parsed("DOGE_PAGE_SIZE", DEFAULT_PAGE_SIZE as u64)? as u32,
            usas_api_root: get("USAS_API_ROOT").unwrap_or_else(|| DEFAULT_USAS_API_ROOT.to_string()),
            rate_limit: RateLimitConfig {
                max_requests: parsed("DOGE_RATE_LIMIT_REQUESTS", 10)? as u32,
                window: Duration::from_secs(parsed("DOGE_RATE_LIMIT_WINDOW_SECS", 3)?),
            },
            iteration_delay: Duration::from_millis(parsed("DOGE_ITERATION_DELAY_MS", 1000)?),
            contract_throttle: Throttle::from_flag(flag("DOGE_CONTRACT_RATE_LIMITED", false)?),
            grant_throttle: Throttle::from_flag(flag("DOGE_GRANT_RATE_LIMITED", true)?),
            work_dir: get("DOGE_WORK_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data")),
            runlog_dir: get("DOGE_RUNLOG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./runlog")),
            user_agent: get("DOGE_USER_AGENT").unwrap_or_else(|| "doge-scrape/0.1".to_string()),
            http_timeout_secs: parsed("DOGE_HTTP_TIMEOUT_SECS", 20)?,
            http_max_retries: parsed("DOGE_HTTP_MAX_RETRIES", 0)? as usize,
            script_name: get("DOGE_SCRIPT_NAME").unwrap_or_else(|| "doge-scrape".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            rate_limit: self.rate_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Start,
    LoadPrevious,
    Crawl,
    Normalize,
    Diff,
    Enrich,
    Publish,
    Report,
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStage::Start => "start",
            RunStage::LoadPrevious => "load_previous",
            RunStage::Crawl => "crawl",
            RunStage::Normalize => "normalize",
            RunStage::Diff => "diff",
            RunStage::Enrich => "enrich",
            RunStage::Publish => "publish",
            RunStage::Report => "report",
            RunStage::Done => "done",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stamp: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_rows: NewRowCounts,
    pub matched_rows: BTreeMap<Category, usize>,
    pub enrichment_failures: usize,
    pub outcome: UploadOutcome,
    pub message: String,
}

impl RunReport {
    pub fn total_new_rows(&self) -> usize {
        self.new_rows.values().sum()
    }
}

/// Latest snapshot file per category, by stamp then `updated_at`.
pub fn select_previous_snapshots(files: &[RemoteFile]) -> BTreeMap<Category, RemoteFile> {
    let mut latest: BTreeMap<Category, (SnapshotName, RemoteFile)> = BTreeMap::new();
    for file in files {
        let Some(name) = SnapshotName::parse(&file.name) else {
            continue;
        };
        let newer = match latest.get(&name.category) {
            Some((seen, seen_file)) => (&name.stamp, &file.updated_at) > (&seen.stamp, &seen_file.updated_at),
            None => true,
        };
        if newer {
            latest.insert(name.category, (name, file.clone()));
        }
    }
    latest.into_iter().map(|(c, (_, f))| (c, f)).collect()
}

fn file_list(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Final chat message for a completed run.
pub fn status_message(new_rows: &NewRowCounts, outcome: &UploadOutcome) -> (String, Severity) {
    let total: usize = new_rows.values().sum();
    if total == 0 {
        return (NO_NEW_FILES_MESSAGE.to_string(), Severity::Notice);
    }
    let breakdown = Category::ALL
        .iter()
        .map(|c| format!("{}: {}", c, new_rows.get(c).copied().unwrap_or(0)))
        .collect::<Vec<_>>()
        .join(", ");
    let message = format!(
        "{total} new records ({breakdown}). {} file(s) uploaded: {}. {} file(s) failed: {}.",
        outcome.success.len(),
        file_list(&outcome.success),
        outcome.failure.len(),
        file_list(&outcome.failure),
    );
    let severity = if outcome.failure.is_empty() {
        Severity::Success
    } else {
        Severity::Error
    };
    (message, severity)
}

pub struct SyncPipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn PageFetcher>,
    storage: Arc<dyn ProjectStorage>,
    notifier: Arc<dyn Notifier>,
}

impl SyncPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let storage = BlnClient::new(config.bln_api_url.clone(), config.bln_api_token.clone())
            .context("building storage client")?;
        let notifier = SlackNotifier::new(
            config.slack_token.clone(),
            config.slack_channel_id.clone(),
            config.script_name.clone(),
        );
        Ok(Self::with_collaborators(
            config,
            Arc::new(fetcher),
            Arc::new(storage),
            Arc::new(notifier),
        ))
    }

    pub fn with_collaborators(
        config: PipelineConfig,
        fetcher: Arc<dyn PageFetcher>,
        storage: Arc<dyn ProjectStorage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            fetcher,
            storage,
            notifier,
        }
    }

    pub fn storage(&self) -> &Arc<dyn ProjectStorage> {
        &self.storage
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    /// Runs every stage once. Any error posts an `error` message naming the
    /// stage, removes the run's local files, and is returned to the caller.
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let stamp = run_stamp(started_at);
        let span = info_span!("sync_run", %run_id, stamp = %stamp);

        let mut stage = RunStage::Start;
        let mut local_files: Vec<PathBuf> = Vec::new();
        let result = self
            .run_stages(run_id, started_at, &stamp, &mut stage, &mut local_files)
            .instrument(span)
            .await;

        match result {
            Ok(report) => Ok(report),
            Err(err) => {
                remove_local_files(&local_files).await;
                tracing::error!(%run_id, %stage, error = %format!("{err:#}"), "run failed");
                self.notifier
                    .post(&format!("Run failed during {stage}: {err:#}"), Severity::Error)
                    .await;
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        stamp: &str,
        stage: &mut RunStage,
        local_files: &mut Vec<PathBuf>,
    ) -> Result<RunReport> {
        let project_id = self.config.bln_project_id.as_str();

        *stage = RunStage::LoadPrevious;
        info!(%stage, "stage");
        let files = self
            .storage
            .list_files(project_id)
            .await
            .context("listing project files")?;
        let mut previous: BTreeMap<Category, RecordTable> = BTreeMap::new();
        for (category, file) in select_previous_snapshots(&files) {
            let path = self
                .storage
                .download_file(project_id, &file.name, &self.config.work_dir)
                .await
                .with_context(|| format!("downloading {}", file.name))?;
            local_files.push(path.clone());
            let table = read_snapshot_csv(&path)
                .await
                .with_context(|| format!("reading previous {category} snapshot"))?;
            info!(%category, file = %file.name, rows = table.len(), "loaded previous snapshot");
            previous.insert(category, table);
        }

        *stage = RunStage::Crawl;
        info!(%stage, "stage");
        let mut scraped: BTreeMap<Category, RecordTable> = BTreeMap::new();
        for category in Category::ALL {
            let request = CrawlRequest::for_category(&self.config.api_root, category, self.config.page_size);
            let table = crawl(self.fetcher.as_ref(), &request)
                .await
                .with_context(|| format!("crawling {}", category.endpoint()))?;
            scraped.insert(category, table);
        }

        *stage = RunStage::Normalize;
        info!(%stage, "stage");
        let normalized: BTreeMap<Category, RecordTable> =
            scraped.into_iter().map(|(c, t)| (c, normalize(t))).collect();

        *stage = RunStage::Diff;
        info!(%stage, "stage");
        let mut new_only: BTreeMap<Category, RecordTable> = BTreeMap::new();
        let mut matched_rows: BTreeMap<Category, usize> = BTreeMap::new();
        for (category, fresh) in &normalized {
            let old = previous.entry(*category).or_default();
            let columns = fresh.shared_columns(old);
            if !old.is_empty() && !fresh.is_empty() && columns.is_empty() {
                bail!("previous {category} snapshot shares no columns with the scrape");
            }
            let outcome = diff(old, fresh, fresh.columns());
            info!(
                %category,
                scraped = fresh.len(),
                matched = outcome.matched_count(),
                new = outcome.new_rows.len(),
                comparison_columns = columns.len(),
                "diffed against previous snapshot"
            );
            matched_rows.insert(*category, outcome.matched_count());
            new_only.insert(*category, outcome.new_rows);
        }

        *stage = RunStage::Enrich;
        info!(%stage, "stage");
        let run_log = RunLog::new(&self.config.runlog_dir, stamp);
        let contract = ContractEnricher::new(self.fetcher.clone(), self.config.contract_throttle);
        let grant = GrantEnricher::new(
            self.fetcher.clone(),
            self.config.grant_throttle,
            self.config.usas_api_root.clone(),
        );
        let mut enrichment_failures = 0;
        let mut new_rows = NewRowCounts::new();
        let mut updated: Vec<(Category, RecordTable)> = Vec::new();
        for (category, rows) in &new_only {
            let enricher: Option<&dyn RowEnricher> = match category {
                Category::Contract => Some(&contract),
                Category::Grant => Some(&grant),
                Category::Property => None,
            };
            let enriched = match enricher {
                Some(enricher) if !rows.is_empty() => {
                    let (table, stats) = enrich_rows(rows, enricher, &run_log, self.config.iteration_delay).await;
                    enrichment_failures += stats.failed;
                    table
                }
                _ => rows.clone(),
            };
            new_rows.insert(*category, enriched.len());
            let old = previous.remove(category).unwrap_or_default();
            updated.push((*category, old.concat(&enriched)));
        }
        if enrichment_failures > 0 {
            warn!(failures = enrichment_failures, log = %run_log.path().display(), "some lookups failed");
        }

        *stage = RunStage::Publish;
        info!(%stage, "stage");
        for (category, count) in &new_rows {
            if *count > 0 {
                local_files.push(self.config.work_dir.join(snapshot_filename(*category, stamp)));
            }
        }
        let publisher = SnapshotPublisher::new(
            self.storage.clone(),
            project_id,
            self.config.work_dir.clone(),
            self.config.iteration_delay,
        );
        let published = publisher.persist_and_upload(&updated, &new_rows, stamp).await;
        let removed = remove_local_files(local_files).await;
        info!(removed, "removed local files");
        local_files.clear();
        let published = published?;

        *stage = RunStage::Report;
        info!(%stage, "stage");
        let (message, severity) = status_message(&new_rows, &published.outcome);
        self.notifier.post(&message, severity).await;

        *stage = RunStage::Done;
        let report = RunReport {
            run_id,
            stamp: stamp.to_string(),
            started_at,
            finished_at: Utc::now(),
            new_rows,
            matched_rows,
            enrichment_failures,
            outcome: published.outcome,
            message,
        };
        info!(
            %stage,
            new = report.total_new_rows(),
            uploaded = report.outcome.success.len(),
            failed = report.outcome.failure.len(),
            "run complete"
        );
        Ok(report)
    }
}

/// Snapshot files in the project, grouped by category and sorted by stamp.
pub async fn list_snapshots(
    storage: &dyn ProjectStorage,
    project_id: &str,
) -> Result<BTreeMap<Category, Vec<RemoteFile>>> {
    let files = storage
        .list_files(project_id)
        .await
        .context("listing project files")?;
    let mut grouped: BTreeMap<Category, Vec<(String, RemoteFile)>> = BTreeMap::new();
    for file in files {
        if let Some(name) = SnapshotName::parse(&file.name) {
            grouped.entry(name.category).or_default().push((name.stamp, file));
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(c, mut files)| {
            files.sort_by(|a, b| a.0.cmp(&b.0));
            (c, files.into_iter().map(|(_, f)| f).collect())
        })
        .collect())
}

pub async fn run_sync_once_from_env() -> Result<RunReport> {
    let config = PipelineConfig::from_env().context("loading configuration")?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}


#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use doge_storage::{write_snapshot_csv, FetchError, FetchedResponse, StorageError};
    use reqwest::StatusCode;
    use serde_json::{json, Value as JsonValue};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const API_ROOT: &str = "https://api.doge.test/savings/";
    const USAS_ROOT: &str = "https://api.usaspending.test/api/v2/awards/";
    const PROJECT: &str = "UHJvamVjdDox";
    const GRANT_LINK: &str = "https://www.usaspending.gov/award/ASST_NON_S411C200001_9100";
    const CONTRACT_LINK: &str = "https://www.fpds.gov/ezsearch/fpdsportal?q=PIID-1";

    fn fixture(rel: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(rel)
    }

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn contract(piid: &str, link: &str) -> JsonValue {
        json!({
            "piid": piid,
            "agency": "General Services Administration",
            "vendor": "Acme Federal Services",
            "value": 120000,
            "description": "Consulting support",
            "fpds_status": "TERMINATED",
            "fpds_link": link,
            "deleted_date": "2/14/2025",
            "savings": 60000.5
        })
    }

    fn grant(recipient: &str, link: &str) -> JsonValue {
        json!({
            "date": "2/11/2025",
            "agency": "Department of Education",
            "recipient": recipient,
            "value": 1500000,
            "savings": 450000,
            "link": link,
            "description": "Teacher quality partnership program"
        })
    }

    /// Serves one page of records per endpoint plus fixed secondary bodies.
    #[derive(Default)]
    struct FakeSources {
        pages: HashMap<&'static str, Vec<JsonValue>>,
        details: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<(String, Throttle)>>,
    }

    impl FakeSources {
        fn with_doge(mut self, endpoint: &'static str, records: Vec<JsonValue>) -> Self {
            self.pages.insert(endpoint, records);
            self
        }

        fn with_detail(mut self, url: &str, rel: &str) -> Self {
            self.details
                .insert(url.to_string(), std::fs::read(fixture(rel)).expect("fixture"));
            self
        }

        fn requested(&self) -> Vec<(String, Throttle)> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for FakeSources {
        async fn get(&self, url: &str, throttle: Throttle) -> Result<FetchedResponse, FetchError> {
            self.requested.lock().unwrap().push((url.to_string(), throttle));
            let ok = |body: Vec<u8>| FetchedResponse {
                status: StatusCode::OK,
                final_url: url.to_string(),
                body,
            };
            if let Some(rest) = url.strip_prefix(API_ROOT) {
                let endpoint = rest.split('?').next().unwrap_or_default();
                let Some(records) = self.pages.get(endpoint) else {
                    return Err(FetchError::HttpStatus {
                        status: 503,
                        url: url.to_string(),
                    });
                };
                let pages = if records.is_empty() { 0 } else { 1 };
                let body = json!({
                    "success": true,
                    "result": { endpoint: records },
                    "meta": { "total_results": records.len(), "pages": pages }
                });
                return Ok(ok(serde_json::to_vec(&body).unwrap()));
            }
            match self.details.get(url) {
                Some(body) => Ok(ok(body.clone())),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeStorage {
        files: Vec<(RemoteFile, Vec<u8>)>,
        failing_prefixes: Vec<&'static str>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeStorage {
        fn with_file(mut self, name: &str, updated_at: &str, body: Vec<u8>) -> Self {
            self.files.push((
                RemoteFile {
                    name: name.to_string(),
                    updated_at: updated_at.to_string(),
                },
                body,
            ));
            self
        }

        fn uploaded(&self) -> Vec<(String, Vec<u8>)> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProjectStorage for FakeStorage {
        async fn list_files(&self, project_id: &str) -> Result<Vec<RemoteFile>, StorageError> {
            assert_eq!(project_id, PROJECT);
            Ok(self.files.iter().map(|(f, _)| f.clone()).collect())
        }

        async fn download_file(
            &self,
            _project_id: &str,
            file_name: &str,
            output_dir: &Path,
        ) -> Result<PathBuf, StorageError> {
            let (_, body) = self
                .files
                .iter()
                .find(|(f, _)| f.name == file_name)
                .ok_or_else(|| StorageError::Api(format!("no file {file_name}")))?;
            let path = output_dir.join(file_name);
            let io = |source| StorageError::Io {
                path: path.clone(),
                source,
            };
            tokio::fs::create_dir_all(output_dir).await.map_err(io)?;
            tokio::fs::write(&path, body).await.map_err(io)?;
            Ok(path)
        }

        async fn upload_file(&self, _project_id: &str, local_path: &Path) -> Result<(), StorageError> {
            let name = local_path.file_name().unwrap().to_string_lossy().into_owned();
            if self.failing_prefixes.iter().any(|p| name.starts_with(p)) {
                return Err(StorageError::Server {
                    status: 500,
                    body: "upload rejected".to_string(),
                });
            }
            let body = tokio::fs::read(local_path).await.map_err(|source| StorageError::Io {
                path: local_path.to_path_buf(),
                source,
            })?;
            self.uploads.lock().unwrap().push((name, body));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, Severity)>>,
    }

    impl RecordingNotifier {
        fn messages(&self) -> Vec<(String, Severity)> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn post(&self, message: &str, severity: Severity) {
            self.messages.lock().unwrap().push((message.to_string(), severity));
        }
    }

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("BLN_API_TOKEN", "token"),
            ("BLN_PROJECT_ID", PROJECT),
            ("SLACK_ERROR_TOKEN", "xoxb-test"),
            ("SLACK_ERROR_CHANNEL_ID", "C0TEST"),
            ("DOGE_API_ROOT", API_ROOT),
            ("USAS_API_ROOT", USAS_ROOT),
            ("DOGE_ITERATION_DELAY_MS", "0"),
        ])
    }

    fn test_config(dir: &Path) -> PipelineConfig {
        let vars = vars();
        let mut config = PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        config.work_dir = dir.join("data");
        config.runlog_dir = dir.join("runlog");
        config
    }

    /// CSV bytes of what the pipeline itself would have published for `records`.
    async fn published_snapshot(category: Category, records: Vec<JsonValue>, dir: &Path) -> Vec<u8> {
        let sources = FakeSources::default().with_doge(category.endpoint(), records);
        let request = CrawlRequest::for_category(API_ROOT, category, DEFAULT_PAGE_SIZE);
        let table = normalize(crawl(&sources, &request).await.unwrap());
        let path = dir.join(format!("seed-{category}.csv"));
        write_snapshot_csv(&path, &table).await.unwrap();
        std::fs::read(&path).unwrap()
    }

    async fn table_from_bytes(bytes: &[u8], dir: &Path) -> RecordTable {
        let path = dir.join(format!("check-{}.csv", Uuid::new_v4()));
        std::fs::write(&path, bytes).unwrap();
        read_snapshot_csv(&path).await.unwrap()
    }

    fn csv_files_in(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|x| x == "csv"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn pipeline(
        dir: &Path,
        sources: FakeSources,
        storage: FakeStorage,
    ) -> (SyncPipeline, Arc<FakeSources>, Arc<FakeStorage>, Arc<RecordingNotifier>) {
        let sources = Arc::new(sources);
        let storage = Arc::new(storage);
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline =
            SyncPipeline::with_collaborators(test_config(dir), sources.clone(), storage.clone(), notifier.clone());
        (pipeline, sources, storage, notifier)
    }

    #[test]
    fn config_requires_credentials_and_applies_defaults() {
        let err = PipelineConfig::from_lookup(|_| None).unwrap_err();
        assert_eq!(err, ConfigError::Missing("BLN_API_TOKEN".to_string()));

        let mut partial = vars();
        partial.insert("SLACK_ERROR_CHANNEL_ID", "  ");
        let err = PipelineConfig::from_lookup(|k| partial.get(k).map(|v| v.to_string())).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SLACK_ERROR_CHANNEL_ID".to_string()));

        let minimal: HashMap<&str, &str> = vars()
            .into_iter()
            .filter(|(k, _)| !k.starts_with("DOGE_") && !k.starts_with("USAS_"))
            .collect();
        let config = PipelineConfig::from_lookup(|k| minimal.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.api_root, DEFAULT_API_ROOT);
        assert_eq!(config.page_size, 500);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window, Duration::from_secs(3));
        assert_eq!(config.iteration_delay, Duration::from_millis(1000));
        assert_eq!(config.contract_throttle, Throttle::Unlimited);
        assert_eq!(config.grant_throttle, Throttle::Limited);
        assert_eq!(config.work_dir, PathBuf::from("./data"));
    }

    #[test]
    fn config_rejects_unparseable_numbers_and_flags() {
        let mut bad = vars();
        bad.insert("DOGE_PAGE_SIZE", "lots");
        let err = PipelineConfig::from_lookup(|k| bad.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "DOGE_PAGE_SIZE"));

        let mut bad = vars();
        bad.insert("DOGE_CONTRACT_RATE_LIMITED", "maybe");
        assert!(PipelineConfig::from_lookup(|k| bad.get(k).map(|v| v.to_string())).is_err());

        let mut on = vars();
        on.insert("DOGE_CONTRACT_RATE_LIMITED", "true");
        let config = PipelineConfig::from_lookup(|k| on.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.contract_throttle, Throttle::Limited);
    }

    #[test]
    fn previous_snapshot_is_latest_stamp_per_category() {
        let file = |name: &str, updated: &str| RemoteFile {
            name: name.to_string(),
            updated_at: updated.to_string(),
        };
        let files = vec![
            file("doge-contract_2025-02-01T090000.csv", "2025-02-01T09:00:05Z"),
            file("doge-contract_2025-02-03T090000.csv", "2025-02-03T09:00:05Z"),
            file("doge-grant_2025-02-02T090000.csv", "2025-02-02T09:00:05Z"),
            file("notes.txt", "2025-03-01T00:00:00Z"),
            file("doge-contract_latest.csv", "2025-03-01T00:00:00Z"),
        ];
        let picked = select_previous_snapshots(&files);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[&Category::Contract].name, "doge-contract_2025-02-03T090000.csv");
        assert_eq!(picked[&Category::Grant].name, "doge-grant_2025-02-02T090000.csv");
        assert!(!picked.contains_key(&Category::Property));
    }

    #[test]
    fn status_message_summarizes_counts_and_files() {
        let none = NewRowCounts::from([(Category::Contract, 0), (Category::Grant, 0)]);
        assert_eq!(
            status_message(&none, &UploadOutcome::default()),
            (NO_NEW_FILES_MESSAGE.to_string(), Severity::Notice)
        );

        let counts = NewRowCounts::from([(Category::Contract, 2), (Category::Grant, 1), (Category::Property, 0)]);
        let outcome = UploadOutcome {
            success: vec!["file1".to_string()],
            failure: vec!["file2".to_string()],
        };
        let (message, severity) = status_message(&counts, &outcome);
        assert_eq!(severity, Severity::Error);
        assert!(message.starts_with("3 new records (contract: 2, grant: 1, property: 0)"));
        assert!(message.contains("1 file(s) uploaded: file1"));
        assert!(message.contains("1 file(s) failed: file2"));

        let all_ok = UploadOutcome {
            success: vec!["file1".to_string()],
            failure: vec![],
        };
        let (message, severity) = status_message(&counts, &all_ok);
        assert_eq!(severity, Severity::Success);
        assert!(message.contains("0 file(s) failed: none"));
    }

    #[tokio::test]
    async fn unchanged_sources_publish_nothing() {
        let dir = tempdir().unwrap();
        let contracts = vec![contract("PIID-1", CONTRACT_LINK)];
        let grants = vec![grant("Example University", GRANT_LINK)];
        let storage = FakeStorage::default()
            .with_file(
                "doge-contract_2025-02-20T080000.csv",
                "2025-02-20T08:00:00Z",
                published_snapshot(Category::Contract, contracts.clone(), dir.path()).await,
            )
            .with_file(
                "doge-grant_2025-02-20T080000.csv",
                "2025-02-20T08:00:00Z",
                published_snapshot(Category::Grant, grants.clone(), dir.path()).await,
            );
        let sources = FakeSources::default()
            .with_doge("contracts", contracts)
            .with_doge("grants", grants)
            .with_doge("leases", vec![]);
        let (pipeline, sources, storage, notifier) = pipeline(dir.path(), sources, storage);

        let report = pipeline.run_at(started_at()).await.unwrap();

        assert_eq!(report.total_new_rows(), 0);
        assert_eq!(report.matched_rows[&Category::Contract], 1);
        assert_eq!(report.outcome, UploadOutcome::default());
        assert!(storage.uploaded().is_empty());
        assert_eq!(
            notifier.messages(),
            vec![(NO_NEW_FILES_MESSAGE.to_string(), Severity::Notice)]
        );
        // crawl only; nothing was new so nothing was looked up
        assert_eq!(sources.requested().len(), 3);
        assert!(sources.requested().iter().all(|(_, t)| *t == Throttle::Limited));
        assert!(csv_files_in(&dir.path().join("data")).is_empty());
    }

    #[tokio::test]
    async fn unusable_contract_link_is_logged_and_row_still_published() {
        let dir = tempdir().unwrap();
        let contracts = vec![contract("PIID-1", CONTRACT_LINK)];
        let storage = FakeStorage::default().with_file(
            "doge-contract_2025-02-20T080000.csv",
            "2025-02-20T08:00:00Z",
            published_snapshot(Category::Contract, contracts.clone(), dir.path()).await,
        );
        let mut scraped = contracts;
        scraped.push(contract("PIID-2", "not a link"));
        let sources = FakeSources::default()
            .with_doge("contracts", scraped)
            .with_doge("grants", vec![])
            .with_doge("leases", vec![]);
        let (pipeline, _sources, storage, notifier) = pipeline(dir.path(), sources, storage);

        let report = pipeline.run_at(started_at()).await.unwrap();
        let stamp = run_stamp(started_at());
        let expected_file = snapshot_filename(Category::Contract, &stamp);

        assert_eq!(report.new_rows[&Category::Contract], 1);
        assert_eq!(report.enrichment_failures, 1);
        assert_eq!(report.outcome.success, vec![expected_file.clone()]);

        let uploads = storage.uploaded();
        assert_eq!(uploads.len(), 1);
        let table = table_from_bytes(&uploads[0].1, dir.path()).await;
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, "piid"), Some("PIID-1"));
        assert_eq!(table.cell(1, "piid"), Some("PIID-2"));
        assert!(table.has_column("award_agency"));
        assert_eq!(table.cell(1, "award_agency"), None);

        let log = std::fs::read_to_string(dir.path().join("runlog").join(format!("scrape-{stamp}.txt"))).unwrap();
        assert_eq!(log, format!("contract,{stamp},not a link\n"));

        let (message, severity) = &notifier.messages()[0];
        assert_eq!(*severity, Severity::Success);
        assert!(message.contains("1 new records"));
        assert!(csv_files_in(&dir.path().join("data")).is_empty());
    }

    #[tokio::test]
    async fn partial_upload_failure_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let api_url = format!("{USAS_ROOT}ASST_NON_S411C200001_9100");
        let sources = FakeSources::default()
            .with_doge("contracts", vec![contract("PIID-1", CONTRACT_LINK)])
            .with_doge("grants", vec![grant("Example University", GRANT_LINK)])
            .with_doge("leases", vec![])
            .with_detail(CONTRACT_LINK, "fpds/award.html")
            .with_detail(&api_url, "usaspending/award.json");
        let storage = FakeStorage {
            failing_prefixes: vec!["doge-grant"],
            ..Default::default()
        };
        let (pipeline, sources, storage, notifier) = pipeline(dir.path(), sources, storage);

        let report = pipeline.run_at(started_at()).await.unwrap();
        let stamp = run_stamp(started_at());
        let contract_file = snapshot_filename(Category::Contract, &stamp);
        let grant_file = snapshot_filename(Category::Grant, &stamp);

        assert_eq!(
            report.outcome,
            UploadOutcome {
                success: vec![contract_file.clone()],
                failure: vec![grant_file.clone()],
            }
        );
        assert_eq!(report.enrichment_failures, 0);

        let uploads = storage.uploaded();
        let table = table_from_bytes(&uploads[0].1, dir.path()).await;
        assert_eq!(table.cell(0, "requirement_desc"), Some("MANAGEMENT CONSULTING SUPPORT SERVICES"));
        assert_eq!(table.cell(0, "description_doge"), Some("Consulting support"));

        let requested = sources.requested();
        assert!(requested.contains(&(CONTRACT_LINK.to_string(), Throttle::Unlimited)));
        assert!(requested.contains(&(api_url, Throttle::Limited)));

        let (message, severity) = &notifier.messages()[0];
        assert_eq!(*severity, Severity::Error);
        assert!(message.starts_with("2 new records"));
        assert!(message.contains(&format!("1 file(s) uploaded: {contract_file}")));
        assert!(message.contains(&format!("1 file(s) failed: {grant_file}")));
        assert!(csv_files_in(&dir.path().join("data")).is_empty());
    }

    #[tokio::test]
    async fn only_categories_with_new_rows_are_written() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FakeStorage::default());
        let publisher = SnapshotPublisher::new(storage.clone(), PROJECT, dir.path(), Duration::ZERO);
        let mut grants = RecordTable::new(vec!["recipient".to_string()]);
        for name in ["a", "b", "c"] {
            grants.push_row(vec![Some(name.to_string())]);
        }
        let tables = vec![
            (Category::Contract, RecordTable::new(vec!["piid".to_string()])),
            (Category::Grant, grants),
            (Category::Property, RecordTable::default()),
        ];
        let counts = NewRowCounts::from([(Category::Contract, 0), (Category::Grant, 3), (Category::Property, 0)]);

        let result = publisher
            .persist_and_upload(&tables, &counts, "2025-03-01T120000")
            .await
            .unwrap();

        assert_eq!(result.written, vec![dir.path().join("doge-grant_2025-03-01T120000.csv")]);
        assert_eq!(result.outcome.success, vec!["doge-grant_2025-03-01T120000.csv".to_string()]);
        assert_eq!(result.outcome.attempted(), 1);
        assert_eq!(storage.uploaded().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_previous_snapshot_reports_stage_and_cleans_up() {
        let dir = tempdir().unwrap();
        let storage = FakeStorage::default().with_file(
            "doge-contract_2025-02-20T080000.csv",
            "2025-02-20T08:00:00Z",
            b"piid,vendor\nPIID-1\n".to_vec(),
        );
        let (pipeline, sources, storage, notifier) = pipeline(dir.path(), FakeSources::default(), storage);

        let err = pipeline.run_at(started_at()).await.unwrap_err();

        assert!(format!("{err:#}").contains("reading previous contract snapshot"));
        let messages = notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, Severity::Error);
        assert!(messages[0].0.starts_with("Run failed during load_previous"));
        assert!(sources.requested().is_empty());
        assert!(storage.uploaded().is_empty());
        assert!(csv_files_in(&dir.path().join("data")).is_empty());
    }

    #[tokio::test]
    async fn unavailable_endpoint_fails_the_crawl_stage() {
        let dir = tempdir().unwrap();
        let sources = FakeSources::default().with_doge("contracts", vec![]);
        let (pipeline, _sources, storage, notifier) = pipeline(dir.path(), sources, FakeStorage::default());

        let err = pipeline.run_at(started_at()).await.unwrap_err();

        assert!(format!("{err:#}").contains("crawling grants"));
        let messages = notifier.messages();
        assert!(messages[0].0.starts_with("Run failed during crawl"));
        assert!(messages[0].0.contains("503"));
        assert!(storage.uploaded().is_empty());
    }

    #[tokio::test]
    async fn list_snapshots_groups_and_sorts_by_stamp() {
        let storage = FakeStorage::default()
            .with_file("doge-grant_2025-02-03T090000.csv", "", vec![])
            .with_file("doge-grant_2025-02-01T090000.csv", "", vec![])
            .with_file("readme.md", "", vec![]);
        let listed = list_snapshots(&storage, PROJECT).await.unwrap();
        let names: Vec<&str> = listed[&Category::Grant].iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["doge-grant_2025-02-01T090000.csv", "doge-grant_2025-02-03T090000.csv"]
        );
        assert!(!listed.contains_key(&Category::Contract));
    }
}
