//! Per-row enrichment of newly discovered records from secondary sources.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doge_adapters::{award_api_url, fpds_columns, is_usable_link, parse_award_json, parse_fpds_html, record_id_from_link};
use doge_core::{Category, Cell, RecordTable};
use doge_storage::{PageFetcher, Throttle};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Append-only error log for one run: `./runlog/scrape-<stamp>.txt`, one
/// `<mode>,<stamp>,<url>` line per failed lookup.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    stamp: String,
}

impl RunLog {
    pub fn new(dir: impl AsRef<Path>, stamp: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("scrape-{stamp}.txt")),
            stamp: stamp.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line. Failures to log are reported and otherwise ignored.
    pub async fn record(&self, mode: Category, url: &str) {
        if let Err(err) = self.try_record(mode, url).await {
            warn!(path = %self.path.display(), error = %err, "could not write run log");
        }
    }

    async fn try_record(&self, mode: Category, url: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{},{},{}\n", mode.as_str(), self.stamp, url).as_bytes())
            .await?;
        file.flush().await
    }
}

/// A failed lookup: the URL to log and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupFailure {
    pub url: String,
    pub reason: String,
}

/// One secondary source keyed by a row's cross-reference link.
#[async_trait]
pub trait RowEnricher: Send + Sync {
    fn category(&self) -> Category;

    /// Columns every enriched table carries, even when all lookups fail.
    fn fixed_columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Suffix appended to an enrichment column whose name the row already uses.
    fn collision_suffix(&self) -> &'static str;

    async fn lookup(&self, link: &str) -> Result<Vec<(String, Cell)>, LookupFailure>;
}

/// Procurement detail page scraped for a fixed dictionary of form fields.
pub struct ContractEnricher {
    fetcher: Arc<dyn PageFetcher>,
    throttle: Throttle,
}

impl ContractEnricher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, throttle: Throttle) -> Self {
        Self { fetcher, throttle }
    }
}

#[async_trait]
impl RowEnricher for ContractEnricher {
    fn category(&self) -> Category {
        Category::Contract
    }

    fn fixed_columns(&self) -> Vec<String> {
        fpds_columns()
    }

    fn collision_suffix(&self) -> &'static str {
        "_fpds"
    }

    async fn lookup(&self, link: &str) -> Result<Vec<(String, Cell)>, LookupFailure> {
        if !is_usable_link(link) {
            return Err(LookupFailure {
                url: link.to_string(),
                reason: "not a usable url".to_string(),
            });
        }
        let page = self
            .fetcher
            .get(link, self.throttle)
            .await
            .map_err(|e| LookupFailure {
                url: link.to_string(),
                reason: e.to_string(),
            })?;
        Ok(parse_fpds_html(&page.text()))
    }
}

/// Award API record looked up by the id at the end of the grant link.
pub struct GrantEnricher {
    fetcher: Arc<dyn PageFetcher>,
    throttle: Throttle,
    api_root: String,
}

impl GrantEnricher {
    pub fn new(fetcher: Arc<dyn PageFetcher>, throttle: Throttle, api_root: impl Into<String>) -> Self {
        Self {
            fetcher,
            throttle,
            api_root: api_root.into(),
        }
    }
}

#[async_trait]
impl RowEnricher for GrantEnricher {
    fn category(&self) -> Category {
        Category::Grant
    }

    fn collision_suffix(&self) -> &'static str {
        "_usas"
    }

    async fn lookup(&self, link: &str) -> Result<Vec<(String, Cell)>, LookupFailure> {
        let record_id = is_usable_link(link)
            .then(|| record_id_from_link(link))
            .flatten()
            .ok_or_else(|| LookupFailure {
                url: link.to_string(),
                reason: "link carries no record id".to_string(),
            })?;
        let api_url = award_api_url(&self.api_root, &record_id);
        let fail = |reason: String| LookupFailure {
            url: api_url.clone(),
            reason,
        };
        let response = self
            .fetcher
            .get(&api_url, self.throttle)
            .await
            .map_err(|e| fail(e.to_string()))?;
        let value: serde_json::Value = response.json().map_err(|e| fail(e.to_string()))?;
        if !value.is_object() {
            return Err(fail("award payload is not an object".to_string()));
        }
        Ok(parse_award_json(&value))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichStats {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
}

/// Annotates every row of `rows` with its lookup result.
///
/// Row count and order are preserved. A row whose lookup fails keeps null
/// enrichment columns and its failure goes to `run_log`. Rows with no link
/// column at all are passed through untouched.
pub async fn enrich_rows(
    rows: &RecordTable,
    enricher: &dyn RowEnricher,
    run_log: &RunLog,
    delay: Duration,
) -> (RecordTable, EnrichStats) {
    let category = enricher.category();
    let mut out = rows.clone();
    let mut stats = EnrichStats::default();
    let Some(link_column) = category.link_column() else {
        return (out, stats);
    };
    if !rows.has_column(link_column) {
        warn!(%category, link_column, "no link column; skipping enrichment");
        return (out, stats);
    }

    let base_columns: Vec<String> = rows.columns().to_vec();
    let target = |name: &str| -> String {
        if base_columns.iter().any(|c| c == name) {
            format!("{name}{}", enricher.collision_suffix())
        } else {
            name.to_string()
        }
    };
    for column in enricher.fixed_columns() {
        out.ensure_column(&target(&column));
    }

    for idx in 0..rows.len() {
        stats.attempted += 1;
        let link = rows.cell(idx, link_column).unwrap_or_default().to_string();
        match enricher.lookup(&link).await {
            Ok(fields) => {
                stats.enriched += 1;
                for (name, value) in fields {
                    out.set_cell(idx, &target(&name), value);
                }
            }
            Err(failure) => {
                stats.failed += 1;
                warn!(%category, url = %failure.url, reason = %failure.reason, "enrichment lookup failed");
                run_log.record(category, &failure.url).await;
            }
        }
        if !delay.is_zero() && idx + 1 < rows.len() {
            tokio::time::sleep(delay).await;
        }
    }

    info!(%category, attempted = stats.attempted, enriched = stats.enriched, failed = stats.failed, "enrichment complete");
    (out, stats)
}
