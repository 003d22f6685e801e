//! Course detail collaborator: injected page fetching, parsing and pass-based retries.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use courselink_core::{CatalogRecord, CourseDetails};
use courselink_storage::{ArtifactStore, FetchError, HttpFetcher};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod detail;

pub use detail::{clean_text, parse_course_detail_html};

pub const CRATE_NAME: &str = "courselink-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Injected fetch function. The reconciliation core never touches the network;
/// only the detail scraper goes through this seam.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, AdapterError> {
        Ok(self.get(url).await?.text())
    }
}

/// One detail page to scrape: the representative catalog entry of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailTarget {
    pub catalog_id: String,
    pub group_id: i64,
    pub course_code: String,
    pub url: String,
}

/// Pick, per group, the most recent member that is not yet scraped and has a link.
///
/// Ungrouped records (group id -1) are skipped. Output is ordered by group id.
pub fn select_detail_targets(
    records: &[CatalogRecord],
    already_scraped: &HashSet<String>,
) -> Vec<DetailTarget> {
    let mut best: BTreeMap<i64, &CatalogRecord> = BTreeMap::new();
    for rec in records {
        if rec.group_id < 0 || rec.link().is_empty() || already_scraped.contains(&rec.catalog_id()) {
            continue;
        }
        best.entry(rec.group_id)
            .and_modify(|cur| {
                if rec.parsed_year > cur.parsed_year {
                    *cur = rec;
                }
            })
            .or_insert(rec);
    }

    best.into_values()
        .map(|rec| DetailTarget {
            catalog_id: rec.catalog_id(),
            group_id: rec.group_id,
            course_code: rec.code.clone(),
            url: rec.link().to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct DetailScrapeConfig {
    pub retry_pause: Duration,
    pub max_passes: usize,
}

impl Default for DetailScrapeConfig {
    fn default() -> Self {
        Self {
            retry_pause: Duration::from_secs(10),
            max_passes: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetailScrapeReport {
    /// Parsed details keyed by catalog id.
    pub details: BTreeMap<String, CourseDetails>,
    pub failed: Vec<DetailTarget>,
    pub passes: usize,
    pub stored_pages: usize,
}

/// Fetches every target concurrently, then retries only the failures after a pause.
///
/// Concurrency is bounded by the fetcher itself (the HTTP fetcher holds a fixed
/// number of permits); this loop only decides what gets retried.
pub struct DetailScraper {
    config: DetailScrapeConfig,
    artifacts: Option<ArtifactStore>,
}

impl DetailScraper {
    pub fn new(config: DetailScrapeConfig) -> Self {
        Self {
            config,
            artifacts: None,
        }
    }

    pub fn with_artifact_store(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub async fn scrape(
        &self,
        fetcher: &dyn PageFetcher,
        targets: Vec<DetailTarget>,
    ) -> DetailScrapeReport {
        let mut report = DetailScrapeReport::default();
        let mut pending = targets;

        while !pending.is_empty() && report.passes < self.config.max_passes.max(1) {
            if report.passes > 0 {
                info!(
                    failed = pending.len(),
                    pause_secs = self.config.retry_pause.as_secs(),
                    "pausing before retrying failed detail pages"
                );
                tokio::time::sleep(self.config.retry_pause).await;
            }
            report.passes += 1;

            let results = join_all(pending.iter().map(|t| self.fetch_one(fetcher, t))).await;

            let mut failed = Vec::new();
            for (target, result) in pending.into_iter().zip(results) {
                match result {
                    Ok((details, stored)) => {
                        report.stored_pages += usize::from(stored);
                        report.details.insert(target.catalog_id.clone(), details);
                    }
                    Err(err) => {
                        warn!(course_code = %target.course_code, url = %target.url, error = %err, "detail fetch failed");
                        failed.push(target);
                    }
                }
            }
            info!(
                pass = report.passes,
                scraped = report.details.len(),
                failed = failed.len(),
                "detail pass complete"
            );
            pending = failed;
        }

        report.failed = pending;
        report
    }

    async fn fetch_one(
        &self,
        fetcher: &dyn PageFetcher,
        target: &DetailTarget,
    ) -> Result<(CourseDetails, bool), AdapterError> {
        let html = fetcher.fetch_page(&target.url).await?;
        let mut stored = false;
        if let Some(store) = &self.artifacts {
            let artifact = store
                .store_page(Utc::now(), "course-detail", html.as_bytes())
                .await?;
            stored = !artifact.deduplicated;
        }
        Ok((parse_course_detail_html(&html)?, stored))
    }
}

/// Saved detail page plus the fields it is expected to parse into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailFixture {
    pub fixture_id: String,
    pub captured_from_url: String,
    pub page_path: String,
    #[serde(skip)]
    pub page_html: String,
    pub expected: CourseDetails,
}

pub fn load_detail_fixture(path: impl AsRef<Path>) -> Result<DetailFixture> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut fixture: DetailFixture =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let page_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&fixture.page_path);
    fixture.page_html = fs::read_to_string(&page_path)
        .with_context(|| format!("reading fixture page {}", page_path.display()))?;
    Ok(fixture)
}
