//! Catalog grouping and offering matching, plus the file-backed pipeline around them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use courselink_adapters::{select_detail_targets, DetailScrapeConfig, DetailScraper, PageFetcher};
use courselink_core::{
    catalog_records_from_rows, offering_records_from_rows, CatalogRecord, ConflictRecord, CourseDetails,
    OfferingRecord,
};
use courselink_storage::tables::{
    read_catalog_csv, read_catalog_details_csv, read_grouped_catalog_csv, read_offerings_csv, write_group_audit,
    write_rows, CatalogDetailRow, CatalogOutputRow, GroupAuditRow, OfferingOutputRow,
};
use courselink_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

pub mod finalize;
pub mod grouping;
pub mod matcher;
pub mod merge;
pub mod reports;

pub use grouping::{CourseGroup, MergeLog, StageRecord};
pub use matcher::{FilterRules, MatchReport, MatchSummary, OfferingMatcher};
pub use reports::{report_recent_runs, DetailSummary, RunRecord};

pub const CRATE_NAME: &str = "courselink-sync";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub catalog_csv: PathBuf,
    pub offerings_csv: PathBuf,
    pub output_dir: PathBuf,
    /// Holds `rules/` and `reports/`.
    pub workspace_root: PathBuf,
    pub write_stage_logs: bool,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    pub request_delay_ms: u64,
    pub retry_pause_secs: u64,
    pub max_detail_passes: usize,
    /// Keep starting detail rounds until every grouped record with a link is scraped.
    pub details_until_complete: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            catalog_csv: PathBuf::from("data/catalog.csv"),
            offerings_csv: PathBuf::from("data/offerings.csv"),
            output_dir: PathBuf::from("./out"),
            workspace_root: PathBuf::from("."),
            write_stage_logs: false,
            artifacts_dir: PathBuf::from("./artifacts"),
            user_agent: "courselink-bot/0.1".to_string(),
            http_timeout_secs: 20,
            max_concurrent_requests: 15,
            request_delay_ms: 250,
            retry_pause_secs: 10,
            max_detail_passes: 5,
            details_until_complete: false,
        }
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    std::env::var(name).map(PathBuf::from).unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            catalog_csv: env_path("COURSELINK_CATALOG_CSV", d.catalog_csv),
            offerings_csv: env_path("COURSELINK_OFFERINGS_CSV", d.offerings_csv),
            output_dir: env_path("COURSELINK_OUTPUT_DIR", d.output_dir),
            workspace_root: env_path("COURSELINK_WORKSPACE_ROOT", d.workspace_root),
            write_stage_logs: env_flag("COURSELINK_WRITE_STAGE_LOGS", d.write_stage_logs),
            artifacts_dir: env_path("COURSELINK_ARTIFACTS_DIR", d.artifacts_dir),
            user_agent: std::env::var("COURSELINK_USER_AGENT").unwrap_or(d.user_agent),
            http_timeout_secs: env_parse("COURSELINK_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            max_concurrent_requests: env_parse("COURSELINK_MAX_CONCURRENT_REQUESTS", d.max_concurrent_requests),
            request_delay_ms: env_parse("COURSELINK_REQUEST_DELAY_MS", d.request_delay_ms),
            retry_pause_secs: env_parse("COURSELINK_RETRY_PAUSE_SECS", d.retry_pause_secs),
            max_detail_passes: env_parse("COURSELINK_MAX_DETAIL_PASSES", d.max_detail_passes),
            details_until_complete: env_flag("COURSELINK_DETAILS_UNTIL_COMPLETE", d.details_until_complete),
        }
    }

    pub fn grouped_catalog_path(&self) -> PathBuf {
        self.output_dir.join("catalog_grouped.csv")
    }

    pub fn conflicts_path(&self) -> PathBuf {
        self.output_dir.join("conflicts.csv")
    }

    pub fn matched_offerings_path(&self) -> PathBuf {
        self.output_dir.join("offerings_matched.csv")
    }

    pub fn details_path(&self) -> PathBuf {
        self.output_dir.join("catalog_details.csv")
    }

    pub fn stage_log_dir(&self) -> PathBuf {
        self.output_dir.join("stages")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_concurrent_requests: self.max_concurrent_requests,
            request_delay: Duration::from_millis(self.request_delay_ms),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn detail_scrape_config(&self) -> DetailScrapeConfig {
        DetailScrapeConfig {
            retry_pause: Duration::from_secs(self.retry_pause_secs),
            max_passes: self.max_detail_passes,
        }
    }
}

/// Read `rules/filters.yaml`, falling back to the built-in rules when it is absent.
pub fn load_filter_rules(workspace_root: &Path) -> Result<FilterRules> {
    let path = workspace_root.join("rules").join("filters.yaml");
    if !path.exists() {
        warn!(path = %path.display(), "filter rules not found; using built-in defaults");
        return Ok(FilterRules::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Default)]
pub struct GroupingOutcome {
    /// Every input record in load order; removed records carry group id -1.
    pub catalog: Vec<CatalogRecord>,
    pub group_count: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub log: MergeLog,
}

/// Initial grouping, every merge stage, conflict resolution and id assignment.
pub fn group_catalog(records: Vec<CatalogRecord>) -> GroupingOutcome {
    let mut log = MergeLog::default();
    let groups = grouping::initial_grouping(records, &mut log);
    let groups = merge::run_merge_stages(groups, &mut log);
    let groups_in = groups.len();

    let mut finalized = finalize::resolve_conflicts(groups);
    finalize::assign_group_ids(&mut finalized.groups);
    let group_count = finalized.groups.len();
    log.push(StageRecord {
        tag: finalize::CONFLICT_TAG.to_string(),
        groups_in,
        groups_out: group_count,
        merged: finalized.removed.iter().map(|rec| vec![rec.original_index]).collect(),
    });

    GroupingOutcome {
        catalog: finalize::flatten_catalog(finalized.groups, finalized.removed),
        group_count,
        conflicts: finalized.conflicts,
        log,
    }
}

pub fn match_offerings(catalog: &[CatalogRecord], offerings: &mut [OfferingRecord], rules: FilterRules) -> MatchReport {
    OfferingMatcher::new(catalog, rules).run(offerings)
}

fn audit_rows(members: &[&CatalogRecord]) -> Vec<GroupAuditRow> {
    let Some(first) = members.first() else {
        return Vec::new();
    };
    let rep = members.iter().fold(*first, |best, rec| {
        if rec.parsed_year > best.parsed_year {
            *rec
        } else {
            best
        }
    });
    members
        .iter()
        .map(|rec| GroupAuditRow {
            group_id: rec.group_id,
            match_method: rec.match_method.clone(),
            representative_code: rep.code.clone(),
            representative_name: rep.name.clone(),
            catalog_id: rec.catalog_id(),
            course_code: rec.code.clone(),
            course_name: rec.name.clone(),
            year: rec.row.year.clone(),
            course_link: rec.row.course_link.clone(),
        })
        .collect()
}

/// `matched_<tag>.csv` for every stage that touched a group, plus `all_groups.csv`.
pub fn write_grouping_stage_logs(dir: &Path, outcome: &GroupingOutcome) -> Result<()> {
    let by_index: HashMap<usize, &CatalogRecord> =
        outcome.catalog.iter().map(|rec| (rec.original_index, rec)).collect();

    for stage in &outcome.log.stages {
        if stage.merged.is_empty() {
            continue;
        }
        let groups: Vec<Vec<GroupAuditRow>> = stage
            .merged
            .iter()
            .map(|indices| {
                let members: Vec<&CatalogRecord> =
                    indices.iter().filter_map(|idx| by_index.get(idx).copied()).collect();
                audit_rows(&members)
            })
            .collect();
        write_group_audit(dir.join(format!("matched_{}.csv", stage.tag)), &groups)?;
    }

    let mut final_groups: BTreeMap<i64, Vec<&CatalogRecord>> = BTreeMap::new();
    for rec in outcome.catalog.iter().filter(|rec| rec.group_id >= 0) {
        final_groups.entry(rec.group_id).or_default().push(rec);
    }
    let groups: Vec<Vec<GroupAuditRow>> = final_groups
        .into_values()
        .map(|mut members| {
            members.sort_by(|a, b| b.parsed_year.cmp(&a.parsed_year));
            audit_rows(&members)
        })
        .collect();
    write_group_audit(dir.join("all_groups.csv"), &groups)
}

#[derive(Debug, Clone, Default)]
pub struct MatchingOutcome {
    pub offerings: Vec<OfferingRecord>,
    pub report: MatchReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalog_records: usize,
    pub groups: usize,
    pub conflicts: usize,
    pub offerings: usize,
    pub unmatched_offerings: usize,
    pub details: Option<DetailSummary>,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct ReconcilePipeline {
    config: ReconcileConfig,
    rules: FilterRules,
}

impl ReconcilePipeline {
    pub fn new(config: ReconcileConfig) -> Result<Self> {
        let rules = load_filter_rules(&config.workspace_root)?;
        Ok(Self { config, rules })
    }

    pub fn with_rules(mut self, rules: FilterRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Group the catalog table and write the grouped catalog and conflict log.
    pub fn run_grouping(&self) -> Result<GroupingOutcome> {
        let rows = read_catalog_csv(&self.config.catalog_csv)?;
        info!(records = rows.len(), path = %self.config.catalog_csv.display(), "catalog loaded");
        let outcome = group_catalog(catalog_records_from_rows(rows));

        let grouped: Vec<CatalogOutputRow> = outcome.catalog.iter().map(CatalogOutputRow::from).collect();
        write_rows(self.config.grouped_catalog_path(), &grouped)?;
        write_rows(self.config.conflicts_path(), &outcome.conflicts)?;
        if self.config.write_stage_logs {
            write_grouping_stage_logs(&self.config.stage_log_dir(), &outcome)?;
        }
        info!(
            groups = outcome.group_count,
            conflicts = outcome.conflicts.len(),
            "catalog grouping complete"
        );
        Ok(outcome)
    }

    pub fn load_grouped_catalog(&self) -> Result<Vec<CatalogRecord>> {
        let path = self.config.grouped_catalog_path();
        read_grouped_catalog_csv(&path).with_context(|| format!("loading grouped catalog {}", path.display()))
    }

    /// Match the offerings table against `catalog` and write the annotated offerings.
    pub fn run_matching(&self, catalog: &[CatalogRecord]) -> Result<MatchingOutcome> {
        let rows = read_offerings_csv(&self.config.offerings_csv)?;
        info!(records = rows.len(), path = %self.config.offerings_csv.display(), "offerings loaded");
        let mut offerings = offering_records_from_rows(rows);
        let report = match_offerings(catalog, &mut offerings, self.rules.clone());

        let out: Vec<OfferingOutputRow> = offerings.iter().map(OfferingOutputRow::from).collect();
        write_rows(self.config.matched_offerings_path(), &out)?;
        if self.config.write_stage_logs {
            let dir = self.config.stage_log_dir();
            write_rows(dir.join("matched_courses_summary.csv"), &report.log)?;
            let remaining: HashSet<usize> = report.remaining.iter().copied().collect();
            let remaining_rows: Vec<_> = offerings
                .iter()
                .filter(|o| remaining.contains(&o.original_index))
                .map(|o| o.row.clone())
                .collect();
            write_rows(dir.join("remaining.csv"), &remaining_rows)?;
        }
        info!(
            resolved = report.summary.resolved,
            unmatched = report.summary.unmatched,
            "offering matching complete"
        );
        Ok(MatchingOutcome { offerings, report })
    }

    /// Scrape detail pages over HTTP for one representative per group.
    pub async fn run_details(&self, catalog: &[CatalogRecord]) -> Result<DetailSummary> {
        let fetcher = HttpFetcher::new(self.config.http_client_config())?;
        self.run_details_with(&fetcher, catalog).await
    }

    /// Like [`Self::run_details`] with an injected fetcher. Records already
    /// marked scraped in an existing detail table are kept and skipped.
    ///
    /// One round scrapes one member per group. With `details_until_complete`
    /// further rounds pick the next unscraped member of each group, stopping
    /// once no targets remain or a round scrapes nothing.
    pub async fn run_details_with(&self, fetcher: &dyn PageFetcher, catalog: &[CatalogRecord]) -> Result<DetailSummary> {
        let details_path = self.config.details_path();
        let mut known: BTreeMap<String, CourseDetails> = BTreeMap::new();
        if details_path.exists() {
            for row in read_catalog_details_csv(&details_path)? {
                if row.scraped {
                    known.insert(row.catalog_id.clone(), row.details());
                }
            }
        }

        let scraper = DetailScraper::new(self.config.detail_scrape_config())
            .with_artifact_store(ArtifactStore::new(self.config.artifacts_dir.clone()));
        let mut summary = DetailSummary::default();
        loop {
            let already: HashSet<String> = known.keys().cloned().collect();
            let targets = select_detail_targets(catalog, &already);
            if targets.is_empty() {
                break;
            }
            summary.rounds += 1;
            summary.targets += targets.len();
            info!(
                round = summary.rounds,
                targets = targets.len(),
                already_scraped = already.len(),
                "detail round starting"
            );

            let report = scraper.scrape(fetcher, targets).await;
            let scraped = report.details.len();
            summary.scraped += scraped;
            summary.failed = report.failed.len();
            summary.passes += report.passes;
            summary.stored_pages += report.stored_pages;
            known.extend(report.details);
            write_detail_table(&details_path, catalog, &known)?;

            if !self.config.details_until_complete || scraped == 0 {
                break;
            }
        }
        if summary.rounds == 0 {
            write_detail_table(&details_path, catalog, &known)?;
        }
        Ok(summary)
    }

    /// Group, match, optionally scrape details, then write reports and snapshots.
    pub async fn run_once(&self, with_details: bool) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let grouping = self.run_grouping()?;
        let matching = self.run_matching(&grouping.catalog)?;
        let details = if with_details {
            Some(self.run_details(&grouping.catalog).await?)
        } else {
            None
        };
        self.finish_run(run_id, started_at, grouping, matching, details).await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        grouping: GroupingOutcome,
        matching: MatchingOutcome,
        details: Option<DetailSummary>,
    ) -> Result<RunSummary> {
        let finished_at = Utc::now();
        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            status: "completed".to_string(),
            catalog_csv: self.config.catalog_csv.display().to_string(),
            offerings_csv: self.config.offerings_csv.display().to_string(),
        };
        let reports_dir = reports::write_reports(
            &self.config.workspace_root,
            &reports::RunReport {
                run: &run,
                grouping: &grouping,
                matching: &matching.report.summary,
                details: details.as_ref(),
            },
        )
        .await?;
        let manifest =
            reports::export_parquet_snapshots(&reports_dir, &grouping.catalog, &matching.offerings).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            catalog_records: grouping.catalog.len(),
            groups: grouping.group_count,
            conflicts: grouping.conflicts.len(),
            offerings: matching.offerings.len(),
            unmatched_offerings: matching.report.summary.unmatched,
            details,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        })
    }
}

fn write_detail_table(path: &Path, catalog: &[CatalogRecord], known: &BTreeMap<String, CourseDetails>) -> Result<()> {
    let rows: Vec<CatalogDetailRow> = catalog
        .iter()
        .map(|rec| CatalogDetailRow::new(CatalogOutputRow::from(rec), known.get(&rec.catalog_id())))
        .collect();
    write_rows(path, &rows)
}

pub async fn run_once_from_env(with_details: bool) -> Result<RunSummary> {
    ReconcilePipeline::new(ReconcileConfig::from_env())?
        .run_once(with_details)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use courselink_core::CatalogRow;

    fn mk_record(idx: usize, code: &str, name: &str, year: &str) -> CatalogRecord {
        CatalogRecord::from_row(
            idx,
            CatalogRow {
                course_code: code.into(),
                course_name: name.into(),
                year: year.into(),
                ..Default::default()
            },
        )
    }

    fn sample_catalog() -> Vec<CatalogRecord> {
        vec![
            mk_record(0, "UCRS 1000", "Connections I", "2020-2021"),
            mk_record(1, "UCRS 1001", "Connections II", "2021-2022"),
            mk_record(2, "BIOL 1710", "Biology for Majors", "2019-2020"),
            mk_record(3, "BIOL 1720", "Biology for Majors", "2021-2022"),
            mk_record(4, "PSYC 1630", "Intro Psychology", "2021-2022"),
            mk_record(5, "PSYC 1630", "Intro Psychology", "2021-2022"),
            mk_record(6, "", "", ""),
        ]
    }

    #[test]
    fn grouping_is_idempotent() {
        let first = group_catalog(sample_catalog());
        let second = group_catalog(sample_catalog());
        let ids = |o: &GroupingOutcome| o.catalog.iter().map(|r| r.group_id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn every_record_survives_with_unique_years_per_group() {
        let outcome = group_catalog(sample_catalog());
        assert_eq!(
            outcome.catalog.iter().map(|r| r.original_index).collect::<Vec<_>>(),
            (0..7).collect::<Vec<_>>()
        );

        let mut seen: HashSet<(i64, i32)> = HashSet::new();
        for rec in outcome.catalog.iter().filter(|r| r.group_id >= 0 && r.parsed_year != -1) {
            assert!(seen.insert((rec.group_id, rec.parsed_year)), "duplicate year in group");
        }

        let by_idx = |i: usize| &outcome.catalog[i];
        assert_eq!(by_idx(0).group_id, by_idx(1).group_id);
        assert_eq!(by_idx(0).match_method, "3");
        assert_eq!(by_idx(2).group_id, by_idx(3).group_id);
        assert_eq!(by_idx(5).group_id, -1);
        assert_eq!(by_idx(5).match_method, "8");
        assert_eq!(outcome.conflicts.len(), 1);
        assert!(by_idx(6).group_id >= 0);
        assert_eq!(outcome.log.stage("8").map(|s| s.merged.len()), Some(1));
    }

    #[test]
    fn missing_rules_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = load_filter_rules(dir.path()).expect("rules");
        assert_eq!(rules, FilterRules::default());

        std::fs::create_dir_all(dir.path().join("rules")).expect("mkdir");
        std::fs::write(
            dir.path().join("rules/filters.yaml"),
            "legacy_cutoff_year: 2015\nexperimental_names: [\"pilot course\"]\n",
        )
        .expect("write");
        let rules = load_filter_rules(dir.path()).expect("rules");
        assert_eq!(rules.legacy_cutoff_year, 2015);
        assert_eq!(rules.experimental_names, vec!["pilot course".to_string()]);
        assert_eq!(rules.nonstandard_phrases, FilterRules::default().nonstandard_phrases);
    }

    #[test]
    fn stage_logs_write_one_table_per_touched_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = group_catalog(sample_catalog());
        write_grouping_stage_logs(dir.path(), &outcome).expect("stage logs");

        assert!(dir.path().join("matched_1.csv").exists());
        assert!(dir.path().join("matched_3.csv").exists());
        assert!(dir.path().join("matched_8.csv").exists());
        assert!(!dir.path().join("matched_5e.csv").exists());
        let all = std::fs::read_to_string(dir.path().join("all_groups.csv")).expect("all groups");
        assert!(all.starts_with("Group ID,Match Number,Representative Course Code"));
    }
}
