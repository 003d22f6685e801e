//! Run reports: markdown brief, JSON delta, parquet snapshots and their manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use courselink_core::{CatalogRecord, OfferingRecord, MISSING};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::matcher::MatchSummary;
use crate::GroupingOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub catalog_csv: String,
    pub offerings_csv: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetailSummary {
    pub targets: usize,
    pub scraped: usize,
    pub failed: usize,
    pub passes: usize,
    pub stored_pages: usize,
    /// Target selections made; above one only when scraping until complete.
    pub rounds: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct RunReport<'a> {
    pub run: &'a RunRecord,
    pub grouping: &'a GroupingOutcome,
    pub matching: &'a MatchSummary,
    pub details: Option<&'a DetailSummary>,
}

fn render_brief(report: &RunReport<'_>) -> String {
    let run = report.run;
    let mut lines = vec![
        "# Course Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Catalog records: {}", report.grouping.catalog.len()),
        format!("- Final groups: {}", report.grouping.group_count),
        format!("- Same-year conflicts removed: {}", report.grouping.conflicts.len()),
        String::new(),
        "## Grouping Stages".to_string(),
    ];
    for stage in &report.grouping.log.stages {
        lines.push(format!(
            "- {}: {} -> {} groups, {} formed or enlarged",
            stage.tag,
            stage.groups_in,
            stage.groups_out,
            stage.merged.len()
        ));
    }

    lines.push(String::new());
    lines.push("## Offering Matchers".to_string());
    for count in &report.matching.per_method {
        lines.push(format!(
            "- {}: {} resolved, {} remaining",
            count.method, count.resolved, count.remaining_after
        ));
    }
    lines.push(format!(
        "- total: {} offerings, {} resolved, {} unmatched",
        report.matching.total, report.matching.resolved, report.matching.unmatched
    ));

    if let Some(details) = report.details {
        lines.push(String::new());
        lines.push("## Course Details".to_string());
        lines.push(format!(
            "- {} targets, {} scraped, {} failed after {} passes in {} rounds",
            details.targets, details.scraped, details.failed, details.passes, details.rounds
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_reports(workspace_root: &Path, report: &RunReport<'_>) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(report.run.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("run_brief.md"), render_brief(report))
        .await
        .context("writing run_brief.md")?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": report.run,
        "grouping": {
            "catalog_records": report.grouping.catalog.len(),
            "groups": report.grouping.group_count,
            "stages": report.grouping.log.stages,
        },
        "conflicts": report.grouping.conflicts,
        "matching": report.matching,
        "details": report.details,
    }))
    .context("serializing run delta")?;
    fs::write(reports_dir.join("run_delta.json"), delta_json)
        .await
        .context("writing run_delta.json")?;

    Ok(reports_dir)
}

pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    catalog: &[CatalogRecord],
    offerings: &[OfferingRecord],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let catalog_path = snapshot_dir.join("catalog.parquet");
    let offerings_path = snapshot_dir.join("offerings.parquet");
    write_catalog_parquet(&catalog_path, catalog)?;
    write_offerings_parquet(&offerings_path, offerings)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("catalog", reports_dir, &catalog_path)?,
            manifest_entry("offerings", reports_dir, &offerings_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// Markdown listing of the `runs` most recent report directories.
pub fn report_recent_runs(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Recent Reconciliation Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join("run_delta.json");
        let brief_path = dir.path().join("run_brief.md");
        let manifest_path = dir.path().join("snapshots").join("manifest.json");

        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        let groups = delta
            .pointer("/grouping/groups")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let conflicts = delta
            .get("conflicts")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let unmatched = delta
            .pointer("/matching/unmatched")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- groups: {groups}"));
        lines.push(format!("- conflicts: {conflicts}"));
        lines.push(format!("- unmatched offerings: {unmatched}"));
        lines.push(format!("- delta: `{}`", delta_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a, T>(items: &'a [T], f: impl Fn(&'a T) -> &'a str) -> StringArray {
    StringArray::from(items.iter().map(|item| Some(f(item))).collect::<Vec<_>>())
}

fn write_catalog_parquet(path: &Path, catalog: &[CatalogRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("catalog_id", DataType::Utf8, false),
        ArrowField::new("group_id", DataType::Int64, true),
        ArrowField::new("match_method", DataType::Utf8, false),
        ArrowField::new("course_code", DataType::Utf8, false),
        ArrowField::new("course_name", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("dept_code", DataType::Utf8, false),
        ArrowField::new("course_link", DataType::Utf8, false),
    ]));

    let catalog_ids = StringArray::from(catalog.iter().map(|r| Some(r.catalog_id())).collect::<Vec<_>>());
    let group_ids = Int64Array::from(
        catalog
            .iter()
            .map(|r| (r.group_id >= 0).then_some(r.group_id))
            .collect::<Vec<_>>(),
    );
    let years = Int32Array::from(
        catalog
            .iter()
            .map(|r| (r.parsed_year != MISSING).then_some(r.parsed_year))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(catalog_ids),
            Arc::new(group_ids),
            Arc::new(strings(catalog, |r| r.match_method.as_str())),
            Arc::new(strings(catalog, |r| r.code.as_str())),
            Arc::new(strings(catalog, |r| r.name.as_str())),
            Arc::new(years),
            Arc::new(strings(catalog, |r| r.dept_code.as_str())),
            Arc::new(strings(catalog, |r| r.link())),
        ],
    )
    .context("building catalog record batch")?;
    write_parquet(path, batch)
}

fn write_offerings_parquet(path: &Path, offerings: &[OfferingRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("offering_id", DataType::Utf8, false),
        ArrowField::new("catalog_id", DataType::Utf8, true),
        ArrowField::new("match_method", DataType::Utf8, true),
        ArrowField::new("course_code", DataType::Utf8, false),
        ArrowField::new("course_name", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, true),
        ArrowField::new("broad_semester", DataType::Utf8, false),
        ArrowField::new("faculty_id", DataType::Utf8, false),
    ]));

    let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());
    let catalog_ids = StringArray::from(offerings.iter().map(|o| optional(&o.catalog_id)).collect::<Vec<_>>());
    let methods = StringArray::from(offerings.iter().map(|o| optional(&o.match_method)).collect::<Vec<_>>());
    let years = Int32Array::from(
        offerings
            .iter()
            .map(|o| (o.year != MISSING).then_some(o.year))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(offerings, |o| o.row.offering_id.as_str())),
            Arc::new(catalog_ids),
            Arc::new(methods),
            Arc::new(strings(offerings, |o| o.code.as_str())),
            Arc::new(strings(offerings, |o| o.name.as_str())),
            Arc::new(years),
            Arc::new(strings(offerings, |o| o.row.broad_semester.as_str())),
            Arc::new(strings(offerings, |o| o.row.faculty_id.as_str())),
        ],
    )
    .context("building offerings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::MergeLog;
    use crate::matcher::MethodCount;
    use courselink_core::{CatalogRow, OfferingRow};

    fn mk_run() -> RunRecord {
        let now = Utc::now();
        RunRecord {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            status: "completed".into(),
            catalog_csv: "catalog.csv".into(),
            offerings_csv: "offerings.csv".into(),
        }
    }

    #[tokio::test]
    async fn reports_and_snapshots_land_under_run_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut rec = CatalogRecord::from_row(
            0,
            CatalogRow {
                course_code: "ENGL 1310".into(),
                course_name: "College Writing I".into(),
                year: "2023-2024".into(),
                ..Default::default()
            },
        );
        rec.group_id = 0;
        let grouping = GroupingOutcome {
            catalog: vec![rec],
            group_count: 1,
            conflicts: Vec::new(),
            log: MergeLog::default(),
        };
        let offering = OfferingRecord::from_row(
            0,
            OfferingRow {
                course_code: "ENGL 1310".into(),
                course_name: "College Writing I".into(),
                year: "2024".into(),
                ..Default::default()
            },
        );
        let matching = MatchSummary {
            total: 1,
            per_method: vec![MethodCount {
                method: "1".into(),
                resolved: 0,
                remaining_after: 1,
            }],
            resolved: 0,
            unmatched: 1,
        };
        let run = mk_run();

        let reports_dir = write_reports(
            dir.path(),
            &RunReport {
                run: &run,
                grouping: &grouping,
                matching: &matching,
                details: None,
            },
        )
        .await
        .expect("reports");
        let manifest = export_parquet_snapshots(&reports_dir, &grouping.catalog, &[offering])
            .await
            .expect("snapshots");

        let brief = std::fs::read_to_string(reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("Final groups: 1"));
        assert!(brief.contains("- 1: 0 resolved, 1 remaining"));
        assert!(manifest.exists());
        assert!(reports_dir.join("snapshots/catalog.parquet").exists());

        let listing = report_recent_runs(5, dir.path()).expect("listing");
        assert!(listing.contains(&run.run_id.to_string()));
        assert!(listing.contains("unmatched offerings: 1"));
    }
}
