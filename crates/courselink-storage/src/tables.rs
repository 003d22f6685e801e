//! CSV tables consumed and produced by the reconciliation pipeline.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use courselink_core::{CatalogRecord, CatalogRow, CourseDetails, OfferingRecord, OfferingRow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CATALOG_REQUIRED_COLUMNS: &[&str] = &["Course Code", "Course Name", "Year", "Course Link"];
pub const OFFERING_REQUIRED_COLUMNS: &[&str] = &["Course Code", "Course Name", "Year", "Broad Semester"];
pub const GROUPED_CATALOG_REQUIRED_COLUMNS: &[&str] =
    &["Catalog ID", "Group ID", "Match Number", "Course Code", "Course Name", "Year"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("{path} is missing required column {column:?}")]
    MissingColumn { path: String, column: String },
}

/// Catalog row annotated with its final group and the stage that placed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogOutputRow {
    #[serde(rename = "Catalog ID")]
    pub catalog_id: String,
    #[serde(rename = "Group ID")]
    pub group_id: i64,
    #[serde(rename = "Match Number")]
    pub match_method: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Catalog Code")]
    pub catalog_code: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Catalog Type")]
    pub catalog_type: String,
    #[serde(rename = "Course Link")]
    pub course_link: String,
}

impl From<&CatalogRecord> for CatalogOutputRow {
    fn from(rec: &CatalogRecord) -> Self {
        Self {
            catalog_id: rec.catalog_id(),
            group_id: rec.group_id,
            match_method: rec.match_method.clone(),
            course_code: rec.row.course_code.clone(),
            course_name: rec.row.course_name.clone(),
            catalog_code: rec.row.catalog_code.clone(),
            year: rec.row.year.clone(),
            catalog_type: rec.row.catalog_type.clone(),
            course_link: rec.row.course_link.clone(),
        }
    }
}

/// Offering row annotated with the matched catalog identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingOutputRow {
    #[serde(rename = "Offering ID")]
    pub offering_id: String,
    #[serde(rename = "Catalog ID")]
    pub catalog_id: String,
    #[serde(rename = "Match Number")]
    pub match_method: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Broad Semester")]
    pub broad_semester: String,
    #[serde(rename = "Specific Semester")]
    pub specific_semester: String,
    #[serde(rename = "Full Course Name")]
    pub full_course_name: String,
    #[serde(rename = "Faculty ID")]
    pub faculty_id: String,
    #[serde(rename = "Link To Highlight")]
    pub link: String,
}

impl From<&OfferingRecord> for OfferingOutputRow {
    fn from(rec: &OfferingRecord) -> Self {
        let row = &rec.row;
        Self {
            offering_id: row.offering_id.clone(),
            catalog_id: rec.catalog_id.clone(),
            match_method: rec.match_method.clone(),
            course_code: row.course_code.clone(),
            course_name: row.course_name.clone(),
            year: row.year.clone(),
            broad_semester: row.broad_semester.clone(),
            specific_semester: row.specific_semester.clone(),
            full_course_name: row.full_course_name.clone(),
            faculty_id: row.faculty_id.clone(),
            link: row.link.clone(),
        }
    }
}

/// Grouped catalog row with scraped detail columns appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDetailRow {
    #[serde(rename = "Catalog ID")]
    pub catalog_id: String,
    #[serde(rename = "Group ID")]
    pub group_id: i64,
    #[serde(rename = "Match Number")]
    pub match_method: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Catalog Code")]
    pub catalog_code: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Catalog Type")]
    pub catalog_type: String,
    #[serde(rename = "Course Link")]
    pub course_link: String,
    #[serde(rename = "Course Scraped")]
    pub scraped: bool,
    #[serde(rename = "Hours")]
    pub hours: String,
    #[serde(rename = "Specific Hours")]
    pub specific_hours: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Prerequisite(s)")]
    pub prerequisites: String,
    #[serde(rename = "Course Fees")]
    pub course_fees: String,
    #[serde(rename = "Other")]
    pub other: String,
}

impl CatalogDetailRow {
    pub fn new(base: CatalogOutputRow, details: Option<&CourseDetails>) -> Self {
        let empty = CourseDetails::default();
        let d = details.unwrap_or(&empty);
        Self {
            catalog_id: base.catalog_id,
            group_id: base.group_id,
            match_method: base.match_method,
            course_code: base.course_code,
            course_name: base.course_name,
            catalog_code: base.catalog_code,
            year: base.year,
            catalog_type: base.catalog_type,
            course_link: base.course_link,
            scraped: details.is_some(),
            hours: d.hours.clone(),
            specific_hours: d.specific_hours.clone(),
            description: d.description.clone(),
            prerequisites: d.prerequisites.clone(),
            course_fees: d.course_fees.clone(),
            other: d.other.clone(),
        }
    }

    pub fn details(&self) -> CourseDetails {
        CourseDetails {
            hours: self.hours.clone(),
            specific_hours: self.specific_hours.clone(),
            description: self.description.clone(),
            prerequisites: self.prerequisites.clone(),
            course_fees: self.course_fees.clone(),
            other: self.other.clone(),
        }
    }
}

/// Row of a grouping audit table; groups are separated by a blank line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAuditRow {
    #[serde(rename = "Group ID")]
    pub group_id: i64,
    #[serde(rename = "Match Number")]
    pub match_method: String,
    #[serde(rename = "Representative Course Code")]
    pub representative_code: String,
    #[serde(rename = "Representative Course Name")]
    pub representative_name: String,
    #[serde(rename = "Catalog ID")]
    pub catalog_id: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Course Link")]
    pub course_link: String,
}

const GROUP_AUDIT_WIDTH: usize = 9;

pub fn read_catalog_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<CatalogRow>> {
    read_table(path.as_ref(), CATALOG_REQUIRED_COLUMNS)
}

pub fn read_offerings_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<OfferingRow>> {
    read_table(path.as_ref(), OFFERING_REQUIRED_COLUMNS)
}

fn read_table<T: DeserializeOwned>(path: &Path, required: &[&str]) -> anyhow::Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    // Trailing optional fields may be left off a row entirely.
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_reader(file);
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();
    for column in required {
        if !headers.iter().any(|h| h == *column) {
            return Err(TableError::MissingColumn {
                path: path.display().to_string(),
                column: column.to_string(),
            }
            .into());
        }
    }

    let mut rows = Vec::new();
    for (line, record) in reader.deserialize().enumerate() {
        let row: T = record.with_context(|| format!("parsing {} data row {}", path.display(), line + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Read a grouped catalog written by [`write_rows`] back into records,
/// restoring each record's group id and method tag.
pub fn read_grouped_catalog_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<CatalogRecord>> {
    let rows: Vec<CatalogOutputRow> = read_table(path.as_ref(), GROUPED_CATALOG_REQUIRED_COLUMNS)?;
    Ok(rows
        .into_iter()
        .enumerate()
        .map(|(idx, out)| {
            let mut rec = CatalogRecord::from_row(
                idx,
                CatalogRow {
                    catalog_id: out.catalog_id,
                    course_code: out.course_code,
                    course_name: out.course_name,
                    catalog_code: out.catalog_code,
                    year: out.year,
                    catalog_type: out.catalog_type,
                    course_link: out.course_link,
                },
            );
            rec.group_id = out.group_id;
            rec.match_method = out.match_method;
            rec
        })
        .collect())
}

/// Previously written detail table, used to resume a partial scrape.
pub fn read_catalog_details_csv(path: impl AsRef<Path>) -> anyhow::Result<Vec<CatalogDetailRow>> {
    read_table(path.as_ref(), &["Catalog ID", "Course Scraped"])
}

pub fn write_rows<T: Serialize>(path: impl AsRef<Path>, rows: &[T]) -> anyhow::Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub fn write_group_audit(path: impl AsRef<Path>, groups: &[Vec<GroupAuditRow>]) -> anyhow::Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record([
            "Group ID",
            "Match Number",
            "Representative Course Code",
            "Representative Course Name",
            "Catalog ID",
            "Course Code",
            "Course Name",
            "Year",
            "Course Link",
        ])
        .with_context(|| format!("writing header to {}", path.display()))?;
    for (idx, group) in groups.iter().enumerate() {
        for row in group {
            writer
                .serialize(row)
                .with_context(|| format!("writing row to {}", path.display()))?;
        }
        if idx + 1 < groups.len() {
            writer
                .write_record([""; GROUP_AUDIT_WIDTH])
                .with_context(|| format!("writing separator to {}", path.display()))?;
        }
    }
    writer.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courselink_core::ConflictRecord;
    use tempfile::tempdir;

    #[test]
    fn catalog_csv_reads_with_optional_columns_missing() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.csv");
        std::fs::write(
            &path,
            "Course Code,Course Name,Year,Course Link\nENGL 1310,College Writing I,2024-2025,https://x/1\n",
        )
        .expect("write");

        let rows = read_catalog_csv(&path).expect("read");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].course_code, "ENGL 1310");
        assert!(rows[0].catalog_id.is_empty());
        assert!(rows[0].catalog_type.is_empty());
    }

    #[test]
    fn short_rows_leave_trailing_columns_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.csv");
        std::fs::write(
            &path,
            "Course Code,Course Name,Year,Catalog Type,Course Link\n\
             MATH 1710,Calculus I,2023-2024,Undergraduate,https://x/1\n\
             MATH 1720,Calculus II,2023-2024,Undergraduate\n\
             MATH 2700,Linear Algebra,2023-2024,Undergraduate,https://x/3\n",
        )
        .expect("write");

        let rows = read_catalog_csv(&path).expect("read");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].course_code, "MATH 1720");
        assert_eq!(rows[1].catalog_type, "Undergraduate");
        assert!(rows[1].course_link.is_empty());
        assert_eq!(rows[2].course_link, "https://x/3");
    }

    #[test]
    fn missing_required_column_is_a_typed_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offerings.csv");
        std::fs::write(&path, "Course Code,Course Name\nENGL 1310,Writing\n").expect("write");

        let err = read_offerings_csv(&path).expect_err("should fail");
        let table_err = err.downcast_ref::<TableError>().expect("typed error");
        assert!(matches!(table_err, TableError::MissingColumn { column, .. } if column == "Year"));
    }

    #[test]
    fn conflict_rows_round_trip_through_csv_headers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/conflicts.csv");
        let rows = vec![ConflictRecord {
            method: "8".into(),
            year: 2021,
            kept_code: "MATH 1710".into(),
            kept_name: "Calculus I".into(),
            kept_link: "a".into(),
            removed_code: "MATH 1720".into(),
            removed_name: "Calculus I".into(),
            removed_link: "b".into(),
        }];
        write_rows(&path, &rows).expect("write");

        let text = std::fs::read_to_string(&path).expect("read");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Conflict_Method_Number,Conflicting_Year,Course1_Code,Course1_Name,Course1_Link,Course2_Code,Course2_Name,Course2_Link")
        );
        assert_eq!(lines.next(), Some("8,2021,MATH 1710,Calculus I,a,MATH 1720,Calculus I,b"));
    }

    #[test]
    fn grouped_catalog_restores_group_ids() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog_grouped.csv");
        let mut rec = CatalogRecord::from_row(
            0,
            CatalogRow {
                catalog_id: "77".into(),
                course_code: "MATH 1710".into(),
                course_name: "Calculus I".into(),
                year: "2023-2024".into(),
                course_link: "https://x/77".into(),
                ..Default::default()
            },
        );
        rec.group_id = 4;
        rec.match_method = "5a".into();
        write_rows(&path, &[CatalogOutputRow::from(&rec)]).expect("write");

        let back = read_grouped_catalog_csv(&path).expect("read");
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].group_id, 4);
        assert_eq!(back[0].match_method, "5a");
        assert_eq!(back[0].catalog_id(), "77");
        assert_eq!(back[0].parsed_year, 2023);
    }

    #[test]
    fn group_audit_separates_groups_with_blank_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("matched_4.csv");
        let row = |gid: i64, code: &str| GroupAuditRow {
            group_id: gid,
            match_method: "4".into(),
            representative_code: code.into(),
            representative_name: "Name".into(),
            catalog_id: "1".into(),
            course_code: code.into(),
            course_name: "Name".into(),
            year: "2020-2021".into(),
            course_link: String::new(),
        };
        write_group_audit(&path, &[vec![row(0, "A 100")], vec![row(1, "B 200")]]).expect("write");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], ",,,,,,,,");
    }
}
