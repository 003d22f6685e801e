//! Core record model and derived-field normalization for courselink.

use serde::{Deserialize, Serialize};

pub mod normalize;

pub use normalize::{SemanticName, MISSING};

pub const CRATE_NAME: &str = "courselink-core";

/// One catalog listing exactly as it was scraped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogRow {
    #[serde(rename = "Catalog ID", default)]
    pub catalog_id: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Catalog Code", default)]
    pub catalog_code: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Catalog Type", default)]
    pub catalog_type: String,
    #[serde(rename = "Course Link", default)]
    pub course_link: String,
}

/// One semester offering exactly as it was scraped from a faculty page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OfferingRow {
    #[serde(rename = "Offering ID", default)]
    pub offering_id: String,
    #[serde(rename = "Course Code")]
    pub course_code: String,
    #[serde(rename = "Course Name")]
    pub course_name: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Broad Semester", default)]
    pub broad_semester: String,
    #[serde(rename = "Specific Semester", default)]
    pub specific_semester: String,
    #[serde(rename = "Full Course Name", default)]
    pub full_course_name: String,
    #[serde(rename = "Faculty ID", default)]
    pub faculty_id: String,
    #[serde(rename = "Link To Highlight", default)]
    pub link: String,
}

/// Catalog listing enriched with fields derived once at load time.
///
/// `original_index` is the load position and never changes. `group_id`
/// stays at [`MISSING`] until group ids are assigned after finalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogRecord {
    pub original_index: usize,
    pub row: CatalogRow,
    pub code: String,
    pub name: String,
    pub parsed_year: i32,
    pub dept_code: String,
    pub course_number: String,
    pub grade_level: i32,
    pub normalized_name: String,
    pub semantic: SemanticName,
    pub normalized_base_name: String,
    pub group_id: i64,
    pub match_method: String,
}

impl CatalogRecord {
    pub fn from_row(original_index: usize, row: CatalogRow) -> Self {
        let code = row.course_code.trim().to_string();
        let name = row.course_name.trim().to_string();
        let course_number = normalize::course_number(&code);
        let semantic = normalize::split_semantic_name(&name);
        Self {
            original_index,
            parsed_year: normalize::parse_catalog_year(&row.year),
            dept_code: normalize::dept_code(&code),
            grade_level: normalize::grade_level(&course_number),
            course_number,
            normalized_name: normalize::normalize_alnum(&name),
            normalized_base_name: normalize::normalize_alnum(&semantic.base),
            semantic,
            code,
            name,
            row,
            group_id: MISSING as i64,
            match_method: String::new(),
        }
    }

    /// Identity reported to the offering matcher; falls back to load order.
    pub fn catalog_id(&self) -> String {
        let id = self.row.catalog_id.trim();
        if id.is_empty() {
            self.original_index.to_string()
        } else {
            id.to_string()
        }
    }

    pub fn link(&self) -> &str {
        self.row.course_link.trim()
    }

    pub fn roman_numeral(&self) -> &str {
        &self.semantic.roman_numeral
    }
}

/// Offering enriched with the loose keys the matcher compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferingRecord {
    pub original_index: usize,
    pub row: OfferingRow,
    pub code: String,
    pub name: String,
    pub normalized_name: String,
    pub dept_code: String,
    pub course_number: String,
    pub grade_level: i32,
    pub year: i32,
    pub catalog_id: String,
    pub match_method: String,
}

impl OfferingRecord {
    pub fn from_row(original_index: usize, row: OfferingRow) -> Self {
        let code = row.course_code.trim().to_string();
        let name = row.course_name.trim().to_string();
        Self {
            original_index,
            normalized_name: normalize::normalize_alnum(&name),
            dept_code: normalize::dept_code(&code),
            course_number: normalize::loose_course_number(&code),
            grade_level: normalize::loose_grade_level(&code),
            year: normalize::parse_offering_year(&row.year),
            code,
            name,
            row,
            catalog_id: String::new(),
            match_method: String::new(),
        }
    }

    pub fn is_fall(&self) -> bool {
        self.row.broad_semester.trim().eq_ignore_ascii_case("fall")
    }

    pub fn is_resolved(&self) -> bool {
        !self.match_method.is_empty()
    }
}

pub fn catalog_records_from_rows(rows: Vec<CatalogRow>) -> Vec<CatalogRecord> {
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| CatalogRecord::from_row(idx, row))
        .collect()
}

pub fn offering_records_from_rows(rows: Vec<OfferingRow>) -> Vec<OfferingRecord> {
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| OfferingRecord::from_row(idx, row))
        .collect()
}

/// Same-year collision resolved by the finalizer: course 1 was kept, course 2 removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    #[serde(rename = "Conflict_Method_Number")]
    pub method: String,
    #[serde(rename = "Conflicting_Year")]
    pub year: i32,
    #[serde(rename = "Course1_Code")]
    pub kept_code: String,
    #[serde(rename = "Course1_Name")]
    pub kept_name: String,
    #[serde(rename = "Course1_Link")]
    pub kept_link: String,
    #[serde(rename = "Course2_Code")]
    pub removed_code: String,
    #[serde(rename = "Course2_Name")]
    pub removed_name: String,
    #[serde(rename = "Course2_Link")]
    pub removed_link: String,
}

/// Audit line for one offering resolved by a matcher or a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchLogEntry {
    #[serde(rename = "Original Course Code")]
    pub offering_code: String,
    #[serde(rename = "Original Course Name")]
    pub offering_name: String,
    #[serde(rename = "Original Year")]
    pub offering_year: String,
    #[serde(rename = "Matched By Method Number")]
    pub method: String,
    #[serde(rename = "Matched Catalog ID")]
    pub catalog_id: String,
    #[serde(rename = "Matched Catalog Code")]
    pub catalog_code: String,
    #[serde(rename = "Matched Catalog Course Name")]
    pub catalog_name: String,
    #[serde(rename = "Matched Catalog Link")]
    pub catalog_link: String,
}

/// Fields scraped from a course detail page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CourseDetails {
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

impl CourseDetails {
    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
            && self.specific_hours.is_empty()
            && self.description.is_empty()
            && self.prerequisites.is_empty()
            && self.course_fees.is_empty()
            && self.other.is_empty()
    }
}
