//! Offering-to-catalog matching cascade.
//!
//! Fourteen matchers run in order over the offerings still unresolved. Most
//! bind an offering to one catalog record; four are filters that resolve it
//! without a catalog id.

use std::collections::{HashMap, HashSet};

use courselink_core::normalize::{loose_course_number, loose_grade_level};
use courselink_core::{CatalogRecord, MatchLogEntry, OfferingRecord, MISSING};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

/// Phrases and cutoffs behind the filter matchers. Loaded from `rules/filters.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Matcher 5: substring of the lower-cased name or full name.
    pub nonstandard_phrases: Vec<String>,
    /// Matcher 12: whole lower-cased name or full name.
    pub experimental_names: Vec<String>,
    /// Matcher 13: offerings before this year are legacy...
    pub legacy_cutoff_year: i32,
    /// ...except this semester of the year just before the cutoff.
    pub legacy_grace_semester: String,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            nonstandard_phrases: [
                "special problems",
                "research problems in lieu of thesis",
                "honors college mentored research experience",
                "problem in lieu of thesis",
                "doctoral dissertation",
            ]
            .map(String::from)
            .to_vec(),
            experimental_names: ["experiment course", "experimental course"].map(String::from).to_vec(),
            legacy_cutoff_year: 2012,
            legacy_grace_semester: "fall".to_string(),
        }
    }
}

impl FilterRules {
    fn is_nonstandard(&self, offering: &OfferingRecord) -> bool {
        let name = offering.name.to_lowercase();
        let full_name = offering.row.full_course_name.to_lowercase();
        self.nonstandard_phrases.iter().any(|phrase| {
            let phrase = phrase.to_lowercase();
            name.contains(&phrase) || full_name.contains(&phrase)
        })
    }

    fn is_experimental(&self, offering: &OfferingRecord) -> bool {
        let name = offering.name.to_lowercase();
        let full_name = offering.row.full_course_name.trim().to_lowercase();
        self.experimental_names
            .iter()
            .any(|label| label.eq_ignore_ascii_case(&name) || label.eq_ignore_ascii_case(&full_name))
    }

    fn is_legacy(&self, offering: &OfferingRecord) -> bool {
        let year = offering.year;
        let semester = offering.row.broad_semester.trim();
        year != MISSING
            && year < self.legacy_cutoff_year
            && !(year == self.legacy_cutoff_year - 1 && semester.eq_ignore_ascii_case(&self.legacy_grace_semester))
    }
}

/// Key tables built once from the catalog, as indices into the catalog slice.
///
/// Every key is inserted only when all of its components are non-empty.
#[derive(Debug, Clone, Default)]
pub struct CatalogLookups {
    code_name: HashMap<(String, String), Vec<usize>>,
    code_normalized_name: HashMap<(String, String), Vec<usize>>,
    code: HashMap<String, Vec<usize>>,
    dept_normalized_name: HashMap<(String, String), Vec<usize>>,
    normalized_name_number: HashMap<(String, String), Vec<usize>>,
    normalized_name: HashMap<String, Vec<usize>>,
    departments: HashSet<String>,
}

impl CatalogLookups {
    pub fn build(catalog: &[CatalogRecord]) -> Self {
        let mut lookups = Self::default();
        for (idx, rec) in catalog.iter().enumerate() {
            let code = rec.code.as_str();
            let name = rec.name.as_str();
            let norm = rec.normalized_name.as_str();
            let dept = rec.dept_code.as_str();
            let number = loose_course_number(code);

            if !code.is_empty() && !name.is_empty() {
                push(&mut lookups.code_name, (code.to_string(), name.to_string()), idx);
            }
            if !code.is_empty() && !norm.is_empty() {
                push(&mut lookups.code_normalized_name, (code.to_string(), norm.to_string()), idx);
            }
            if !code.is_empty() {
                push(&mut lookups.code, code.to_string(), idx);
            }
            if !dept.is_empty() && !norm.is_empty() {
                push(&mut lookups.dept_normalized_name, (dept.to_string(), norm.to_string()), idx);
            }
            if !norm.is_empty() && !number.is_empty() {
                push(&mut lookups.normalized_name_number, (norm.to_string(), number), idx);
            }
            if !norm.is_empty() {
                push(&mut lookups.normalized_name, norm.to_string(), idx);
            }
            if !dept.is_empty() {
                lookups.departments.insert(dept.to_string());
            }
        }
        lookups
    }

    pub fn has_department(&self, dept: &str) -> bool {
        self.departments.contains(dept)
    }
}

fn push<K: std::hash::Hash + Eq>(map: &mut HashMap<K, Vec<usize>>, key: K, idx: usize) {
    map.entry(key).or_default().push(idx);
}

fn candidates<'a, K, Q>(map: &'a HashMap<K, Vec<usize>>, key: &Q) -> &'a [usize]
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    map.get(key).map(Vec::as_slice).unwrap_or(&[])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    ExactCodeName,
    CodeNormalizedName,
    Code,
    DeptNormalizedName,
    NonStandardCourse,
    NormalizedNameNumber,
    NormalizedNameByGrade,
    CodeFallback,
    NormalizedNameNumberFallback,
    NormalizedNameByGradeFallback,
    NormalizedNameFallback,
    ExperimentalCourse,
    LegacyOffering,
    UnknownDepartment,
}

pub const MATCHER_ORDER: [Matcher; 14] = [
    Matcher::ExactCodeName,
    Matcher::CodeNormalizedName,
    Matcher::Code,
    Matcher::DeptNormalizedName,
    Matcher::NonStandardCourse,
    Matcher::NormalizedNameNumber,
    Matcher::NormalizedNameByGrade,
    Matcher::CodeFallback,
    Matcher::NormalizedNameNumberFallback,
    Matcher::NormalizedNameByGradeFallback,
    Matcher::NormalizedNameFallback,
    Matcher::ExperimentalCourse,
    Matcher::LegacyOffering,
    Matcher::UnknownDepartment,
];

impl Matcher {
    pub fn method(self) -> &'static str {
        match self {
            Matcher::ExactCodeName => "1",
            Matcher::CodeNormalizedName => "2",
            Matcher::Code => "3",
            Matcher::DeptNormalizedName => "4",
            Matcher::NonStandardCourse => "5",
            Matcher::NormalizedNameNumber => "6",
            Matcher::NormalizedNameByGrade => "7",
            Matcher::CodeFallback => "8",
            Matcher::NormalizedNameNumberFallback => "9",
            Matcher::NormalizedNameByGradeFallback => "10",
            Matcher::NormalizedNameFallback => "11",
            Matcher::ExperimentalCourse => "12",
            Matcher::LegacyOffering => "13",
            Matcher::UnknownDepartment => "14",
        }
    }

    pub fn is_filter(self) -> bool {
        matches!(
            self,
            Matcher::NonStandardCourse
                | Matcher::ExperimentalCourse
                | Matcher::LegacyOffering
                | Matcher::UnknownDepartment
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Index into the catalog slice.
    Matched(usize),
    Filtered,
}

/// Does the catalog year `Y-Y+1` cover this offering? Fall belongs to `Y`,
/// every other semester to `Y+1`.
pub fn is_year_match(offering: &OfferingRecord, catalog: &CatalogRecord) -> bool {
    if offering.year == MISSING || catalog.parsed_year == MISSING {
        return false;
    }
    if offering.is_fall() {
        offering.year == catalog.parsed_year
    } else {
        offering.year == catalog.parsed_year + 1
    }
}

/// Preferred order of catalog grade levels for an offering at `target`.
///
/// Undergraduate levels are 1-4 and graduate levels 5-6.
pub fn grade_priority(target: i32) -> Vec<i32> {
    const UNDERGRAD: [i32; 4] = [1, 2, 3, 4];
    const GRAD: [i32; 2] = [5, 6];
    if target == MISSING {
        return Vec::new();
    }
    let mut order = vec![target];
    if UNDERGRAD.contains(&target) {
        order.extend(UNDERGRAD.iter().filter(|l| **l > target));
        order.extend(UNDERGRAD.iter().rev().filter(|l| **l < target));
        order.extend(GRAD);
    } else if GRAD.contains(&target) {
        order.extend(GRAD.iter().filter(|l| **l != target));
        order.extend(UNDERGRAD.iter().rev());
    } else {
        order.extend(UNDERGRAD.iter().rev());
        order.extend(GRAD);
    }
    order
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodCount {
    pub method: String,
    pub resolved: usize,
    pub remaining_after: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchSummary {
    pub total: usize,
    pub per_method: Vec<MethodCount>,
    pub resolved: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MatchReport {
    pub summary: MatchSummary,
    pub log: Vec<MatchLogEntry>,
    /// `original_index` of offerings no matcher resolved.
    pub remaining: Vec<usize>,
}

pub struct OfferingMatcher<'a> {
    catalog: &'a [CatalogRecord],
    lookups: CatalogLookups,
    rules: FilterRules,
}

impl<'a> OfferingMatcher<'a> {
    pub fn new(catalog: &'a [CatalogRecord], rules: FilterRules) -> Self {
        Self {
            catalog,
            lookups: CatalogLookups::build(catalog),
            rules,
        }
    }

    pub fn lookups(&self) -> &CatalogLookups {
        &self.lookups
    }

    /// Apply one matcher to one offering.
    pub fn try_match(&self, matcher: Matcher, offering: &OfferingRecord) -> Option<MatchOutcome> {
        let lk = &self.lookups;
        let code = offering.code.as_str();
        let norm = offering.normalized_name.as_str();
        let number = offering.course_number.as_str();
        let pick = |found: &[usize]| self.pick(offering, found).map(MatchOutcome::Matched);
        let pick_by_grade = |found: &[usize]| {
            let ranked = self.rank_by_grade(offering.grade_level, found);
            self.pick(offering, &ranked).map(MatchOutcome::Matched)
        };
        let filtered = |hit: bool| hit.then_some(MatchOutcome::Filtered);

        match matcher {
            Matcher::ExactCodeName => {
                pick(candidates(&lk.code_name, &(code.to_string(), offering.name.clone())))
            }
            Matcher::CodeNormalizedName => {
                pick(candidates(&lk.code_normalized_name, &(code.to_string(), norm.to_string())))
            }
            Matcher::Code | Matcher::CodeFallback => pick(candidates(&lk.code, code)),
            Matcher::DeptNormalizedName => pick_by_grade(candidates(
                &lk.dept_normalized_name,
                &(offering.dept_code.clone(), norm.to_string()),
            )),
            Matcher::NonStandardCourse => filtered(self.rules.is_nonstandard(offering)),
            Matcher::NormalizedNameNumber | Matcher::NormalizedNameNumberFallback => pick(candidates(
                &lk.normalized_name_number,
                &(norm.to_string(), number.to_string()),
            )),
            Matcher::NormalizedNameByGrade | Matcher::NormalizedNameByGradeFallback => {
                pick_by_grade(candidates(&lk.normalized_name, norm))
            }
            Matcher::NormalizedNameFallback => pick(candidates(&lk.normalized_name, norm)),
            Matcher::ExperimentalCourse => filtered(self.rules.is_experimental(offering)),
            Matcher::LegacyOffering => filtered(self.rules.is_legacy(offering)),
            Matcher::UnknownDepartment => filtered(
                !offering.dept_code.is_empty() && !lk.has_department(&offering.dept_code),
            ),
        }
    }

    /// First year-aligned candidate, else the first candidate.
    fn pick(&self, offering: &OfferingRecord, found: &[usize]) -> Option<usize> {
        found
            .iter()
            .copied()
            .find(|idx| is_year_match(offering, &self.catalog[*idx]))
            .or_else(|| found.first().copied())
    }

    fn rank_by_grade(&self, target: i32, found: &[usize]) -> Vec<usize> {
        let mut ranked = found.to_vec();
        let priority = grade_priority(target);
        if priority.is_empty() {
            return ranked;
        }
        ranked.sort_by_key(|idx| {
            let level = loose_grade_level(&self.catalog[*idx].code);
            priority.iter().position(|p| *p == level).unwrap_or(99)
        });
        ranked
    }

    /// Run the whole cascade, writing `catalog_id` and `match_method` in place.
    pub fn run(&self, offerings: &mut [OfferingRecord]) -> MatchReport {
        let span = info_span!("offering_match", offerings = offerings.len());
        let _entered = span.enter();

        let mut report = MatchReport::default();
        report.summary.total = offerings.len();
        let mut pending: Vec<usize> = (0..offerings.len()).collect();

        for matcher in MATCHER_ORDER {
            let mut still_pending = Vec::with_capacity(pending.len());
            let mut resolved = 0;
            for pos in pending {
                let offering = &mut offerings[pos];
                match self.try_match(matcher, offering) {
                    Some(outcome) => {
                        resolved += 1;
                        report.log.push(self.resolve(offering, matcher, outcome));
                    }
                    None => still_pending.push(pos),
                }
            }
            pending = still_pending;
            info!(
                method = matcher.method(),
                resolved,
                remaining = pending.len(),
                "matcher complete"
            );
            report.summary.per_method.push(MethodCount {
                method: matcher.method().to_string(),
                resolved,
                remaining_after: pending.len(),
            });
        }

        report.summary.unmatched = pending.len();
        report.summary.resolved = report.summary.total - pending.len();
        report.remaining = pending.iter().map(|pos| offerings[*pos].original_index).collect();
        report
    }

    fn resolve(&self, offering: &mut OfferingRecord, matcher: Matcher, outcome: MatchOutcome) -> MatchLogEntry {
        offering.match_method = matcher.method().to_string();
        let mut entry = MatchLogEntry {
            offering_code: offering.row.course_code.clone(),
            offering_name: offering.row.course_name.clone(),
            offering_year: offering.row.year.clone(),
            method: offering.match_method.clone(),
            catalog_id: String::new(),
            catalog_code: String::new(),
            catalog_name: String::new(),
            catalog_link: "N/A".to_string(),
        };
        if let MatchOutcome::Matched(idx) = outcome {
            let rec = &self.catalog[idx];
            offering.catalog_id = rec.catalog_id();
            entry.catalog_id = offering.catalog_id.clone();
            entry.catalog_code = rec.code.clone();
            entry.catalog_name = rec.name.clone();
            entry.catalog_link = rec.row.course_link.clone();
        } else {
            offering.catalog_id.clear();
        }
        entry
    }
}
