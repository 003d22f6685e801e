//! Bucketed merge passes over course groups.
//!
//! Every stage buckets groups by a key taken from their most recent member and
//! merges pairs inside a bucket until a full pass changes nothing. Merged
//! groups must have disjoint known years.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use courselink_core::normalize::roman_rank;
use courselink_core::{CatalogRecord, MISSING};
use tracing::{debug, info, info_span};

use crate::grouping::{CourseGroup, MergeLog, StageRecord};

/// One component of a bucket key. Empty text and `-1` mark a missing value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Text(String),
    Number(i32),
}

impl KeyPart {
    pub fn is_missing(&self) -> bool {
        match self {
            KeyPart::Text(text) => text.is_empty(),
            KeyPart::Number(n) => *n == MISSING,
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Number(value)
    }
}

/// What a merge predicate sees for an ordered pair (a, b) within a bucket.
#[derive(Debug, Clone, Copy)]
pub struct PairView<'a> {
    pub rep_a: &'a CatalogRecord,
    pub earliest_b: &'a CatalogRecord,
    pub years_a: &'a BTreeSet<i32>,
    pub years_b: &'a BTreeSet<i32>,
}

impl PairView<'_> {
    pub fn years_disjoint(&self) -> bool {
        self.years_a.is_disjoint(self.years_b)
    }

    fn same_numeral(&self) -> bool {
        self.rep_a.roman_numeral() == self.earliest_b.roman_numeral()
    }
}

pub type BucketKeyFn = fn(&CatalogRecord) -> Vec<KeyPart>;
pub type MergePredicate = fn(&PairView<'_>) -> bool;

#[derive(Debug, Clone, Copy)]
pub struct MergeStage {
    pub tag: &'static str,
    pub key: BucketKeyFn,
    pub predicate: MergePredicate,
}

fn dept_name_grade(rec: &CatalogRecord) -> Vec<KeyPart> {
    vec![
        rec.dept_code.as_str().into(),
        rec.normalized_name.as_str().into(),
        rec.grade_level.into(),
    ]
}

fn dept_base_name(rec: &CatalogRecord) -> Vec<KeyPart> {
    vec![
        rec.dept_code.as_str().into(),
        rec.normalized_base_name.as_str().into(),
    ]
}

fn code_only(rec: &CatalogRecord) -> Vec<KeyPart> {
    vec![rec.code.as_str().into()]
}

fn name_and_number(rec: &CatalogRecord) -> Vec<KeyPart> {
    vec![
        rec.normalized_name.as_str().into(),
        rec.course_number.as_str().into(),
    ]
}

fn disjoint_only(pair: &PairView<'_>) -> bool {
    pair.years_disjoint()
}

fn same_numeral_same_number(pair: &PairView<'_>) -> bool {
    let (a, b) = (&pair.rep_a.course_number, &pair.earliest_b.course_number);
    pair.same_numeral() && !a.is_empty() && a == b && pair.years_disjoint()
}

fn same_numeral_last_digit_differs(pair: &PairView<'_>) -> bool {
    let (a, b) = (
        pair.rep_a.course_number.as_bytes(),
        pair.earliest_b.course_number.as_bytes(),
    );
    pair.same_numeral()
        && a.len() >= 4
        && b.len() >= 4
        && a[..3] == b[..3]
        && a[3] != b[3]
        && pair.years_disjoint()
}

fn same_numeral_tail_differs(pair: &PairView<'_>) -> bool {
    let (a, b) = (
        pair.rep_a.course_number.as_bytes(),
        pair.earliest_b.course_number.as_bytes(),
    );
    pair.same_numeral()
        && a.len() >= 3
        && b.len() >= 3
        && a[..2] == b[..2]
        && a[2..] != b[2..]
        && pair.years_disjoint()
}

fn same_numeral_same_grade(pair: &PairView<'_>) -> bool {
    let (a, b) = (pair.rep_a, pair.earliest_b);
    pair.same_numeral()
        && a.grade_level != MISSING
        && a.grade_level == b.grade_level
        && a.course_number != b.course_number
        && pair.years_disjoint()
}

fn numerals_differ(pair: &PairView<'_>) -> bool {
    !pair.same_numeral() && pair.years_disjoint()
}

fn departments_differ(pair: &PairView<'_>) -> bool {
    pair.rep_a.dept_code != pair.earliest_b.dept_code && pair.years_disjoint()
}

/// Stages 4 through 7, in the order they run after the sequential-numeral pass.
pub const MERGE_STAGES: [MergeStage; 8] = [
    MergeStage { tag: "4", key: dept_name_grade, predicate: disjoint_only },
    MergeStage { tag: "5a", key: dept_base_name, predicate: same_numeral_same_number },
    MergeStage { tag: "5b", key: dept_base_name, predicate: same_numeral_last_digit_differs },
    MergeStage { tag: "5c", key: dept_base_name, predicate: same_numeral_tail_differs },
    MergeStage { tag: "5d", key: dept_base_name, predicate: same_numeral_same_grade },
    MergeStage { tag: "5e", key: dept_base_name, predicate: numerals_differ },
    MergeStage { tag: "6", key: code_only, predicate: disjoint_only },
    MergeStage { tag: "7", key: name_and_number, predicate: departments_differ },
];

pub const SEQUENTIAL_TAG: &str = "3";

enum Slot {
    PassThrough(CourseGroup),
    Bucket(Vec<CourseGroup>),
}

/// Bucket by `key`, keeping first-seen slot order. Groups with a missing key
/// component get a pass-through slot of their own.
fn bucket_groups(groups: Vec<CourseGroup>, key: BucketKeyFn) -> Vec<Slot> {
    let mut slots: Vec<Slot> = Vec::new();
    let mut slot_of: HashMap<Vec<KeyPart>, usize> = HashMap::new();
    for group in groups {
        let parts = key(group.representative());
        if parts.iter().any(KeyPart::is_missing) {
            slots.push(Slot::PassThrough(group));
            continue;
        }
        match slot_of.entry(parts) {
            Entry::Occupied(entry) => {
                if let Slot::Bucket(bucket) = &mut slots[*entry.get()] {
                    bucket.push(group);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(slots.len());
                slots.push(Slot::Bucket(vec![group]));
            }
        }
    }
    slots
}

fn unbucket(slots: Vec<Slot>, mut merge: impl FnMut(Vec<CourseGroup>) -> Vec<CourseGroup>) -> Vec<CourseGroup> {
    let mut out = Vec::new();
    for slot in slots {
        match slot {
            Slot::PassThrough(group) => out.push(group),
            Slot::Bucket(bucket) if bucket.len() < 2 => out.extend(bucket),
            Slot::Bucket(bucket) => out.extend(merge(bucket)),
        }
    }
    out
}

/// Scan pairs until a full pass merges nothing. Group `i` may absorb several
/// later groups in one pass; its representative and year set follow along.
fn merge_bucket(bucket: Vec<CourseGroup>, tag: &str, predicate: MergePredicate) -> (Vec<CourseGroup>, usize) {
    let mut bucket = bucket;
    let mut merges = 0;
    loop {
        let mut merged_in_pass = false;
        let mut slots: Vec<Option<CourseGroup>> = bucket.into_iter().map(Some).collect();

        for i in 0..slots.len() {
            let Some(mut group_a) = slots[i].take() else {
                continue;
            };
            let mut years_a = group_a.years();
            for j in (i + 1)..slots.len() {
                let Some(group_b) = slots[j].as_ref() else {
                    continue;
                };
                let years_b = group_b.years();
                let accepted = predicate(&PairView {
                    rep_a: group_a.representative(),
                    earliest_b: group_b.earliest(),
                    years_a: &years_a,
                    years_b: &years_b,
                });
                if !accepted {
                    continue;
                }
                if let Some(group_b) = slots[j].take() {
                    debug!(
                        stage = tag,
                        into = %group_a.representative().code,
                        from = %group_b.representative().code,
                        "merging groups"
                    );
                    group_a.absorb(group_b, tag);
                    years_a.extend(years_b);
                    merges += 1;
                    merged_in_pass = true;
                }
            }
            slots[i] = Some(group_a);
        }

        bucket = slots.into_iter().flatten().collect();
        if !merged_in_pass {
            return (bucket, merges);
        }
    }
}

/// Run one bucketed merge stage over `groups`.
pub fn merge_within_buckets(groups: Vec<CourseGroup>, stage: &MergeStage, log: &mut MergeLog) -> Vec<CourseGroup> {
    let span = info_span!("merge_stage", stage = stage.tag);
    let _entered = span.enter();

    let groups_in = groups.len();
    let mut merges = 0;
    let out = unbucket(bucket_groups(groups, stage.key), |bucket| {
        let (merged, count) = merge_bucket(bucket, stage.tag, stage.predicate);
        merges += count;
        merged
    });

    record_stage(log, stage.tag, groups_in, &out);
    info!(groups_in, groups_out = out.len(), merges, "merge stage complete");
    out
}

fn numeral_rank(group: &CourseGroup) -> u8 {
    roman_rank(group.representative().roman_numeral()).unwrap_or(99)
}

/// Numbered course sequences: "Connections I" then "Connections II" a year later.
fn merge_sequential_bucket(bucket: Vec<CourseGroup>) -> (Vec<CourseGroup>, usize) {
    let mut bucket = bucket;
    let mut merges = 0;
    loop {
        bucket.sort_by_key(numeral_rank);
        let mut merged_in_pass = false;
        let mut slots: Vec<Option<CourseGroup>> = bucket.into_iter().map(Some).collect();

        for i in 0..slots.len() {
            let Some(mut group_a) = slots[i].take() else {
                continue;
            };
            if let Some(rank_a) = roman_rank(group_a.representative().roman_numeral()) {
                let years_a = group_a.years();
                for j in (i + 1)..slots.len() {
                    let Some(group_b) = slots[j].as_ref() else {
                        continue;
                    };
                    let (rep_a, rep_b) = (group_a.representative(), group_b.representative());
                    let Some(rank_b) = roman_rank(rep_b.roman_numeral()) else {
                        continue;
                    };
                    let gap = rep_b.parsed_year - rep_a.parsed_year;
                    let sequential = rank_b == rank_a + 1 && gap > 0 && gap <= 1;
                    if !sequential || !years_a.is_disjoint(&group_b.years()) {
                        continue;
                    }
                    if let Some(group_b) = slots[j].take() {
                        group_a.absorb(group_b, SEQUENTIAL_TAG);
                        merges += 1;
                        merged_in_pass = true;
                        break;
                    }
                }
            }
            slots[i] = Some(group_a);
        }

        bucket = slots.into_iter().flatten().collect();
        if !merged_in_pass {
            return (bucket, merges);
        }
    }
}

/// Stage 3: merge adjacent roman numerals within (department, base name).
pub fn merge_sequential_numerals(groups: Vec<CourseGroup>, log: &mut MergeLog) -> Vec<CourseGroup> {
    let span = info_span!("merge_stage", stage = SEQUENTIAL_TAG);
    let _entered = span.enter();

    let groups_in = groups.len();
    let mut merges = 0;
    let out = unbucket(bucket_groups(groups, dept_base_name), |bucket| {
        let (merged, count) = merge_sequential_bucket(bucket);
        merges += count;
        merged
    });

    record_stage(log, SEQUENTIAL_TAG, groups_in, &out);
    info!(groups_in, groups_out = out.len(), merges, "merge stage complete");
    out
}

/// Stage 3 followed by every entry of [`MERGE_STAGES`].
pub fn run_merge_stages(groups: Vec<CourseGroup>, log: &mut MergeLog) -> Vec<CourseGroup> {
    let mut groups = merge_sequential_numerals(groups, log);
    for stage in &MERGE_STAGES {
        groups = merge_within_buckets(groups, stage, log);
    }
    groups
}

fn record_stage(log: &mut MergeLog, tag: &str, groups_in: usize, out: &[CourseGroup]) {
    let merged = out
        .iter()
        .filter(|group| group.has_member_tagged(tag))
        .map(CourseGroup::member_indices)
        .collect();
    log.push(StageRecord {
        tag: tag.to_string(),
        groups_in,
        groups_out: out.len(),
        merged,
    });
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

    fn singletons(records: Vec<CatalogRecord>) -> Vec<CourseGroup> {
        records.into_iter().map(CourseGroup::singleton).collect()
    }

    fn shapes(groups: &[CourseGroup]) -> Vec<Vec<usize>> {
        let mut out: Vec<Vec<usize>> = groups
            .iter()
            .map(|g| {
                let mut idx = g.member_indices();
                idx.sort_unstable();
                idx
            })
            .collect();
        out.sort();
        out
    }

    fn stage(tag: &str) -> MergeStage {
        *MERGE_STAGES.iter().find(|s| s.tag == tag).expect("known stage")
    }

    #[test]
    fn sequential_numerals_merge_adjacent_years() {
        let groups = singletons(vec![
            mk_record(0, "UCRS 1000", "Connections I", "2020-2021"),
            mk_record(1, "UCRS 1001", "Connections II", "2021-2022"),
        ]);
        let mut log = MergeLog::default();
        let out = merge_sequential_numerals(groups, &mut log);
        assert_eq!(shapes(&out), vec![vec![0, 1]]);
        assert!(out[0].members().iter().all(|r| r.match_method == "3"));
        assert_eq!(log.stage("3").map(|s| s.merged.len()), Some(1));
    }

    #[test]
    fn sequential_numerals_skip_non_adjacent_numerals() {
        let groups = singletons(vec![
            mk_record(0, "UCRS 1000", "Connections I", "2020-2021"),
            mk_record(1, "UCRS 1002", "Connections III", "2022-2023"),
        ]);
        let out = merge_sequential_numerals(groups, &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0], vec![1]]);
    }

    #[test]
    fn sequential_numerals_require_the_later_numeral_to_be_newer() {
        let groups = singletons(vec![
            mk_record(0, "UCRS 1000", "Connections I", "2021-2022"),
            mk_record(1, "UCRS 1001", "Connections II", "2021-2022"),
            mk_record(2, "UCRS 1002", "Connections III", "2019-2020"),
        ]);
        let out = merge_sequential_numerals(groups, &mut MergeLog::default());
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn sequential_chain_links_after_resort() {
        let groups = singletons(vec![
            mk_record(0, "UCRS 1002", "Connections III", "2022-2023"),
            mk_record(1, "UCRS 1000", "Connections I", "2020-2021"),
            mk_record(2, "UCRS 1001", "Connections II", "2021-2022"),
        ]);
        let out = merge_sequential_numerals(groups, &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn changed_codes_merge_only_when_years_are_disjoint() {
        let groups = singletons(vec![
            mk_record(0, "BIOL 1710", "Biology for Majors", "2019-2020"),
            mk_record(1, "BIOL 1720", "Biology for Majors", "2021-2022"),
            mk_record(2, "BIOL 1730", "Biology for Majors", "2021-2022"),
        ]);
        let mut log = MergeLog::default();
        let out = merge_within_buckets(groups, &stage("4"), &mut log);
        for group in &out {
            let years: Vec<i32> = group.members().iter().map(|r| r.parsed_year).collect();
            let unique: BTreeSet<i32> = years.iter().copied().collect();
            assert_eq!(years.len(), unique.len());
        }
        assert_eq!(shapes(&out), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn chains_grow_within_one_pass() {
        let groups = singletons(vec![
            mk_record(0, "BIOL 1710", "Biology for Majors", "2019-2020"),
            mk_record(1, "BIOL 1720", "Biology for Majors", "2020-2021"),
            mk_record(2, "BIOL 1730", "Biology for Majors", "2021-2022"),
        ]);
        let out = merge_within_buckets(groups, &stage("4"), &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn missing_key_groups_pass_through_in_slot_order() {
        let groups = singletons(vec![
            mk_record(0, "BIOL 1710", "Biology", "2019-2020"),
            mk_record(1, "", "Unknown", "2020-2021"),
            mk_record(2, "BIOL 1720", "Biology", "2021-2022"),
        ]);
        let out = merge_within_buckets(groups, &stage("4"), &mut MergeLog::default());
        let order: Vec<Vec<usize>> = out.iter().map(CourseGroup::member_indices).collect();
        assert_eq!(order, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn successive_broadening_predicates() {
        let a = mk_record(0, "CHEM 1410", "General Chemistry I", "2019-2020");
        let years_a: BTreeSet<i32> = [2019].into_iter().collect();
        let years_b: BTreeSet<i32> = [2021].into_iter().collect();
        let check = |pred: MergePredicate, b: &CatalogRecord| {
            pred(&PairView {
                rep_a: &a,
                earliest_b: b,
                years_a: &years_a,
                years_b: &years_b,
            })
        };

        let same = mk_record(1, "CHEM 1410", "General Chemistry I", "2021-2022");
        let last_digit = mk_record(2, "CHEM 1411", "General Chemistry I", "2021-2022");
        let tail = mk_record(3, "CHEM 1420", "General Chemistry I", "2021-2022");
        let grade = mk_record(4, "CHEM 1510", "General Chemistry I", "2021-2022");
        let other_numeral = mk_record(5, "CHEM 1420", "General Chemistry II", "2021-2022");

        assert!(check(same_numeral_same_number, &same));
        assert!(!check(same_numeral_same_number, &last_digit));
        assert!(check(same_numeral_last_digit_differs, &last_digit));
        assert!(!check(same_numeral_last_digit_differs, &tail));
        assert!(check(same_numeral_tail_differs, &tail));
        assert!(!check(same_numeral_tail_differs, &grade));
        assert!(check(same_numeral_same_grade, &grade));
        assert!(!check(same_numeral_same_grade, &same));
        assert!(check(numerals_differ, &other_numeral));
        assert!(!check(numerals_differ, &grade));

        let overlapping: BTreeSet<i32> = [2019].into_iter().collect();
        assert!(!same_numeral_same_number(&PairView {
            rep_a: &a,
            earliest_b: &same,
            years_a: &years_a,
            years_b: &overlapping,
        }));
    }

    #[test]
    fn renumbered_section_merges_on_last_digit_within_the_bucket() {
        let groups = singletons(vec![
            mk_record(0, "CHEM 1410", "General Chemistry I", "2019-2020"),
            mk_record(1, "CHEM 1411", "General Chemistry I", "2021-2022"),
            mk_record(2, "CHEM 1420", "General Chemistry I", "2022-2023"),
        ]);
        let mut log = MergeLog::default();
        let out = merge_within_buckets(groups, &stage("5b"), &mut log);

        assert_eq!(shapes(&out), vec![vec![0, 1], vec![2]]);
        let merged = out.iter().find(|g| g.len() == 2).expect("merged group");
        assert!(merged.members().iter().all(|r| r.match_method == "5b"));
        let untouched = out.iter().find(|g| g.len() == 1).expect("untouched group");
        assert!(untouched.members()[0].match_method.is_empty());
        assert_eq!(log.stage("5b").map(|s| s.merged.len()), Some(1));
    }

    #[test]
    fn retitled_course_merges_on_code_when_years_are_disjoint() {
        let groups = singletons(vec![
            mk_record(0, "HIST 2610", "United States History to 1865", "2019-2020"),
            mk_record(1, "HIST 2610", "US History I", "2021-2022"),
        ]);
        let out = merge_within_buckets(groups, &stage("6"), &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0, 1]]);
        assert!(out[0].members().iter().all(|r| r.match_method == "6"));

        let overlapping = singletons(vec![
            mk_record(0, "HIST 2610", "United States History to 1865", "2021-2022"),
            mk_record(1, "HIST 2610", "US History I", "2021-2022"),
        ]);
        let out = merge_within_buckets(overlapping, &stage("6"), &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0], vec![1]]);
    }

    #[test]
    fn cross_department_merge_needs_different_departments() {
        let groups = singletons(vec![
            mk_record(0, "CSCE 3600", "Systems Programming", "2019-2020"),
            mk_record(1, "CENG 3600", "Systems Programming", "2021-2022"),
        ]);
        let out = merge_within_buckets(groups, &stage("7"), &mut MergeLog::default());
        assert_eq!(shapes(&out), vec![vec![0, 1]]);

        let same_dept = singletons(vec![
            mk_record(0, "CSCE 3600", "Systems Programming", "2019-2020"),
            mk_record(1, "CSCE 3600", "Systems Programming", "2021-2022"),
        ]);
        let out = merge_within_buckets(same_dept, &stage("7"), &mut MergeLog::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn full_cascade_logs_every_stage() {
        let groups = singletons(vec![
            mk_record(0, "UCRS 1000", "Connections I", "2020-2021"),
            mk_record(1, "UCRS 1001", "Connections II", "2021-2022"),
        ]);
        let mut log = MergeLog::default();
        let out = run_merge_stages(groups, &mut log);
        assert_eq!(out.len(), 1);
        let tags: Vec<&str> = log.stages.iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, vec!["3", "4", "5a", "5b", "5c", "5d", "5e", "6", "7"]);
    }
}
