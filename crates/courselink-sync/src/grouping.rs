//! Course groups and the exact-key initial grouping pass.

use std::collections::{BTreeSet, HashMap};

use courselink_core::{CatalogRecord, MISSING};
use serde::Serialize;

/// Catalog records believed to be the same course across years.
///
/// Never empty. Members are owned: merging moves records between groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseGroup {
    members: Vec<CatalogRecord>,
}

impl CourseGroup {
    pub fn singleton(record: CatalogRecord) -> Self {
        Self {
            members: vec![record],
        }
    }

    pub fn from_members(members: Vec<CatalogRecord>) -> Option<Self> {
        if members.is_empty() {
            None
        } else {
            Some(Self { members })
        }
    }

    pub fn members(&self) -> &[CatalogRecord] {
        &self.members
    }

    pub fn into_members(self) -> Vec<CatalogRecord> {
        self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Most recent member; the first one wins a tie.
    pub fn representative(&self) -> &CatalogRecord {
        let mut best = &self.members[0];
        for rec in &self.members[1..] {
            if rec.parsed_year > best.parsed_year {
                best = rec;
            }
        }
        best
    }

    /// Oldest member; the first one wins a tie.
    pub fn earliest(&self) -> &CatalogRecord {
        let mut best = &self.members[0];
        for rec in &self.members[1..] {
            if rec.parsed_year < best.parsed_year {
                best = rec;
            }
        }
        best
    }

    /// Known catalog years of the members.
    pub fn years(&self) -> BTreeSet<i32> {
        self.members
            .iter()
            .map(|rec| rec.parsed_year)
            .filter(|year| *year != MISSING)
            .collect()
    }

    pub fn retag(&mut self, tag: &str) {
        for rec in &mut self.members {
            rec.match_method = tag.to_string();
        }
    }

    /// Move every member of `other` into this group, tagging both sides.
    pub fn absorb(&mut self, mut other: CourseGroup, tag: &str) {
        self.retag(tag);
        other.retag(tag);
        self.members.append(&mut other.members);
    }

    pub fn member_indices(&self) -> Vec<usize> {
        self.members.iter().map(|rec| rec.original_index).collect()
    }

    pub(crate) fn has_member_tagged(&self, tag: &str) -> bool {
        self.members.iter().any(|rec| rec.match_method == tag)
    }

    pub(crate) fn members_mut(&mut self) -> &mut Vec<CatalogRecord> {
        &mut self.members
    }
}

/// What one grouping or merge stage did, for the audit tables and run brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub tag: String,
    pub groups_in: usize,
    pub groups_out: usize,
    /// Member `original_index` lists of the groups this stage formed or enlarged.
    pub merged: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeLog {
    pub stages: Vec<StageRecord>,
}

impl MergeLog {
    pub fn push(&mut self, record: StageRecord) {
        self.stages.push(record);
    }

    pub fn stage(&self, tag: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.tag == tag)
    }
}

type KeyFn = fn(&CatalogRecord) -> Option<(String, String)>;

fn code_and_name(rec: &CatalogRecord) -> Option<(String, String)> {
    (!rec.code.is_empty() && !rec.name.is_empty()).then(|| (rec.code.clone(), rec.name.clone()))
}

fn code_and_normalized_name(rec: &CatalogRecord) -> Option<(String, String)> {
    (!rec.code.is_empty() && !rec.normalized_name.is_empty())
        .then(|| (rec.code.clone(), rec.normalized_name.clone()))
}

const INITIAL_STRATEGIES: [(&str, KeyFn); 2] = [("1", code_and_name), ("2", code_and_normalized_name)];

/// Partition records by exact keys, then give every unclaimed record its own group.
///
/// Strategy groups come first in key first-seen order, then singletons in
/// input order. Singletons keep an empty tag.
pub fn initial_grouping(records: Vec<CatalogRecord>, log: &mut MergeLog) -> Vec<CourseGroup> {
    let mut pool: Vec<Option<CatalogRecord>> = records.into_iter().map(Some).collect();
    let mut groups = Vec::new();

    // Unclaimed records count as one group each on both sides of a stage.
    let unclaimed = |pool: &[Option<CatalogRecord>]| pool.iter().flatten().count();
    for (tag, key_fn) in INITIAL_STRATEGIES {
        let groups_in = groups.len() + unclaimed(&pool);
        let mut order: Vec<Vec<usize>> = Vec::new();
        let mut slot_of: HashMap<(String, String), usize> = HashMap::new();
        for (idx, rec) in pool.iter().enumerate() {
            let Some(key) = rec.as_ref().and_then(key_fn) else {
                continue;
            };
            let slot = *slot_of.entry(key).or_insert_with(|| {
                order.push(Vec::new());
                order.len() - 1
            });
            order[slot].push(idx);
        }

        let mut merged = Vec::new();
        for indices in order {
            let members: Vec<CatalogRecord> = indices
                .into_iter()
                .filter_map(|idx| pool[idx].take())
                .collect();
            if let Some(mut group) = CourseGroup::from_members(members) {
                group.retag(tag);
                merged.push(group.member_indices());
                groups.push(group);
            }
        }
        log.push(StageRecord {
            tag: tag.to_string(),
            groups_in,
            groups_out: groups.len() + unclaimed(&pool),
            merged,
        });
    }

    groups.extend(pool.into_iter().flatten().map(CourseGroup::singleton));
    groups
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

    #[test]
    fn representative_and_earliest_break_ties_by_member_order() {
        let group = CourseGroup::from_members(vec![
            mk_record(0, "ENGL 1310", "College Writing I", "2021-2022"),
            mk_record(1, "ENGL 1310", "College Writing I", "2023-2024"),
            mk_record(2, "ENGL 1311", "College Writing I", "2023-2024"),
            mk_record(3, "ENGL 1312", "College Writing I", "2019-2020"),
            mk_record(4, "ENGL 1313", "College Writing I", "2019-2020"),
        ])
        .expect("non-empty");

        assert_eq!(group.representative().original_index, 1);
        assert_eq!(group.earliest().original_index, 3);
    }

    #[test]
    fn year_set_skips_unknown_years() {
        let group = CourseGroup::from_members(vec![
            mk_record(0, "ENGL 1310", "College Writing I", "2021-2022"),
            mk_record(1, "ENGL 1310", "College Writing I", ""),
        ])
        .expect("non-empty");
        assert_eq!(group.years().into_iter().collect::<Vec<_>>(), vec![2021]);
        assert!(CourseGroup::from_members(Vec::new()).is_none());
    }

    #[test]
    fn exact_code_and_name_groups_then_singletons() {
        let records = vec![
            mk_record(0, "ENGL 1310", "College Writing I", "2020-2021"),
            mk_record(1, "MATH 1710", "Calculus I", "2020-2021"),
            mk_record(2, "ENGL 1310", "College Writing I", "2021-2022"),
            mk_record(3, "", "Orphan Listing", "2021-2022"),
            mk_record(4, "HIST 2610", "", "2021-2022"),
        ];
        let mut log = MergeLog::default();
        let groups = initial_grouping(records, &mut log);

        let shapes: Vec<Vec<usize>> = groups.iter().map(CourseGroup::member_indices).collect();
        assert_eq!(shapes, vec![vec![0, 2], vec![1], vec![3], vec![4]]);
        assert_eq!(groups[0].members()[0].match_method, "1");
        assert!(groups[2].members()[0].match_method.is_empty());
        assert_eq!(log.stage("1").map(|s| s.merged.len()), Some(2));
        assert_eq!(log.stage("2").map(|s| s.merged.len()), Some(0));
    }

    #[test]
    fn initial_stage_counts_treat_unclaimed_records_as_groups() {
        let records = vec![
            mk_record(0, "ENGL 1310", "College Writing I", "2020-2021"),
            mk_record(1, "ENGL 1310", "College Writing I", "2021-2022"),
            mk_record(2, "MATH 1710", "Calculus I", "2020-2021"),
            mk_record(3, "", "Orphan Listing", "2021-2022"),
            mk_record(4, "HIST 2610", "", "2021-2022"),
        ];
        let mut log = MergeLog::default();
        let groups = initial_grouping(records, &mut log);
        assert_eq!(groups.len(), 4);

        let first = log.stage("1").expect("stage 1");
        assert_eq!((first.groups_in, first.groups_out), (5, 4));
        let second = log.stage("2").expect("stage 2");
        assert_eq!((second.groups_in, second.groups_out), (4, 4));
    }

    #[test]
    fn absorb_moves_members_and_retags_both_sides() {
        let mut a = CourseGroup::singleton(mk_record(0, "ENGL 1310", "College Writing I", "2020-2021"));
        let b = CourseGroup::singleton(mk_record(1, "ENGL 1311", "College Writing I", "2021-2022"));
        a.absorb(b, "4");
        assert_eq!(a.member_indices(), vec![0, 1]);
        assert!(a.members().iter().all(|rec| rec.match_method == "4"));
    }
}
