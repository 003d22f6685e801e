//! Same-year conflict resolution and group id assignment.

use std::collections::HashMap;

use courselink_core::{CatalogRecord, ConflictRecord, MISSING};
use tracing::info;

use crate::grouping::CourseGroup;

pub const CONFLICT_TAG: &str = "8";

#[derive(Debug, Clone, Default)]
pub struct Finalized {
    pub groups: Vec<CourseGroup>,
    pub conflicts: Vec<ConflictRecord>,
    /// Losers of a same-year conflict, tagged "8" and left ungrouped.
    pub removed: Vec<CatalogRecord>,
}

/// Keep one member per known year in every group: the lowest `original_index`.
///
/// Members with an unknown year cannot collide and stay where they are.
/// Surviving members are ordered newest first.
pub fn resolve_conflicts(groups: Vec<CourseGroup>) -> Finalized {
    let mut out = Finalized::default();

    for group in groups {
        let mut kept: Vec<CatalogRecord> = Vec::with_capacity(group.len());
        let mut by_year: Vec<(i32, Vec<CatalogRecord>)> = Vec::new();
        let mut year_slot: HashMap<i32, usize> = HashMap::new();

        for rec in group.into_members() {
            if rec.parsed_year == MISSING {
                kept.push(rec);
                continue;
            }
            let slot = *year_slot.entry(rec.parsed_year).or_insert_with(|| {
                by_year.push((rec.parsed_year, Vec::new()));
                by_year.len() - 1
            });
            by_year[slot].1.push(rec);
        }

        for (year, mut same_year) in by_year {
            same_year.sort_by_key(|rec| rec.original_index);
            let mut same_year = same_year.into_iter();
            let Some(winner) = same_year.next() else {
                continue;
            };
            for mut loser in same_year {
                loser.match_method = CONFLICT_TAG.to_string();
                out.conflicts.push(ConflictRecord {
                    method: CONFLICT_TAG.to_string(),
                    year,
                    kept_code: winner.code.clone(),
                    kept_name: winner.name.clone(),
                    kept_link: winner.row.course_link.clone(),
                    removed_code: loser.code.clone(),
                    removed_name: loser.name.clone(),
                    removed_link: loser.row.course_link.clone(),
                });
                out.removed.push(loser);
            }
            kept.push(winner);
        }

        kept.sort_by(|a, b| b.parsed_year.cmp(&a.parsed_year));
        if let Some(group) = CourseGroup::from_members(kept) {
            out.groups.push(group);
        }
    }

    info!(
        groups = out.groups.len(),
        conflicts = out.conflicts.len(),
        "conflict resolution complete"
    );
    out
}

/// Order groups by their representative's (code, name) and number them from 0.
///
/// The sort is stable, so identical input always yields identical ids.
pub fn assign_group_ids(groups: &mut [CourseGroup]) {
    groups.sort_by(|a, b| {
        let (ra, rb) = (a.representative(), b.representative());
        (ra.code.as_str(), ra.name.as_str()).cmp(&(rb.code.as_str(), rb.name.as_str()))
    });
    for (id, group) in groups.iter_mut().enumerate() {
        for rec in group.members_mut() {
            rec.group_id = id as i64;
        }
    }
}

/// Flatten grouped and removed records back into load order.
pub fn flatten_catalog(groups: Vec<CourseGroup>, removed: Vec<CatalogRecord>) -> Vec<CatalogRecord> {
    let mut all: Vec<CatalogRecord> = groups
        .into_iter()
        .flat_map(CourseGroup::into_members)
        .chain(removed)
        .collect();
    all.sort_by_key(|rec| rec.original_index);
    all
}
