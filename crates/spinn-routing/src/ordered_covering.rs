// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered covering minimisation.
//!
//! The table is kept sorted by increasing generality, which is also the
//! order the router checks entries in. Each step takes the group of entries
//! sharing a route that can be replaced by the largest single merged entry,
//! removes them and inserts the merged entry after every entry that is no
//! more general than it.
//!
//! Moving entries changes which entry a key hits first, so every candidate
//! merge is refined before it is applied:
//!
//! - **up-check**: a member that would slide past an intersecting entry on
//!   its way down to the insertion point is dropped from the merge.
//! - **down-check**: the merged entry must not capture keys that entries
//!   below it are responsible for. Those keys are tracked through *aliases*,
//!   the original key/mask pairs each merged entry stands for. Offending
//!   members are removed, choosing the split that keeps the most entries.
//!
//! ```text
//!   0000 -> N        0010 -> S  (001X)
//!   0001 -> N   =>   000X -> N
//!   001X -> S
//! ```
//!
//! The search is greedy and has no optimality guarantee; when the target is
//! out of reach the caller gets [`RoutingError::MinimisationFailed`].

use std::collections::{BTreeMap, BTreeSet};

use spinn_chip::RouteSet;
use tracing::debug;

use crate::entry::{generality, intersect, RoutingTableEntry};
use crate::error::{Result, RoutingError};
use crate::remove_default_routes;

/// Map from an entry's `(key, mask)` to the original `(key, mask)` pairs it
/// was merged from. Entries absent from the map stand only for themselves.
pub type Aliases = BTreeMap<(u32, u32), BTreeSet<(u32, u32)>>;

/// Minimise with ordered covering, optionally finishing with default-route
/// elision.
///
/// # Errors
///
/// [`RoutingError::MinimisationFailed`] if the result is longer than
/// `target_length`.
pub fn minimise(
    table: &[RoutingTableEntry],
    target_length: Option<usize>,
    default_routing: bool,
) -> Result<Vec<RoutingTableEntry>> {
    let (table, _) = ordered_covering(table, target_length, Aliases::new(), true)?;
    if default_routing {
        return remove_default_routes::minimise(&table, target_length);
    }
    match target_length {
        Some(target) if table.len() > target => {
            Err(RoutingError::minimisation_failed(target, table.len()))
        }
        _ => Ok(table),
    }
}

/// Core ordered-covering loop.
///
/// Merges until the table is no longer than `target_length` (or until no
/// merge is possible when `target_length` is `None`). The updated alias map
/// is returned alongside the table.
///
/// # Errors
///
/// [`RoutingError::MinimisationFailed`] when the target is missed and
/// `no_raise` is false.
pub fn ordered_covering(
    routing_table: &[RoutingTableEntry],
    target_length: Option<usize>,
    aliases: Aliases,
    no_raise: bool,
) -> Result<(Vec<RoutingTableEntry>, Aliases)> {
    let mut table = routing_table.to_vec();
    table.sort_by_key(RoutingTableEntry::generality);
    let mut aliases = aliases;

    while target_length.map_or(true, |target| table.len() > target) {
        let merge = get_best_merge(&table, &aliases);
        if merge.goodness() == 0 {
            break;
        }
        debug!(
            entries = merge.entries.len(),
            key = format_args!("{:#010x}", merge.key),
            mask = format_args!("{:#010x}", merge.mask),
            "Applying merge"
        );
        (table, aliases) = merge.apply(&table, aliases);
    }

    if let Some(target) = target_length {
        if !no_raise && table.len() > target {
            return Err(RoutingError::minimisation_failed(target, table.len()));
        }
    }
    Ok((table, aliases))
}

/// Position a new entry of the given generality is inserted at: after every
/// entry that is no more general.
pub(crate) fn get_insertion_index(table: &[RoutingTableEntry], generality: u32) -> usize {
    table
        .iter()
        .position(|e| e.generality() > generality)
        .unwrap_or(table.len())
}

/// A set of entries to be replaced by one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Merge {
    pub(crate) entries: BTreeSet<usize>,
    pub(crate) key: u32,
    pub(crate) mask: u32,
    pub(crate) generality: u32,
    pub(crate) insertion_index: usize,
}

impl Merge {
    pub(crate) fn new(table: &[RoutingTableEntry], entries: BTreeSet<usize>) -> Self {
        let mut any_ones = 0u32;
        let mut all_ones = u32::MAX;
        let mut all_selected = u32::MAX;
        for &i in &entries {
            let e = &table[i];
            any_ones |= e.key;
            all_ones &= e.key;
            all_selected &= e.mask;
        }
        // Bits where the keys disagree become Xs.
        let any_zeros = !all_ones;
        let new_xs = any_ones ^ any_zeros;
        let mask = all_selected & new_xs;
        let key = all_ones & mask;
        let generality = generality(key, mask);

        Self {
            entries,
            key,
            mask,
            generality,
            insertion_index: get_insertion_index(table, generality),
        }
    }

    pub(crate) fn empty(table: &[RoutingTableEntry]) -> Self {
        Self::new(table, BTreeSet::new())
    }

    /// Number of entries saved by applying the merge.
    pub(crate) fn goodness(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    fn without(&self, table: &[RoutingTableEntry], index: usize) -> Self {
        let mut entries = self.entries.clone();
        entries.remove(&index);
        Self::new(table, entries)
    }

    /// Produce the table and aliases with the merge applied.
    pub(crate) fn apply(
        &self,
        table: &[RoutingTableEntry],
        mut aliases: Aliases,
    ) -> (Vec<RoutingTableEntry>, Aliases) {
        let route = self
            .entries
            .first()
            .map_or(RouteSet::empty(), |&i| table[i].route);
        let sources = self
            .entries
            .iter()
            .fold(RouteSet::empty(), |acc, &i| acc.union(table[i].sources));
        let merged = RoutingTableEntry::new(route, self.key, self.mask).with_sources(sources);

        let mut new_table = Vec::with_capacity(table.len() + 1 - self.entries.len().min(table.len()));
        let mut inserted = false;
        for (i, entry) in table.iter().enumerate() {
            if !inserted && i >= self.insertion_index {
                new_table.push(merged);
                inserted = true;
            }
            if !self.entries.contains(&i) {
                new_table.push(*entry);
            }
        }
        if !inserted {
            new_table.push(merged);
        }

        let mut merged_aliases = BTreeSet::new();
        for &i in &self.entries {
            let pair = (table[i].key, table[i].mask);
            match aliases.remove(&pair) {
                Some(set) => merged_aliases.extend(set),
                None => {
                    merged_aliases.insert(pair);
                }
            }
        }
        aliases.insert((self.key, self.mask), merged_aliases);

        (new_table, aliases)
    }
}

/// Every group of two or more entries sharing a route, in table order.
pub(crate) fn get_all_merges(table: &[RoutingTableEntry]) -> Vec<Merge> {
    let mut considered = vec![false; table.len()];
    let mut merges = Vec::new();
    for i in 0..table.len() {
        if considered[i] {
            continue;
        }
        considered[i] = true;
        let route = table[i].route;
        let mut entries = BTreeSet::from([i]);
        for j in (i + 1)..table.len() {
            if table[j].route == route {
                considered[j] = true;
                entries.insert(j);
            }
        }
        if entries.len() > 1 {
            merges.push(Merge::new(table, entries));
        }
    }
    merges
}

/// Largest legal merge; ties go to the group appearing first in the table.
pub(crate) fn get_best_merge(table: &[RoutingTableEntry], aliases: &Aliases) -> Merge {
    let mut best = Merge::empty(table);
    let mut best_goodness = 0;
    for merge in get_all_merges(table) {
        if merge.goodness() <= best_goodness {
            continue;
        }
        let merge = refine_merge(table, merge, aliases, best_goodness);
        if merge.goodness() > best_goodness {
            best_goodness = merge.goodness();
            best = merge;
        }
    }
    best
}

/// Shrink a merge until applying it cannot change any resolved route.
pub(crate) fn refine_merge(
    table: &[RoutingTableEntry],
    merge: Merge,
    aliases: &Aliases,
    min_goodness: usize,
) -> Merge {
    let mut merge = refine_downcheck(table, merge, aliases, min_goodness);
    if merge.goodness() > min_goodness {
        let (upchecked, changed) = refine_upcheck(table, merge, min_goodness);
        merge = upchecked;
        if changed && merge.goodness() > min_goodness {
            merge = refine_downcheck(table, merge, aliases, min_goodness);
        }
    }
    merge
}

fn refine_upcheck(table: &[RoutingTableEntry], merge: Merge, min_goodness: usize) -> (Merge, bool) {
    let mut merge = merge;
    let mut changed = false;
    let members: Vec<usize> = merge.entries.iter().rev().copied().collect();
    for i in members {
        let entry = &table[i];
        let end = merge.insertion_index;
        let blocked = end > i + 1 && table[i + 1..end].iter().any(|o| entry.intersects(o));
        if blocked {
            merge = merge.without(table, i);
            changed = true;
            if merge.goodness() <= min_goodness {
                merge = Merge::empty(table);
                break;
            }
        }
    }
    (merge, changed)
}

/// Original key/mask pairs, owned by entries at or below the insertion
/// point, that the merged entry would capture.
fn covered_aliases(table: &[RoutingTableEntry], merge: &Merge, aliases: &Aliases) -> Vec<(u32, u32)> {
    let mut covered = Vec::new();
    for entry in table.iter().skip(merge.insertion_index) {
        if !intersect(merge.key, merge.mask, entry.key, entry.mask) {
            continue;
        }
        let pair = (entry.key, entry.mask);
        match aliases.get(&pair) {
            Some(set) => covered.extend(
                set.iter()
                    .copied()
                    .filter(|&(k, m)| intersect(merge.key, merge.mask, k, m)),
            ),
            None => covered.push(pair),
        }
    }
    covered
}

fn refine_downcheck(
    table: &[RoutingTableEntry],
    merge: Merge,
    aliases: &Aliases,
    min_goodness: usize,
) -> Merge {
    let mut merge = merge;
    let mut covered = covered_aliases(table, &merge, aliases);

    while !covered.is_empty() && merge.goodness() > min_goodness {
        // Only the aliases with fewest settable bits constrain the choice.
        let mut best_stringency: Option<u32> = None;
        let mut options: Vec<(u32, bool)> = Vec::new();
        for &(key, mask) in &covered {
            let settable = mask & !merge.mask;
            let stringency = settable.count_ones();
            if best_stringency.map_or(true, |best| stringency < best) {
                best_stringency = Some(stringency);
                options.clear();
            }
            if best_stringency == Some(stringency) {
                options.extend(
                    (0..32)
                        .map(|i| 1u32 << i)
                        .filter(|bit| settable & bit != 0)
                        .map(|bit| (bit, key & bit != 0)),
                );
            }
        }
        if best_stringency == Some(0) {
            return Merge::empty(table);
        }

        // Setting `bit` to the opposite of the alias excludes it; keep the
        // members that already have that value.
        let mut best_entries: Option<BTreeSet<usize>> = None;
        for (bit, alias_value) in options {
            let entries: BTreeSet<usize> = merge
                .entries
                .iter()
                .copied()
                .filter(|&i| {
                    let e = &table[i];
                    e.mask & bit != 0 && (e.key & bit != 0) != alias_value
                })
                .collect();
            if best_entries.as_ref().map_or(true, |best| entries.len() > best.len()) {
                best_entries = Some(entries);
            }
        }

        merge = Merge::new(table, best_entries.unwrap_or_default());
        if merge.goodness() <= min_goodness {
            return Merge::empty(table);
        }
        covered = covered_aliases(table, &merge, aliases);
    }
    merge
}
