// SPDX-License-Identifier: AGPL-3.0-only

//! Default-route elision.
//!
//! A packet that matches no router entry leaves through the link opposite
//! the one it arrived on. Entries that do exactly that can be dropped,
//! provided no later entry would then catch their keys.

use tracing::debug;

use crate::entry::RoutingTableEntry;
use crate::error::{Result, RoutingError};
use crate::table::is_default_routable;

/// Remove every entry that default routing would reproduce.
///
/// # Errors
///
/// [`RoutingError::MinimisationFailed`] if the remaining table is longer
/// than `target_length`.
pub fn minimise(
    table: &[RoutingTableEntry],
    target_length: Option<usize>,
) -> Result<Vec<RoutingTableEntry>> {
    let new_table: Vec<RoutingTableEntry> = table
        .iter()
        .enumerate()
        .filter(|&(i, entry)| !is_defaultable(i, entry, table))
        .map(|(_, entry)| *entry)
        .collect();

    debug!(removed = table.len() - new_table.len(), "Default-routed entries removed");

    match target_length {
        Some(target) if new_table.len() > target => {
            Err(RoutingError::minimisation_failed(target, new_table.len()))
        }
        _ => Ok(new_table),
    }
}

fn is_defaultable(i: usize, entry: &RoutingTableEntry, table: &[RoutingTableEntry]) -> bool {
    is_default_routable(entry) && !table[i + 1..].iter().any(|d| entry.intersects(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spinn_chip::{Route, RouteSet};

    fn rte(route: Route, key: u32, mask: u32, sources: &[Route]) -> RoutingTableEntry {
        RoutingTableEntry::new(RouteSet::single(route), key, mask)
            .with_sources(sources.iter().copied().collect())
    }

    #[test]
    fn orthogonal_table() {
        let core1 = Route::core(1).unwrap();
        let table = vec![
            rte(Route::NORTH, 0x0, 0xF, &[Route::SOUTH]), // removed
            rte(Route::NORTH, 0x1, 0xF, &[Route::NORTH]),
            rte(Route::NORTH, 0x2, 0xF, &[]),
            RoutingTableEntry::new([Route::NORTH, Route::SOUTH].into_iter().collect(), 0x3, 0xF)
                .with_sources([Route::NORTH, Route::SOUTH].into_iter().collect()),
            rte(core1, 0x4, 0xF, &[core1]),
        ];
        assert_eq!(minimise(&table, Some(table.len() - 1)).unwrap(), table[1..].to_vec());
    }

    #[test]
    fn aliased_entries_are_kept() {
        let table = vec![
            rte(Route::NORTH, 0x8, 0xF, &[Route::SOUTH]), // removed
            rte(Route::NORTH, 0x0, 0xF, &[Route::SOUTH]), // caught by 0XXX below
            rte(Route::NORTH, 0x0, 0x8, &[]),
        ];
        assert_eq!(minimise(&table, None).unwrap(), table[1..].to_vec());
    }

    #[test]
    fn oversized_result_fails() {
        let table: Vec<_> = (0..10).map(|i| rte(Route::NORTH, i, 0xF, &[])).collect();
        let err = minimise(&table, Some(5)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('5'));
    }
}
