// SPDX-License-Identifier: AGPL-3.0-only

//! Whole-table utilities: resolution, expansion, equivalence checking,
//! validation and a plain-text table format.

use std::collections::HashSet;
use std::fmt::Write as _;

use spinn_chip::{Route, RouteSet};
use tracing::warn;

use crate::entry::RoutingTableEntry;
use crate::error::{Result, RoutingError};

/// Routes a key resolves to: the first matching entry wins.
#[must_use]
pub fn resolve(table: &[RoutingTableEntry], key: u32) -> Option<RouteSet> {
    table.iter().find(|e| e.matches(key)).map(|e| e.route)
}

/// Mask of bits that are `X` in every entry.
#[must_use]
pub fn common_xs(entries: &[RoutingTableEntry]) -> u32 {
    let (key, mask) = entries
        .iter()
        .fold((0u32, 0u32), |(k, m), e| (k | e.key, m | e.mask));
    !(key | mask)
}

/// Replace every `X` not in `ignore_xs` with both `0` and `1`.
///
/// Entries are produced in ascending key order of the expanded bits, most
/// significant `X` first.
#[must_use]
pub fn expand_entry(entry: &RoutingTableEntry, ignore_xs: u32) -> Vec<RoutingTableEntry> {
    let xs = !entry.key & !entry.mask & !ignore_xs;
    let mut out = vec![*entry];
    for bit in (0..32).rev().map(|i| 1u32 << i).filter(|b| xs & b != 0) {
        out = out
            .into_iter()
            .flat_map(|e| {
                let zero = RoutingTableEntry { mask: e.mask | bit, ..e };
                let one = RoutingTableEntry { key: e.key | bit, ..zero };
                [zero, one]
            })
            .collect();
    }
    out
}

/// Expand all entries, dropping keys already produced by an earlier entry.
///
/// With `ignore_xs = None` the Xs common to every entry are left alone. The
/// result is always orthogonal; shadowed keys are reported with `warn!`.
#[must_use]
pub fn expand_entries(
    entries: &[RoutingTableEntry],
    ignore_xs: Option<u32>,
) -> Vec<RoutingTableEntry> {
    let ignore_xs = ignore_xs.unwrap_or_else(|| common_xs(entries));
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        for expanded in expand_entry(entry, ignore_xs) {
            if seen.insert(expanded.key) {
                out.push(expanded);
            } else {
                warn!(
                    key = format_args!("{:#010x}", expanded.key),
                    "Table is not orthogonal: key matches multiple entries"
                );
            }
        }
    }
    out
}

/// True when a packet arriving from the entry's single source would be
/// forwarded straight through by the router's default routing.
#[must_use]
pub fn is_default_routable(entry: &RoutingTableEntry) -> bool {
    match (entry.sources.only(), entry.route.only()) {
        (Some(source), Some(sink)) => {
            source.is_link() && sink.is_link() && source.opposite() == Some(sink)
        }
        _ => false,
    }
}

/// True when every key matched by `a` resolves to the same route in `b`.
///
/// Keys `b` does not match at all are accepted when default routing would
/// deliver them correctly.
#[must_use]
pub fn table_is_subset_of(a: &[RoutingTableEntry], b: &[RoutingTableEntry]) -> bool {
    let ignore = common_xs(b);
    expand_entries(a, Some(ignore)).iter().all(|entry| {
        match b.iter().find(|other| other.mask & entry.key == other.key) {
            Some(other) => other.route == entry.route,
            None => is_default_routable(entry),
        }
    })
}

/// Reject tables the minimiser cannot take as input.
///
/// Entries that share a key must also share a route; which of two
/// conflicting routes a key takes would otherwise depend on table order.
///
/// # Errors
///
/// - [`RoutingError::MalformedEntry`] for entries with key bits outside the
///   mask.
/// - [`RoutingError::NonOrthogonal`] for the first pair of entries with
///   different routes that match a common key.
pub fn validate(table: &[RoutingTableEntry]) -> Result<()> {
    if let Some((index, e)) = table.iter().enumerate().find(|(_, e)| !e.is_well_formed()) {
        return Err(RoutingError::MalformedEntry {
            index,
            key: e.key,
            mask: e.mask,
        });
    }
    for (i, a) in table.iter().enumerate() {
        for (j, b) in table.iter().enumerate().skip(i + 1) {
            if a.route != b.route && a.intersects(b) {
                return Err(RoutingError::NonOrthogonal {
                    first: i,
                    second: j,
                    key: a.key | b.key,
                });
            }
        }
    }
    Ok(())
}

// ── Text format ──────────────────────────────────────────────────────────────
//
//     # key        mask        routes     [sources]
//     0x00000000   0x0000000f  N,NE
//     0x00000001   0x0000000f  E          W

fn parse_u32(token: &str) -> Option<u32> {
    token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .map_or_else(|| token.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok())
}

fn parse_routes(token: &str) -> std::result::Result<RouteSet, String> {
    if token == "-" {
        return Ok(RouteSet::empty());
    }
    token
        .split(',')
        .map(|r| r.parse::<Route>().map_err(|e| e.to_string()))
        .collect()
}

/// Parse the whitespace-separated table format.
///
/// Each line is `key mask routes [sources]`; routes and sources are
/// comma-separated link initials or core numbers (`-` for none). Blank lines
/// and `#` comments are skipped.
///
/// # Errors
///
/// [`RoutingError::Parse`] naming the first bad line.
pub fn parse_table(text: &str) -> Result<Vec<RoutingTableEntry>> {
    let mut table = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(3..=4).contains(&fields.len()) {
            return Err(RoutingError::parse(n + 1, "expected: key mask routes [sources]"));
        }
        let key = parse_u32(fields[0])
            .ok_or_else(|| RoutingError::parse(n + 1, format!("bad key '{}'", fields[0])))?;
        let mask = parse_u32(fields[1])
            .ok_or_else(|| RoutingError::parse(n + 1, format!("bad mask '{}'", fields[1])))?;
        let route = parse_routes(fields[2]).map_err(|e| RoutingError::parse(n + 1, e))?;
        let sources = match fields.get(3) {
            Some(s) => parse_routes(s).map_err(|e| RoutingError::parse(n + 1, e))?,
            None => RouteSet::empty(),
        };
        table.push(RoutingTableEntry::new(route, key, mask).with_sources(sources));
    }
    Ok(table)
}

fn format_routes(routes: RouteSet) -> String {
    if routes.is_empty() {
        return "-".to_string();
    }
    routes.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(",")
}

/// Render a table in the format accepted by [`parse_table`].
#[must_use]
pub fn format_table(table: &[RoutingTableEntry]) -> String {
    let mut out = String::new();
    for e in table {
        let _ = write!(out, "{:#010x} {:#010x} {}", e.key, e.mask, format_routes(e.route));
        if !e.sources.is_empty() {
            let _ = write!(out, " {}", format_routes(e.sources));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rte(route: Route, key: u32, mask: u32) -> RoutingTableEntry {
        RoutingTableEntry::new(RouteSet::single(route), key, mask)
    }

    #[test]
    fn common_xs_of_entries() {
        let entries = [
            rte(Route::NORTH, 0b0100, 0xFFFF_FFF0 | 0b1100), // 01XX
            rte(Route::NORTH, 0b0010, 0xFFFF_FFF0 | 0b0010), // XX1X
        ];
        assert_eq!(common_xs(&entries), 0x0000_0001);

        let entries = [
            rte(Route::NORTH, 0b0100, 0x7FFF_FFF0 | 0b1101),
            rte(Route::NORTH, 0b0001, 0x7FFF_FFF0 | 0b0001),
        ];
        assert_eq!(common_xs(&entries), 0x8000_0002);
    }

    #[test]
    fn expand_single_entry() {
        let entry = RoutingTableEntry::new(RouteSet::empty(), 0b0100, 0xFFFF_FFF0 | 0b1100);
        let keys: Vec<(u32, u32)> = expand_entry(&entry, 0xFFFF_FFF1)
            .into_iter()
            .map(|e| (e.key, e.mask))
            .collect();
        assert_eq!(
            keys,
            vec![(0b0100, 0xFFFF_FFF0 | 0b1110), (0b0110, 0xFFFF_FFF0 | 0b1110)]
        );
    }

    #[test]
    fn expand_entries_drops_shadowed_keys() {
        let entries = [
            rte(Route::EAST, 0b0000, 0b1111), // 0000
            rte(Route::WEST, 0b0000, 0b1011), // 0X00
        ];
        let expanded = expand_entries(&entries, None);
        let keys: Vec<(u32, u32)> = expanded.iter().map(|e| (e.key, e.mask)).collect();
        // Bits above 3 are common Xs and stay unexpanded.
        assert_eq!(keys, vec![(0b0000, 0b1111), (0b0100, 0b1111)]);
    }

    #[test]
    fn subset_detects_route_changes_and_misses() {
        let a = [rte(Route::NORTH, 0x0, 0xFFFF_FFFF), rte(Route::WEST, 0x1, 0xFFFF_FFFF)];
        assert!(!table_is_subset_of(&a, &[rte(Route::NORTH, 0x0, 0x0)]));
        assert!(!table_is_subset_of(&a, &[rte(Route::NORTH, 0x8, 0x8)]));

        let b = [rte(Route::WEST, 0x1, 0x1), rte(Route::NORTH, 0x0, 0x0)];
        assert!(table_is_subset_of(&a, &b));
    }

    #[test]
    fn subset_accepts_default_routed_keys() {
        let a = [
            rte(Route::NORTH, 0x0, 0xFFFF_FFFF).with_sources(RouteSet::single(Route::SOUTH)),
            rte(Route::WEST, 0x1, 0xFFFF_FFFF),
        ];
        assert!(table_is_subset_of(&a, &a[1..]));

        let two_sources: RouteSet = [Route::SOUTH, Route::WEST].into_iter().collect();
        let a = [
            rte(Route::NORTH, 0x0, 0xFFFF_FFFF).with_sources(two_sources),
            rte(Route::WEST, 0x1, 0xFFFF_FFFF),
        ];
        assert!(!table_is_subset_of(&a, &a[1..]));
    }

    #[test]
    fn subset_uses_common_xs_of_other_table() {
        let a = [rte(Route::WEST, 0x0, 0xFFFF_FFFE), rte(Route::WEST, 0x0, 0xFFFF_FFFC)];
        let b = [rte(Route::WEST, 0x0, 0xFFFF_FFFF), rte(Route::WEST, 0x2, 0xFFFF_FFFE)];
        assert!(!table_is_subset_of(&a, &b));
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let malformed = [rte(Route::NORTH, 0b11, 0b01)];
        assert!(matches!(
            validate(&malformed),
            Err(RoutingError::MalformedEntry { index: 0, .. })
        ));

        // Same keyspace, different routes.
        let contradictory = [rte(Route::NORTH, 0x4, 0xF), rte(Route::SOUTH, 0x4, 0xF)];
        assert!(matches!(
            validate(&contradictory),
            Err(RoutingError::NonOrthogonal { first: 0, second: 1, .. })
        ));

        // An exception inside a general rule, in either order.
        let inverted = [rte(Route::NORTH, 0x0, 0xC), rte(Route::SOUTH, 0x1, 0xF)];
        assert!(validate(&inverted).is_err());
        let ordered = [rte(Route::SOUTH, 0x1, 0xF), rte(Route::NORTH, 0x0, 0xC)];
        assert!(matches!(
            validate(&ordered),
            Err(RoutingError::NonOrthogonal { first: 0, second: 1, key: 0x1 })
        ));

        // Equally general patterns crossing at 0b00.
        let crossed = [rte(Route::NORTH, 0b00, 0b10), rte(Route::SOUTH, 0b00, 0b01)];
        assert!(matches!(
            validate(&crossed),
            Err(RoutingError::NonOrthogonal { first: 0, second: 1, .. })
        ));
    }

    #[test]
    fn validate_accepts_overlap_on_the_same_route() {
        let table = [
            rte(Route::NORTH, 0x0, 0xC),
            rte(Route::NORTH, 0x1, 0xF),
            rte(Route::SOUTH, 0x4, 0xF),
        ];
        assert!(validate(&table).is_ok());
    }

    #[test]
    fn text_format() {
        let text = "\
            # key mask routes sources\n\
            0x0 0xf N,NE\n\
            1 0xF 3 W\n\
            \n\
            0x2 0xe - \n";
        let table = parse_table(text).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table[0].route.len(), 2);
        assert_eq!(table[1].route.only(), Route::core(3));
        assert_eq!(table[1].sources.only(), Some(Route::WEST));
        assert!(table[2].route.is_empty());

        assert_eq!(parse_table(&format_table(&table)).unwrap(), table);

        let err = parse_table("0x0 0xf N\nzz 0xf N\n").unwrap_err();
        assert_eq!(err, RoutingError::parse(2, "bad key 'zz'"));
    }
}
