// SPDX-License-Identifier: AGPL-3.0-only

//! Ternary routing table entries and their algebra.
//!
//! A router entry matches a 32-bit key when `key & mask == entry.key`. Each
//! bit is therefore one of:
//!
//! | key | mask | meaning |
//! |-----|------|---------|
//! | 0 | 1 | must be `0` |
//! | 1 | 1 | must be `1` |
//! | 0 | 0 | don't care (`X`) |
//! | 1 | 0 | can never match (`!`) |
//!
//! Well-formed entries never contain `!` bits.

use std::fmt;

use spinn_chip::RouteSet;

/// One multicast routing rule.
///
/// `sources` records the directions packets matching this entry arrive
/// from. It is only consulted by default-route elision; an empty set means
/// the source is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingTableEntry {
    /// Where matching packets are sent.
    pub route: RouteSet,
    /// Match key.
    pub key: u32,
    /// Match mask.
    pub mask: u32,
    /// Where matching packets arrive from.
    pub sources: RouteSet,
}

/// Outcome of [`RoutingTableEntry::is_subset_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    /// Some key matched by the first entry is not matched by the second.
    No,
    /// Every key is matched by the second entry with the same route.
    Yes,
    /// Every key is matched by the second entry, but it routes differently.
    RouteMismatch,
}

/// Number of `X` bits in a key/mask pair.
#[must_use]
pub const fn generality(key: u32, mask: u32) -> u32 {
    (!key & !mask).count_ones()
}

/// True when some key is matched by both key/mask pairs.
#[must_use]
pub const fn intersect(key_a: u32, mask_a: u32, key_b: u32, mask_b: u32) -> bool {
    (key_a ^ key_b) & mask_a & mask_b == 0
}

impl RoutingTableEntry {
    /// Entry with unknown sources.
    #[must_use]
    pub const fn new(route: RouteSet, key: u32, mask: u32) -> Self {
        Self {
            route,
            key,
            mask,
            sources: RouteSet::empty(),
        }
    }

    /// Set the source directions.
    #[must_use]
    pub const fn with_sources(mut self, sources: RouteSet) -> Self {
        self.sources = sources;
        self
    }

    /// True when `key` is matched by this entry.
    #[must_use]
    pub const fn matches(&self, key: u32) -> bool {
        key & self.mask == self.key
    }

    /// Number of don't-care bits; higher is more general.
    #[must_use]
    pub const fn generality(&self) -> u32 {
        generality(self.key, self.mask)
    }

    /// True when the entry contains no `!` bits.
    #[must_use]
    pub const fn is_well_formed(&self) -> bool {
        self.key & !self.mask == 0
    }

    /// True when some key is matched by both entries.
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        intersect(self.key, self.mask, other.key, other.mask)
    }

    /// True when every key this entry matches is also matched by `other`.
    #[must_use]
    pub const fn keyspace_within(&self, other: &Self) -> bool {
        other.mask & !self.mask == 0 && (self.key ^ other.key) & other.mask == 0
    }

    /// Whether `other` matches every key this entry matches, and with what
    /// routing consequence.
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> Subset {
        if !self.keyspace_within(other) {
            Subset::No
        } else if self.route == other.route {
            Subset::Yes
        } else {
            Subset::RouteMismatch
        }
    }

    /// A single entry matching exactly the keys of `self` and `other`.
    ///
    /// Only loss-less merges are produced: the two entries must share a
    /// route and either one contains the other, or both have the same mask
    /// and keys differing in exactly one cared-about bit. Sources are
    /// combined.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Option<Self> {
        if self.route != other.route {
            return None;
        }
        let sources = self.sources.union(other.sources);
        if self.keyspace_within(other) {
            return Some(other.with_sources(sources));
        }
        if other.keyspace_within(self) {
            return Some(self.with_sources(sources));
        }
        let diff = (self.key ^ other.key) & self.mask;
        if self.mask == other.mask && diff.count_ones() == 1 {
            let mask = self.mask & !diff;
            return Some(Self {
                route: self.route,
                key: self.key & mask,
                mask,
                sources,
            });
        }
        None
    }
}

impl fmt::Display for RoutingTableEntry {
    /// `XX01…` ternary pattern, MSB first, then the route initials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in (0..32).rev() {
            let k = (self.key >> bit) & 1;
            let m = (self.mask >> bit) & 1;
            let c = match (k, m) {
                (0, 0) => 'X',
                (1, 0) => '!',
                (0, _) => '0',
                _ => '1',
            };
            write!(f, "{c}")?;
        }
        write!(f, " -> {}", self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spinn_chip::Route;

    fn rte(route: Route, key: u32, mask: u32) -> RoutingTableEntry {
        RoutingTableEntry::new(RouteSet::single(route), key, mask)
    }

    #[test]
    fn generality_counts_xs() {
        assert_eq!(generality(0x0, 0x0), 32);
        assert_eq!(generality(0x1, 0x1), 31);
        assert_eq!(generality(0xFFFF_FFFF, 0xFFFF_FFFF), 0);
        assert_eq!(generality(0x7FFF_FFFF, 0x8000_0000), 0);
    }

    #[test]
    fn display_bits_and_routes() {
        let e = RoutingTableEntry::new(RouteSet::empty(), 0x0, 0x1);
        assert!(e.to_string().starts_with(&format!("{}0", "X".repeat(31))));

        let e = RoutingTableEntry::new(RouteSet::empty(), 0x8000_0000, 0x8000_0000);
        assert!(e.to_string().starts_with(&format!("1{}", "X".repeat(31))));

        let e = RoutingTableEntry::new(RouteSet::empty(), 0xFFFF_FFFF, 0);
        assert!(e.to_string().contains(&"!".repeat(32)));

        let routes: RouteSet = [Route::core(1).unwrap(), Route::EAST, Route::SOUTH]
            .into_iter()
            .collect();
        let e = RoutingTableEntry::new(routes, 0, 0);
        assert!(e.to_string().ends_with("E S 1"));
    }

    #[test]
    fn matching_and_intersection() {
        let a = rte(Route::NORTH, 0b0100, 0b1100); // 01XX
        assert!(a.matches(0b0101));
        assert!(!a.matches(0b1101));

        let b = rte(Route::NORTH, 0b0010, 0b0010); // XX1X
        let c = rte(Route::NORTH, 0b1000, 0b1000); // 1XXX
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(!RoutingTableEntry::new(RouteSet::empty(), 0b10, 0b01).is_well_formed());
    }

    #[test]
    fn subset_reports_route_mismatch() {
        let specific = rte(Route::NORTH, 0b0101, 0b1111);
        let general = rte(Route::NORTH, 0b0100, 0b1100);
        let other_route = rte(Route::SOUTH, 0b0100, 0b1100);
        assert_eq!(specific.is_subset_of(&general), Subset::Yes);
        assert_eq!(general.is_subset_of(&specific), Subset::No);
        assert_eq!(specific.is_subset_of(&other_route), Subset::RouteMismatch);
    }

    #[test]
    fn merge_adjacent_pairs() {
        let a = rte(Route::NORTH, 0b0000, 0b1111);
        let b = rte(Route::NORTH, 0b0001, 0b1111);
        let merged = a.merge(&b).unwrap();
        assert_eq!((merged.key, merged.mask), (0b0000, 0b1110));

        // Two differing bits would also match 0b0010 and 0b0001.
        let c = rte(Route::NORTH, 0b0011, 0b1111);
        assert_eq!(a.merge(&c), None);

        // Different routes never merge.
        let d = rte(Route::SOUTH, 0b0001, 0b1111);
        assert_eq!(a.merge(&d), None);

        // Containment yields the larger entry.
        let wide = rte(Route::NORTH, 0b0000, 0b1100);
        assert_eq!(a.merge(&wide).map(|e| (e.key, e.mask)), Some((0b0000, 0b1100)));
    }

    #[test]
    fn merge_combines_sources() {
        let a = rte(Route::EAST, 0x0, 0xF).with_sources(RouteSet::single(Route::NORTH));
        let b = rte(Route::EAST, 0x1, 0xF).with_sources(RouteSet::single(Route::SOUTH));
        let merged = a.merge(&b).unwrap();
        assert!(merged.sources.contains(Route::NORTH));
        assert!(merged.sources.contains(Route::SOUTH));
    }
}
