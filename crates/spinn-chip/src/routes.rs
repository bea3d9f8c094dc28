// SPDX-License-Identifier: AGPL-3.0-only

//! Multicast route identifiers.
//!
//! Each chip's router forwards a multicast packet to any subset of its six
//! inter-chip links and eighteen local cores. A route set is the 24-bit
//! field stored in every router entry:
//!
//! ```text
//! bit  0  1   2  3  4   5  6 .. 23
//!      E  NE  N  W  SW  S  core 0 .. core 17
//! ```

use std::fmt;

/// Number of inter-chip links per chip.
pub const NUM_LINKS: u8 = 6;

/// Number of cores addressable by a route.
pub const NUM_CORES: u8 = 18;

/// One of the six inter-chip links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Link {
    /// East.
    East = 0,
    /// North-east.
    NorthEast = 1,
    /// North.
    North = 2,
    /// West.
    West = 3,
    /// South-west.
    SouthWest = 4,
    /// South.
    South = 5,
}

impl Link {
    /// All links in route-bit order.
    pub const ALL: [Self; 6] = [
        Self::East,
        Self::NorthEast,
        Self::North,
        Self::West,
        Self::SouthWest,
        Self::South,
    ];

    /// The link pointing the other way.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::East => Self::West,
            Self::NorthEast => Self::SouthWest,
            Self::North => Self::South,
            Self::West => Self::East,
            Self::SouthWest => Self::NorthEast,
            Self::South => Self::North,
        }
    }

    /// Short name used in table dumps.
    #[must_use]
    pub const fn initial(self) -> &'static str {
        match self {
            Self::East => "E",
            Self::NorthEast => "NE",
            Self::North => "N",
            Self::West => "W",
            Self::SouthWest => "SW",
            Self::South => "S",
        }
    }
}

/// A single routing destination: a link or a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route(u8);

impl Route {
    /// East link.
    pub const EAST: Self = Self(0);
    /// North-east link.
    pub const NORTH_EAST: Self = Self(1);
    /// North link.
    pub const NORTH: Self = Self(2);
    /// West link.
    pub const WEST: Self = Self(3);
    /// South-west link.
    pub const SOUTH_WEST: Self = Self(4);
    /// South link.
    pub const SOUTH: Self = Self(5);

    /// Route bit index, `0..24`.
    #[must_use]
    pub const fn from_bit(bit: u8) -> Option<Self> {
        if bit < NUM_LINKS + NUM_CORES {
            Some(Self(bit))
        } else {
            None
        }
    }

    /// Route to local core `n` (`0..=17`).
    #[must_use]
    pub const fn core(n: u8) -> Option<Self> {
        if n < NUM_CORES {
            Some(Self(NUM_LINKS + n))
        } else {
            None
        }
    }

    /// Bit index within a route set.
    #[must_use]
    pub const fn bit(self) -> u8 {
        self.0
    }

    /// True for the six inter-chip links.
    #[must_use]
    pub const fn is_link(self) -> bool {
        self.0 < NUM_LINKS
    }

    /// True for local cores.
    #[must_use]
    pub const fn is_core(self) -> bool {
        !self.is_link()
    }

    /// The link this route leaves through, if any.
    #[must_use]
    pub const fn link(self) -> Option<Link> {
        if self.is_link() {
            Some(Link::ALL[self.0 as usize])
        } else {
            None
        }
    }

    /// Core number for core routes.
    #[must_use]
    pub const fn core_num(self) -> Option<u8> {
        if self.is_core() {
            Some(self.0 - NUM_LINKS)
        } else {
            None
        }
    }

    /// Opposite link; `None` for cores.
    #[must_use]
    pub const fn opposite(self) -> Option<Self> {
        match self.link() {
            Some(link) => Some(Self::from_link(link.opposite())),
            None => None,
        }
    }

    /// Route for a link.
    #[must_use]
    pub const fn from_link(link: Link) -> Self {
        Self(link as u8)
    }
}

impl From<Link> for Route {
    fn from(link: Link) -> Self {
        Self::from_link(link)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.link() {
            Some(link) => f.write_str(link.initial()),
            None => write!(f, "{}", self.0 - NUM_LINKS),
        }
    }
}

/// Error returned when a route name cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRouteError(pub String);

impl fmt::Display for ParseRouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid route '{}'", self.0)
    }
}

impl std::error::Error for ParseRouteError {}

impl std::str::FromStr for Route {
    type Err = ParseRouteError;

    /// Accepts link initials (`E`, `NE`, `N`, `W`, `SW`, `S`, any case) or a
    /// core number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if let Some(link) = Link::ALL.iter().find(|l| l.initial() == upper) {
            return Ok(Self::from_link(*link));
        }
        s.parse::<u8>()
            .ok()
            .and_then(Self::core)
            .ok_or_else(|| ParseRouteError(s.to_string()))
    }
}

// ── Route sets ───────────────────────────────────────────────────────────────

/// Set of routes, stored as the router's 24-bit route field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteSet(u32);

impl RouteSet {
    /// Mask of valid route bits.
    pub const VALID_BITS: u32 = (1 << (NUM_LINKS + NUM_CORES)) - 1;

    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from a raw router route field; bits above 23 are discarded.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::VALID_BITS)
    }

    /// Raw route field.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Set containing only `route`.
    #[must_use]
    pub const fn single(route: Route) -> Self {
        Self(1 << route.bit())
    }

    /// Add a route.
    pub fn insert(&mut self, route: Route) {
        self.0 |= 1 << route.bit();
    }

    /// Membership test.
    #[must_use]
    pub const fn contains(self, route: Route) -> bool {
        self.0 & (1 << route.bit()) != 0
    }

    /// Number of routes.
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// True when no routes are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The single member, if the set has exactly one.
    #[must_use]
    pub fn only(self) -> Option<Route> {
        if self.len() == 1 {
            Route::from_bit(self.0.trailing_zeros() as u8)
        } else {
            None
        }
    }

    /// Routes in ascending bit order.
    pub fn iter(self) -> impl Iterator<Item = Route> {
        (0..NUM_LINKS + NUM_CORES)
            .filter(move |b| self.0 & (1 << b) != 0)
            .filter_map(Route::from_bit)
    }
}

impl FromIterator<Route> for RouteSet {
    fn from_iter<I: IntoIterator<Item = Route>>(iter: I) -> Self {
        let mut set = Self::empty();
        for route in iter {
            set.insert(route);
        }
        set
    }
}

impl From<Route> for RouteSet {
    fn from(route: Route) -> Self {
        Self::single(route)
    }
}

impl fmt::Display for RouteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for route in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{route}")?;
            first = false;
        }
        Ok(())
    }
}
