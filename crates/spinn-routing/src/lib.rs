// SPDX-License-Identifier: AGPL-3.0-only

#![deny(unsafe_code)]

//! SpiNNaker multicast routing table minimisation
//!
//! Each chip's router holds at most 1024 ternary `(key, mask) -> routes`
//! entries and uses the first one that matches. Tables produced from
//! routing trees are usually far larger than that; this crate compresses
//! them while keeping every routed key on the same route.
//!
//! # Algorithms
//!
//! - **Ordered covering** ([`ordered_covering`]): greedy merge search over
//!   a generality-sorted table with up/down alias checks.
//! - **Default-route removal** ([`remove_default_routes`]): drop entries the
//!   router would reproduce by forwarding straight through. Opt-in via
//!   [`MinimiseConfig::with_default_routing`].
//!
//! # Example
//!
//! ```
//! use spinn_chip::{Route, RouteSet};
//! use spinn_routing::{minimise, RoutingTableEntry};
//!
//! let north = RouteSet::single(Route::NORTH);
//! let table: Vec<_> = (0..4).map(|k| RoutingTableEntry::new(north, k, 0xF)).collect();
//!
//! let small = minimise(&table, None)?;
//! assert_eq!(small, vec![RoutingTableEntry::new(north, 0x0, 0xC)]);
//! # Ok::<(), spinn_routing::RoutingError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod entry;
mod error;
mod minimise;
pub mod ordered_covering;
pub mod remove_default_routes;
pub mod table;

pub use entry::{generality, intersect, RoutingTableEntry, Subset};
pub use error::{Result, RoutingError};
pub use minimise::{minimise, minimise_all, minimise_table, MinimiseConfig, Strategy, TargetLengths};
pub use table::{
    common_xs, expand_entries, expand_entry, format_table, parse_table, resolve,
    table_is_subset_of, validate,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        minimise, minimise_all, MinimiseConfig, Result, RoutingError, RoutingTableEntry,
        TargetLengths,
    };
}
